//! Adapter for non-EVM chains
//!
//! Custom chains expose a ledger-style API: an entry is posted, then its
//! state is polled until the ledger finalizes or rejects it. The network
//! fee is a flat amount per operation.

use super::{ChainAdapter, ChainOperation, NetworkFee, PendingHandle, SubmissionStatus};
use crate::error::{MediatorError, MediatorResult};
use crate::types::{AccountId, Asset, ChainId, TransactionId, TxKind};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Entry posted to a custom ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tx_id: TransactionId,
    pub kind: TxKind,
    pub account: AccountId,
    pub beneficiary: AccountId,
    pub asset: Asset,
    pub amount: i64,
}

/// State of a posted entry as reported by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Unknown,
    Queued,
    Final,
    Rejected(String),
}

/// Chain-specific SDK or service client
#[async_trait]
pub trait CustomChainClient: Send + Sync {
    /// Post an entry, returning the ledger's id for it
    async fn post_entry(&self, entry: LedgerEntry) -> MediatorResult<String>;

    async fn entry_state(&self, entry_id: &str) -> MediatorResult<EntryState>;

    async fn ping(&self) -> bool;
}

pub struct CustomAdapter {
    chain: ChainId,
    client: Arc<dyn CustomChainClient>,
    flat_fee: u64,
}

impl CustomAdapter {
    pub fn new(chain: ChainId, client: Arc<dyn CustomChainClient>, flat_fee: u64) -> Self {
        Self {
            chain,
            client,
            flat_fee,
        }
    }
}

#[async_trait]
impl ChainAdapter for CustomAdapter {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn submit(&self, op: &ChainOperation) -> MediatorResult<PendingHandle> {
        let entry = LedgerEntry {
            tx_id: op.tx_id,
            kind: op.kind,
            account: op.account.clone(),
            beneficiary: op.recipient.clone().unwrap_or_else(|| op.account.clone()),
            asset: op.asset,
            amount: op.amount,
        };

        let entry_id = self.client.post_entry(entry).await?;
        info!("Posted {} {} to {} as {}", op.kind, op.tx_id, self.chain, entry_id);

        Ok(PendingHandle {
            chain: self.chain,
            reference: entry_id,
            submitted_at: Utc::now(),
        })
    }

    async fn query(&self, handle: &PendingHandle) -> MediatorResult<SubmissionStatus> {
        let state = self.client.entry_state(&handle.reference).await?;
        debug!("Entry {} on {} is {:?}", handle.reference, self.chain, state);

        Ok(match state {
            EntryState::Queued => SubmissionStatus::Pending,
            EntryState::Final => SubmissionStatus::Confirmed,
            EntryState::Rejected(reason) => SubmissionStatus::Failed { reason },
            EntryState::Unknown => SubmissionStatus::Failed {
                reason: format!("entry {} unknown to {}", handle.reference, self.chain),
            },
        })
    }

    async fn estimate_fee(&self, _op: &ChainOperation) -> MediatorResult<NetworkFee> {
        if !self.client.ping().await {
            return Err(MediatorError::AdapterUnavailable {
                chain: self.chain,
                message: "ledger not reachable".to_string(),
            });
        }

        Ok(NetworkFee {
            chain: self.chain,
            amount: u128::from(self.flat_fee),
            unit: "native".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        self.client.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{SimulatedLedger, SimulatedOutcome};

    fn operation(recipient: Option<&str>) -> ChainOperation {
        ChainOperation {
            tx_id: TransactionId::new(),
            kind: TxKind::Transfer,
            chain: ChainId::PiNetwork,
            account: AccountId::new("alice"),
            recipient: recipient.map(AccountId::new),
            asset: Asset::Pi,
            amount: 250,
        }
    }

    #[tokio::test]
    async fn test_submit_then_query_until_final() {
        let ledger = Arc::new(SimulatedLedger::new(ChainId::PiNetwork));
        ledger.set_polls_to_finality(2);
        let adapter = CustomAdapter::new(ChainId::PiNetwork, ledger.clone(), 5);

        let handle = adapter.submit(&operation(Some("bob"))).await.unwrap();
        assert_eq!(ledger.posted()[0].beneficiary, AccountId::new("bob"));

        assert_eq!(adapter.query(&handle).await.unwrap(), SubmissionStatus::Pending);
        assert_eq!(adapter.query(&handle).await.unwrap(), SubmissionStatus::Confirmed);
        // idempotent once final
        assert_eq!(adapter.query(&handle).await.unwrap(), SubmissionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_failed() {
        let ledger = Arc::new(SimulatedLedger::new(ChainId::PiNetwork));
        ledger.set_outcome(SimulatedOutcome::Reject);
        let adapter = CustomAdapter::new(ChainId::PiNetwork, ledger, 0);

        let handle = adapter.submit(&operation(None)).await.unwrap();
        assert!(matches!(
            adapter.query(&handle).await.unwrap(),
            SubmissionStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_fee_requires_reachable_ledger() {
        let ledger = Arc::new(SimulatedLedger::new(ChainId::Zeropoint));
        let adapter = CustomAdapter::new(ChainId::Zeropoint, ledger.clone(), 7);

        let fee = adapter.estimate_fee(&operation(None)).await.unwrap();
        assert_eq!(fee.amount, 7);

        ledger.set_available(false);
        assert!(matches!(
            adapter.estimate_fee(&operation(None)).await,
            Err(MediatorError::AdapterUnavailable { .. })
        ));
        assert!(adapter.submit(&operation(None)).await.is_err());
    }
}
