//! Transaction record and its lifecycle

use crate::chain::{NetworkFee, PendingHandle};
use crate::error::{FailureReason, MediatorError, MediatorResult};
use crate::ledger::Reservation;
use crate::mediator::MediationQuote;
use crate::types::{AccountId, Asset, ChainId, DeviceId, TransactionId, TxKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Created,
    Quoted,
    Reserved,
    Submitted,
    Confirmed,
    Failed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Quoted => "quoted",
            TransactionStatus::Reserved => "reserved",
            TransactionStatus::Submitted => "submitted",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::RolledBack)
    }

    /// States in which nothing has been handed to a chain yet
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Created | TransactionStatus::Quoted | TransactionStatus::Reserved
        )
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Created, Quoted)
                | (Quoted, Reserved)
                | (Reserved, Submitted)
                | (Submitted, Confirmed)
                | (Created | Quoted | Reserved | Submitted, Failed)
                | (Failed, RolledBack)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the source chain of an operation comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainSource {
    /// The device's active binding
    Device(DeviceId),
    Chain(ChainId),
}

/// A user operation as submitted to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: TxKind,
    pub account: AccountId,
    pub source: ChainSource,
    /// Defaults to the source chain
    pub dest_chain: Option<ChainId>,
    /// Transfer beneficiary; defaults to the sender
    pub recipient: Option<AccountId>,
    pub asset: Asset,
    /// Source amount in minor units
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TransactionStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TxKind,
    pub account: AccountId,
    pub recipient: Option<AccountId>,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub asset: Asset,
    pub amount: i64,
    pub status: TransactionStatus,
    pub quote: Option<MediationQuote>,
    /// Open ledger holds placed for this transaction
    pub holds: Vec<Reservation>,
    pub handle: Option<PendingHandle>,
    pub network_fee: Option<NetworkFee>,
    pub failure: Option<Failure>,
    /// End of the lock-up for stake, farm and liquidity positions
    pub unlocks_at: Option<DateTime<Utc>>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(request: &OperationRequest, source_chain: ChainId, dest_chain: ChainId) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            kind: request.kind,
            account: request.account.clone(),
            recipient: request.recipient.clone(),
            source_chain,
            dest_chain,
            asset: request.asset,
            amount: request.amount,
            status: TransactionStatus::Created,
            quote: None,
            holds: Vec::new(),
            handle: None,
            network_fee: None,
            failure: None,
            unlocks_at: None,
            history: vec![StatusChange {
                status: TransactionStatus::Created,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Account credited by a transfer
    pub fn beneficiary(&self) -> &AccountId {
        self.recipient.as_ref().unwrap_or(&self.account)
    }

    pub fn transition(&mut self, next: TransactionStatus) -> MediatorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(MediatorError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        self.history.push(StatusChange { status: next, at: now });
        crate::metrics::record_transaction_transition(next.as_str());
        Ok(())
    }

    /// Move to `Failed` and record why
    pub fn fail(&mut self, reason: FailureReason, detail: impl Into<String>) -> MediatorResult<()> {
        self.transition(TransactionStatus::Failed)?;
        self.failure = Some(Failure {
            reason,
            detail: detail.into(),
        });
        Ok(())
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure.as_ref().map(|f| f.reason)
    }
}
