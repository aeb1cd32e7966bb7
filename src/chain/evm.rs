//! EVM-family adapter
//!
//! Submits a signed contract call through an [`EvmRpc`] and reports a
//! submission as confirmed only once its receipt is buried under the
//! configured number of blocks. Confirmation depth per chain:
//! - Ethereum: 32 blocks
//! - Polygon: 128 blocks
//! - Arbitrum: 64 blocks (soft finality)
//! - Avalanche: 1 block

use super::fee::{FeeEstimator, GasPrice};
use super::{ChainAdapter, ChainOperation, NetworkFee, PendingHandle, SubmissionStatus};
use crate::config::ChainConfig;
use crate::error::{MediatorError, MediatorResult};
use crate::types::ChainId;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MEDIATE_SIGNATURE: &str = "mediate(bytes32,bytes32,bytes32,uint8,uint256)";

/// Mined receipt as seen by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block_number: u64,
    pub success: bool,
}

/// Minimal JSON-RPC surface the EVM adapter needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvmRpc: Send + Sync {
    async fn block_number(&self) -> MediatorResult<u64>;

    async fn gas_price(&self) -> MediatorResult<GasPrice>;

    /// Sign and broadcast a call, returning the transaction hash
    async fn send_call(
        &self,
        to: &str,
        data: Vec<u8>,
        gas_limit: u64,
        gas_price: GasPrice,
    ) -> MediatorResult<String>;

    async fn receipt(&self, tx_hash: &str) -> MediatorResult<Option<ReceiptInfo>>;
}

pub struct EvmAdapter {
    chain: ChainId,
    rpc: Arc<dyn EvmRpc>,
    contract_address: String,
    confirmation_blocks: u64,
    gas_limit: u64,
    estimator: FeeEstimator,
    /// Inclusion block of receipts seen so far: tx hash -> block number
    included: DashMap<String, u64>,
}

impl EvmAdapter {
    pub fn new(config: &ChainConfig, rpc: Arc<dyn EvmRpc>) -> MediatorResult<Self> {
        let address = config.contract_address.trim_start_matches("0x");
        if address.len() != 40 || hex::decode(address).is_err() {
            return Err(MediatorError::Config(format!(
                "invalid contract address for {}: {}",
                config.chain, config.contract_address
            )));
        }

        Ok(Self {
            chain: config.chain,
            rpc,
            contract_address: config.contract_address.clone(),
            confirmation_blocks: config.confirmations(),
            gas_limit: config.gas_limit,
            estimator: FeeEstimator::new(),
            included: DashMap::new(),
        })
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    async fn current_price(&self) -> MediatorResult<GasPrice> {
        let price = self.rpc.gas_price().await?;
        Ok(self.estimator.buffered_price(&price))
    }

    fn check_chain(&self, op: &ChainOperation) -> MediatorResult<()> {
        if op.chain != self.chain {
            return Err(MediatorError::Internal(format!(
                "operation for {} routed to {} adapter",
                op.chain, self.chain
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn submit(&self, op: &ChainOperation) -> MediatorResult<PendingHandle> {
        self.check_chain(op)?;

        let gas_price = self.current_price().await?;
        let gas_limit = self.estimator.buffered_gas_limit(self.gas_limit);
        let data = encode_call(op);

        let tx_hash = self
            .rpc
            .send_call(&self.contract_address, data, gas_limit, gas_price)
            .await?;

        info!(
            "Submitted {} {} on {} as {}",
            op.kind, op.tx_id, self.chain, tx_hash
        );
        Ok(PendingHandle {
            chain: self.chain,
            reference: tx_hash,
            submitted_at: Utc::now(),
        })
    }

    async fn query(&self, handle: &PendingHandle) -> MediatorResult<SubmissionStatus> {
        let receipt = match self.rpc.receipt(&handle.reference).await? {
            Some(receipt) => receipt,
            None => {
                if let Some((_, block)) = self.included.remove(&handle.reference) {
                    warn!(
                        "Reorg detected: {} no longer included on {} (was block {})",
                        handle.reference, self.chain, block
                    );
                }
                return Ok(SubmissionStatus::Pending);
            }
        };

        if !receipt.success {
            self.included.remove(&handle.reference);
            return Ok(SubmissionStatus::Failed {
                reason: format!("reverted in block {}", receipt.block_number),
            });
        }

        if let Some(previous) = self
            .included
            .insert(handle.reference.clone(), receipt.block_number)
        {
            if previous != receipt.block_number {
                warn!(
                    "{} moved from block {} to {} on {}",
                    handle.reference, previous, receipt.block_number, self.chain
                );
            }
        }

        let current = self.rpc.block_number().await?;
        let confirmations = current.saturating_sub(receipt.block_number);
        if confirmations >= self.confirmation_blocks {
            self.included.remove(&handle.reference);
            info!(
                "Transaction {} finalized on {} ({} confirmations)",
                handle.reference, self.chain, confirmations
            );
            return Ok(SubmissionStatus::Confirmed);
        }

        debug!(
            "Transaction {} has {} / {} confirmations on {}",
            handle.reference, confirmations, self.confirmation_blocks, self.chain
        );
        Ok(SubmissionStatus::Pending)
    }

    async fn estimate_fee(&self, op: &ChainOperation) -> MediatorResult<NetworkFee> {
        self.check_chain(op)?;
        let gas_price = self.current_price().await?;
        let gas_limit = self.estimator.buffered_gas_limit(self.gas_limit);

        Ok(NetworkFee {
            chain: self.chain,
            amount: FeeEstimator::calculate_cost(gas_limit, &gas_price),
            unit: "wei".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        match self.rpc.block_number().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Health check failed for chain {}: {}", self.chain, e);
                false
            }
        }
    }
}

fn keccak(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// ABI-encode `mediate(txId, beneficiary, asset, kind, amount)`
pub fn encode_call(op: &ChainOperation) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 5 * 32);
    data.extend_from_slice(&keccak(MEDIATE_SIGNATURE.as_bytes())[..4]);

    // bytes32 values are left-aligned
    let mut tx_id = [0u8; 32];
    tx_id[..16].copy_from_slice(op.tx_id.as_bytes());
    data.extend_from_slice(&tx_id);

    let beneficiary = op.recipient.as_ref().unwrap_or(&op.account);
    data.extend_from_slice(&keccak(beneficiary.as_str().as_bytes()));

    let mut asset = [0u8; 32];
    let code = op.asset.code().as_bytes();
    asset[..code.len()].copy_from_slice(code);
    data.extend_from_slice(&asset);

    // uint values are right-aligned
    let mut kind = [0u8; 32];
    kind[31] = op.kind.code();
    data.extend_from_slice(&kind);

    let mut amount = [0u8; 32];
    amount[24..].copy_from_slice(&(op.amount.max(0) as u64).to_be_bytes());
    data.extend_from_slice(&amount);

    data
}
