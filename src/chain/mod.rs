//! Chain module - per-chain adapters behind one capability set
//!
//! This module provides:
//! - The `ChainAdapter` trait (submit, query, estimate fee)
//! - An EVM adapter that polls receipts to confirmation depth
//! - A custom adapter for non-EVM chains
//! - A registry that selects the adapter for a chain by lookup

pub mod custom;
pub mod evm;
pub mod fee;
pub mod nonce;
pub mod provider;
pub mod simulated;

pub use custom::{CustomAdapter, CustomChainClient, EntryState, LedgerEntry};
pub use evm::{EvmAdapter, EvmRpc, ReceiptInfo};
pub use fee::{FeeEstimator, GasPrice};
pub use provider::EthersRpc;
pub use simulated::{SimulatedLedger, SimulatedOutcome};

#[cfg(test)]
pub use evm::MockEvmRpc;

use crate::config::Settings;
use crate::error::{MediatorError, MediatorResult};
use crate::types::{AccountId, Asset, ChainFamily, ChainId, TransactionId, TxKind};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Operation handed to an adapter for submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOperation {
    pub tx_id: TransactionId,
    pub kind: TxKind,
    pub chain: ChainId,
    pub account: AccountId,
    pub recipient: Option<AccountId>,
    pub asset: Asset,
    /// Destination amount in minor units
    pub amount: i64,
}

/// Reference to a submitted operation, used to poll its status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHandle {
    pub chain: ChainId,
    /// Transaction hash or adapter-specific entry id
    pub reference: String,
    pub submitted_at: DateTime<Utc>,
}

/// Observed status of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Confirmed,
    Failed { reason: String },
}

/// Estimated network cost of an operation, in the chain's native unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFee {
    pub chain: ChainId,
    pub amount: u128,
    pub unit: String,
}

/// Capability set every supported chain implements
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> ChainId;

    /// Hand the operation to the chain. Returns as soon as the chain has
    /// accepted it; confirmation is observed through `query`.
    async fn submit(&self, op: &ChainOperation) -> MediatorResult<PendingHandle>;

    /// Current status of a submission. Safe to call repeatedly.
    async fn query(&self, handle: &PendingHandle) -> MediatorResult<SubmissionStatus>;

    async fn estimate_fee(&self, op: &ChainOperation) -> MediatorResult<NetworkFee>;

    async fn health_check(&self) -> bool;
}

/// Adapters indexed by chain
pub struct AdapterRegistry {
    adapters: DashMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    /// Build adapters for every enabled chain in the settings
    pub async fn from_settings(settings: &Settings) -> MediatorResult<Self> {
        let registry = Self::new();

        let needs_wallet = settings
            .enabled_chains()
            .iter()
            .any(|(_, c)| c.family() == ChainFamily::Evm);
        let wallet = if needs_wallet {
            Some(provider::load_wallet(&settings.wallet)?)
        } else {
            None
        };

        for (name, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} ({})", name, chain_config.chain);

            let adapter: Arc<dyn ChainAdapter> = match (chain_config.family(), &wallet) {
                (ChainFamily::Evm, Some(wallet)) => {
                    let rpc = EthersRpc::connect(chain_config.clone(), wallet.clone()).await?;
                    Arc::new(EvmAdapter::new(chain_config, Arc::new(rpc))?)
                }
                (ChainFamily::Evm, None) => {
                    return Err(MediatorError::Config(format!(
                        "chain {} requires a signing wallet",
                        name
                    )))
                }
                (ChainFamily::Custom, _) => Arc::new(CustomAdapter::new(
                    chain_config.chain,
                    Arc::new(SimulatedLedger::new(chain_config.chain)),
                    chain_config.flat_fee,
                )),
            };

            registry.register(adapter);
            info!("Chain {} initialized successfully", name);
        }

        Ok(registry)
    }

    /// Register an adapter, replacing any existing one for the same chain
    pub fn register(&self, adapter: Arc<dyn ChainAdapter>) {
        let chain = adapter.chain();
        if self.adapters.insert(chain, adapter).is_some() {
            warn!("Replaced adapter for chain {}", chain);
        }
    }

    /// Adapter for a chain
    pub fn get(&self, chain: ChainId) -> MediatorResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain)
            .map(|a| a.value().clone())
            .ok_or_else(|| MediatorError::AdapterUnavailable {
                chain,
                message: "no adapter registered".to_string(),
            })
    }

    pub fn contains(&self, chain: ChainId) -> bool {
        self.adapters.contains_key(&chain)
    }

    /// Get all connected chains
    pub fn connected_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.adapters.iter().map(|e| *e.key()).collect();
        chains.sort();
        chains
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainId, bool)> {
        let adapters: Vec<Arc<dyn ChainAdapter>> =
            self.adapters.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let chain = adapter.chain();
            let healthy = adapter.health_check().await;
            if !healthy {
                error!("Health check failed for chain {}", chain);
            }
            crate::metrics::record_adapter_health(chain, healthy);
            results.push((chain, healthy));
        }

        results.sort_by_key(|(chain, _)| *chain);
        results
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
