//! ethers-backed JSON-RPC client with multi-RPC failover

use super::evm::{EvmRpc, ReceiptInfo};
use super::fee::GasPrice;
use super::nonce::NonceTracker;
use crate::config::{ChainConfig, GasPriceStrategy, WalletConfig};
use crate::error::{MediatorError, MediatorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_KEY_ENV: &str = "MEDIATOR_PRIVATE_KEY";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const GWEI: u64 = 1_000_000_000;

/// Load the signing wallet from the configured environment variable
pub fn load_wallet(config: &WalletConfig) -> MediatorResult<LocalWallet> {
    let var = config.private_key_env.as_deref().unwrap_or(DEFAULT_KEY_ENV);
    let key = std::env::var(var).map_err(|_| {
        MediatorError::Config(format!("No wallet configured. Set {}", var))
    })?;

    key.trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| MediatorError::Config(format!("Invalid private key: {}", e)))
}

/// Multi-provider JSON-RPC client that signs with a local wallet
pub struct EthersRpc {
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    wallet: LocalWallet,
    nonces: NonceTracker,
}

impl EthersRpc {
    pub async fn connect(config: ChainConfig, wallet: LocalWallet) -> MediatorResult<Self> {
        let evm_chain_id = config.chain.evm_chain_id().ok_or_else(|| {
            MediatorError::Config(format!("{} is not an EVM chain", config.chain))
        })?;

        let mut http_providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if http_providers.is_empty() {
            return Err(MediatorError::AdapterUnavailable {
                chain: config.chain,
                message: "No valid RPC providers".to_string(),
            });
        }

        let rpc = Self {
            wallet: wallet.with_chain_id(evm_chain_id),
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            nonces: NonceTracker::new(0),
        };

        match rpc.fetch_nonce().await {
            Ok(nonce) => rpc.nonces.sync(nonce).await,
            Err(e) => warn!("Failed to init nonce for chain {}: {}", rpc.config.chain, e),
        }

        info!(
            "RPC client for {} ready with wallet {:?}",
            rpc.config.chain,
            rpc.wallet.address()
        );
        Ok(rpc)
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain, next);
    }

    fn unavailable(&self, message: impl Into<String>) -> MediatorError {
        MediatorError::AdapterUnavailable {
            chain: self.config.chain,
            message: message.into(),
        }
    }

    async fn fetch_nonce(&self) -> MediatorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(self.wallet.address(), None)
                .await
            {
                Ok(nonce) => return Ok(nonce.as_u64()),
                Err(e) => {
                    warn!("Failed to get nonce from chain {}: {}", self.config.chain, e);
                    self.failover();
                }
            }
        }
        Err(self.unavailable("All providers failed to report nonce"))
    }

    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(GWEI)
    }

    async fn estimate_eip1559_fees(&self) -> MediatorResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?
            .ok_or_else(|| self.unavailable("No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| self.unavailable("No base fee in block"))?;

        let priority_fee = U256::from(2 * GWEI);
        let max_fee = std::cmp::min(base_fee * 2 + priority_fee, self.max_gas_price());

        Ok((max_fee, priority_fee))
    }

    fn build_tx(
        &self,
        to: Address,
        data: Vec<u8>,
        nonce: u64,
        gas_limit: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .to(to)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price),
            ),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .to(to)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas),
            ),
        }
    }
}

#[async_trait]
impl EvmRpc for EthersRpc {
    async fn block_number(&self) -> MediatorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain, e
                    );
                    self.failover();
                }
            }
        }
        Err(self.unavailable("All providers failed"))
    }

    async fn gas_price(&self) -> MediatorResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.unavailable(e.to_string()))?;
                Ok(GasPrice::Legacy(std::cmp::min(price, self.max_gas_price())))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn send_call(
        &self,
        to: &str,
        data: Vec<u8>,
        gas_limit: u64,
        gas_price: GasPrice,
    ) -> MediatorResult<String> {
        let to: Address = to
            .parse()
            .map_err(|e| MediatorError::Config(format!("Invalid contract address: {}", e)))?;

        let nonce = self.nonces.allocate().await;
        let tx = self.build_tx(to, data, nonce, gas_limit, &gas_price);

        let signature = match self.wallet.sign_transaction(&tx).await {
            Ok(sig) => sig,
            Err(e) => {
                self.nonces.release(nonce).await;
                return Err(MediatorError::Internal(format!("Failed to sign: {}", e)));
            }
        };
        let raw = tx.rlp_signed(&signature);

        match timeout(SEND_TIMEOUT, self.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => {
                let tx_hash = format!("{:?}", pending.tx_hash());
                self.nonces.mark_pending(nonce, &tx_hash).await;
                debug!("Transaction sent on {}: {}", self.config.chain, tx_hash);
                Ok(tx_hash)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.nonces.release(nonce).await;

                if message.contains("nonce too low") {
                    warn!("Nonce too low on {}, syncing", self.config.chain);
                    let on_chain = self.fetch_nonce().await?;
                    self.nonces.sync(on_chain).await;
                } else {
                    self.failover();
                }
                Err(self.unavailable(message))
            }
            // The transaction may still have been broadcast, so the nonce stays allocated
            Err(_) => Err(MediatorError::Timeout {
                operation: format!("send_raw_transaction on {}", self.config.chain),
            }),
        }
    }

    async fn receipt(&self, tx_hash: &str) -> MediatorResult<Option<ReceiptInfo>> {
        let hash: H256 = tx_hash
            .parse()
            .map_err(|e| MediatorError::Internal(format!("Invalid tx hash {}: {}", tx_hash, e)))?;

        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        self.nonces.confirm_hash(tx_hash).await;
        Ok(Some(ReceiptInfo {
            block_number: block_number.as_u64(),
            success: receipt.status == Some(1u64.into()),
        }))
    }
}
