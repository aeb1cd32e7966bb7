//! Configuration management for the mediation engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::types::{Asset, ChainFamily, ChainId};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    /// Postgres connection; the in-memory store is used when absent
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub mediator: MediatorConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub quote_ttl_secs: u64,
    /// Mediation fee in basis points of the converted amount
    pub fee_bps: u32,
    pub rates: Vec<RateEntry>,
    pub usd_prices: Vec<UsdPrice>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: crate::mediator::DEFAULT_QUOTE_TTL.as_secs(),
            fee_bps: 0,
            rates: Vec::new(),
            usd_prices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateEntry {
    pub asset: Asset,
    pub from: ChainId,
    pub to: ChainId,
    pub rate: Decimal,
}

/// USD price of one whole unit of an asset
#[derive(Debug, Clone, Deserialize)]
pub struct UsdPrice {
    pub asset: Asset,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound on any single adapter call
    pub adapter_timeout_ms: u64,
    /// Extra submit attempts after the adapter refused a submission.
    /// A timed-out submit is never resent.
    pub submit_retries: u32,
    /// Confirmation polls before a submission is given up
    pub max_poll_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a reserved but uncommitted transaction may hold funds
    pub reservation_ttl_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_ms: 10_000,
            submit_retries: 2,
            max_poll_attempts: 12,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            reservation_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_timeout_secs: u64,
    pub max_failed_attempts: u32,
    pub lockout_base_secs: u64,
    pub lockout_max_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 15 * 60,
            max_failed_attempts: 5,
            lockout_base_secs: 1,
            lockout_max_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain: ChainId,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub contract_address: String,
    /// Overrides the chain's recommended confirmation depth
    pub confirmation_blocks: Option<u64>,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Flat network fee in the chain's native minor units (custom chains)
    #[serde(default)]
    pub flat_fee: u64,
    pub enabled: bool,
}

impl ChainConfig {
    pub fn family(&self) -> ChainFamily {
        self.chain.family()
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or_else(|| self.chain.recommended_confirmations())
    }
}

fn default_max_gas_price_gwei() -> u64 {
    500
}

fn default_gas_limit() -> u64 {
    150_000
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    #[default]
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the signing key
    pub private_key_env: Option<String>,
}

impl Settings {
    /// Load settings from the file named by `ZEROPOINT_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("ZEROPOINT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.family() == ChainFamily::Evm {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.contract_address.is_empty() {
                    anyhow::bail!("Chain {} has no contract address configured", name);
                }
            }
        }

        if self.mediator.fee_bps > 10_000 {
            anyhow::bail!("Mediator fee of {} bps exceeds 100%", self.mediator.fee_bps);
        }
        if self.mediator.quote_ttl_secs == 0 {
            anyhow::bail!("Quote TTL must be positive");
        }
        if self.coordinator.max_poll_attempts == 0 {
            anyhow::bail!("Coordinator needs at least one confirmation poll");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    pub fn get_chain(&self, chain: ChainId) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain == chain)
    }
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
