//! Core identifiers shared across the engine
//!
//! Amounts are always `i64` minor units of their asset. No floating point
//! value ever reaches a balance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Supported assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "PI")]
    Pi,
    #[serde(rename = "ZPE")]
    Zpe,
    #[serde(rename = "ZPP")]
    Zpp,
    #[serde(rename = "ZPW")]
    Zpw,
    #[serde(rename = "ZHV")]
    Zhv,
    #[serde(rename = "GOATE")]
    Goate,
    #[serde(rename = "GySt")]
    GySt,
    #[serde(rename = "SD")]
    Sd,
    #[serde(rename = "ZGI")]
    Zgi,
    #[serde(rename = "GP")]
    Gp,
    #[serde(rename = "zS")]
    Zs,
}

impl Asset {
    pub const ALL: [Asset; 12] = [
        Asset::Usd,
        Asset::Pi,
        Asset::Zpe,
        Asset::Zpp,
        Asset::Zpw,
        Asset::Zhv,
        Asset::Goate,
        Asset::GySt,
        Asset::Sd,
        Asset::Zgi,
        Asset::Gp,
        Asset::Zs,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Asset::Usd => "USD",
            Asset::Pi => "PI",
            Asset::Zpe => "ZPE",
            Asset::Zpp => "ZPP",
            Asset::Zpw => "ZPW",
            Asset::Zhv => "ZHV",
            Asset::Goate => "GOATE",
            Asset::GySt => "GySt",
            Asset::Sd => "SD",
            Asset::Zgi => "ZGI",
            Asset::Gp => "GP",
            Asset::Zs => "zS",
        }
    }

    /// Number of decimal places in one whole unit
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Usd => 2,
            _ => 6,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Asset::ALL
            .iter()
            .find(|a| a.code() == s)
            .copied()
            .ok_or_else(|| format!("unknown asset {}", s))
    }
}

/// How a chain is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Custom,
}

/// Supported chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainId {
    Ethereum,
    Polygon,
    Arbitrum,
    Avalanche,
    PiNetwork,
    Zeropoint,
}

impl ChainId {
    pub const ALL: [ChainId; 6] = [
        ChainId::Ethereum,
        ChainId::Polygon,
        ChainId::Arbitrum,
        ChainId::Avalanche,
        ChainId::PiNetwork,
        ChainId::Zeropoint,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Polygon => "polygon",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Avalanche => "avalanche",
            ChainId::PiNetwork => "pi_network",
            ChainId::Zeropoint => "zeropoint",
        }
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            ChainId::Ethereum | ChainId::Polygon | ChainId::Arbitrum | ChainId::Avalanche => {
                ChainFamily::Evm
            }
            ChainId::PiNetwork | ChainId::Zeropoint => ChainFamily::Custom,
        }
    }

    /// Numeric EIP-155 chain id for EVM chains
    pub fn evm_chain_id(&self) -> Option<u64> {
        match self {
            ChainId::Ethereum => Some(1),
            ChainId::Polygon => Some(137),
            ChainId::Arbitrum => Some(42161),
            ChainId::Avalanche => Some(43114),
            ChainId::PiNetwork | ChainId::Zeropoint => None,
        }
    }

    /// Recommended confirmation depth before a receipt counts as final
    pub fn recommended_confirmations(&self) -> u64 {
        match self {
            ChainId::Ethereum => 32,
            ChainId::Polygon => 128,
            ChainId::Arbitrum => 64,
            // instant finality
            ChainId::Avalanche => 1,
            ChainId::PiNetwork | ChainId::Zeropoint => 1,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainId::ALL
            .iter()
            .find(|c| c.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown chain {}", s))
    }
}

/// Opaque account identifier supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device identifier supplied by the device registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which way value moves for the initiating account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Outbound,
    Inbound,
}

/// Kind of user operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Transfer,
    Stake,
    Farm,
    Lend,
    Borrow,
    Liquidity,
    Deposit,
    Withdraw,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Transfer => "transfer",
            TxKind::Stake => "stake",
            TxKind::Farm => "farm",
            TxKind::Lend => "lend",
            TxKind::Borrow => "borrow",
            TxKind::Liquidity => "liquidity",
            TxKind::Deposit => "deposit",
            TxKind::Withdraw => "withdraw",
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            TxKind::Borrow | TxKind::Deposit => Flow::Inbound,
            _ => Flow::Outbound,
        }
    }

    /// Lock-up applied to confirmed positions: stake 3 months, farm 6, liquidity 9
    pub fn lock_period(&self) -> Option<chrono::Duration> {
        match self {
            TxKind::Stake => Some(chrono::Duration::days(90)),
            TxKind::Farm => Some(chrono::Duration::days(180)),
            TxKind::Liquidity => Some(chrono::Duration::days(270)),
            _ => None,
        }
    }

    /// Discriminant used in encoded chain calls
    pub fn code(&self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Stake => 1,
            TxKind::Farm => 2,
            TxKind::Lend => 3,
            TxKind::Borrow => 4,
            TxKind::Liquidity => 5,
            TxKind::Deposit => 6,
            TxKind::Withdraw => 7,
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_flow_and_lock_periods() {
        assert_eq!(TxKind::Deposit.flow(), Flow::Inbound);
        assert_eq!(TxKind::Borrow.flow(), Flow::Inbound);
        assert_eq!(TxKind::Withdraw.flow(), Flow::Outbound);
        assert_eq!(TxKind::Stake.lock_period(), Some(chrono::Duration::days(90)));
        assert_eq!(TxKind::Lend.lock_period(), None);
    }

    #[test]
    fn test_asset_codes_round_trip_through_serde() {
        let json = serde_json::to_string(&Asset::GySt).unwrap();
        assert_eq!(json, "\"GySt\"");
        let parsed: Asset = serde_json::from_str("\"zS\"").unwrap();
        assert_eq!(parsed, Asset::Zs);
        assert_eq!("GOATE".parse::<Asset>().unwrap(), Asset::Goate);
        assert!("DOGE".parse::<Asset>().is_err());
    }

    #[test]
    fn test_chain_family() {
        assert_eq!(ChainId::Polygon.family(), ChainFamily::Evm);
        assert_eq!(ChainId::PiNetwork.family(), ChainFamily::Custom);
        assert_eq!(ChainId::Arbitrum.evm_chain_id(), Some(42161));
        assert_eq!(ChainId::Zeropoint.evm_chain_id(), None);
        assert_eq!("pi_network".parse::<ChainId>().unwrap(), ChainId::PiNetwork);
    }
}
