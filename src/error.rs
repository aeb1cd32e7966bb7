//! Error types for the mediation engine

use crate::types::{AccountId, Asset, ChainId};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum MediatorError {
    #[error("Insufficient funds in {account} for {asset}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        asset: Asset,
        available: i64,
        requested: i64,
    },

    #[error("No rate route for {asset} from {from} to {to}")]
    UnsupportedPair {
        asset: Asset,
        from: ChainId,
        to: ChainId,
    },

    #[error("Quote {quote_id} expired")]
    QuoteExpired { quote_id: String },

    #[error("Adapter for chain {chain} unavailable: {message}")]
    AdapterUnavailable { chain: ChainId, message: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unknown reservation {0}")]
    UnknownReservation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transaction {tx_id} cannot be cancelled in state {status}")]
    CancelRejected { tx_id: String, status: String },

    #[error("Device {device} has no active chain binding")]
    NoActiveChain { device: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediatorError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediatorError::AdapterUnavailable { .. } | MediatorError::Timeout { .. }
        )
    }

    /// Whether a failed submit is known not to have reached the chain.
    /// A timed-out submit may have been broadcast and must not be resent.
    pub fn is_safe_to_resubmit(&self) -> bool {
        matches!(self, MediatorError::AdapterUnavailable { .. })
    }

    /// Reason recorded on a transaction that failed because of this error
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            MediatorError::InsufficientFunds { .. } => FailureReason::InsufficientFunds,
            MediatorError::UnsupportedPair { .. } => FailureReason::UnsupportedPair,
            MediatorError::QuoteExpired { .. } => FailureReason::QuoteExpired,
            MediatorError::AdapterUnavailable { .. } => FailureReason::AdapterUnavailable,
            MediatorError::InvalidAmount(_) => FailureReason::InvalidAmount,
            MediatorError::UnknownReservation(_) => FailureReason::UnknownReservation,
            MediatorError::Unauthorized(_) => FailureReason::Unauthorized,
            MediatorError::Timeout { .. } => FailureReason::Timeout,
            MediatorError::NoActiveChain { .. } => FailureReason::NoActiveChain,
            _ => FailureReason::Internal,
        }
    }
}

/// Why a transaction ended in `RolledBack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientFunds,
    UnsupportedPair,
    QuoteExpired,
    AdapterUnavailable,
    InvalidAmount,
    UnknownReservation,
    Unauthorized,
    NoActiveChain,
    Timeout,
    RejectedOnChain,
    Cancelled,
    Interrupted,
    Expired,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::UnsupportedPair => "unsupported_pair",
            FailureReason::QuoteExpired => "quote_expired",
            FailureReason::AdapterUnavailable => "adapter_unavailable",
            FailureReason::InvalidAmount => "invalid_amount",
            FailureReason::UnknownReservation => "unknown_reservation",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::NoActiveChain => "no_active_chain",
            FailureReason::Timeout => "timeout",
            FailureReason::RejectedOnChain => "rejected_on_chain",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Interrupted => "interrupted",
            FailureReason::Expired => "expired",
            FailureReason::Internal => "internal",
        }
    }
}

/// Result type for engine operations
pub type MediatorResult<T> = Result<T, MediatorError>;
