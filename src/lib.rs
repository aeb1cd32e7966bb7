//! Zeropoint Mediator - multi-chain transaction mediation and balance reconciliation
//!
//! Accounts hold per-asset balances that can be spent on several chains.
//! Every operation is quoted, reserved against the ledger, submitted to the
//! destination chain and either settled or fully rolled back.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod ledger;
pub mod mediator;
pub mod metrics;
pub mod session;
pub mod state;
pub mod types;

pub use error::{FailureReason, MediatorError, MediatorResult};
