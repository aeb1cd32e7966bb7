//! Transaction coordination
//!
//! The coordinator:
//! 1. Resolves the source chain from the device's active binding
//! 2. Quotes the operation through the mediator
//! 3. Places ledger holds, then submits through the chain adapter
//! 4. Settles holds on confirmation or releases them on any failure

pub mod binding;
pub mod engine;
pub mod retry;
pub mod transaction;

pub use binding::{ChainBindings, DeviceRegistry};
pub use engine::{RecoveryReport, TransactionCoordinator};
pub use retry::Backoff;
pub use transaction::{
    ChainSource, Failure, OperationRequest, StatusChange, Transaction, TransactionStatus,
};
