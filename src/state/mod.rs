//! Durable state
//!
//! Handles:
//! - Account snapshots keyed by account id
//! - Transaction records keyed by transaction id
//! - Scans for transactions left unfinished by a restart

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::coordination::Transaction;
use crate::error::MediatorResult;
use crate::ledger::Account;
use crate::types::{AccountId, TransactionId};

use async_trait::async_trait;

/// Persistence backend
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_account(&self, account: &Account) -> MediatorResult<()>;

    async fn load_accounts(&self) -> MediatorResult<Vec<Account>>;

    async fn save_transaction(&self, tx: &Transaction) -> MediatorResult<()>;

    /// Save a transaction record and the balances it touched as one unit:
    /// either every write lands or none does.
    async fn save_checkpoint(&self, tx: &Transaction, accounts: &[Account]) -> MediatorResult<()>;

    async fn load_transaction(&self, id: &TransactionId) -> MediatorResult<Option<Transaction>>;

    /// Transactions initiated by or paying out to `account`
    async fn load_account_transactions(&self, account: &AccountId)
        -> MediatorResult<Vec<Transaction>>;

    /// Transactions not yet Confirmed or RolledBack
    async fn load_unfinished(&self) -> MediatorResult<Vec<Transaction>>;

    async fn health_check(&self) -> MediatorResult<()>;
}
