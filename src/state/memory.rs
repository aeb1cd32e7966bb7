//! In-process store for tests and database-less deployments

use super::Store;
use crate::coordination::Transaction;
use crate::error::MediatorResult;
use crate::ledger::Account;
use crate::types::{AccountId, TransactionId};

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Account>,
    transactions: DashMap<TransactionId, Transaction>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_account(&self, account: &Account) -> MediatorResult<()> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn load_accounts(&self) -> MediatorResult<Vec<Account>> {
        Ok(self.accounts.iter().map(|a| a.value().clone()).collect())
    }

    async fn save_transaction(&self, tx: &Transaction) -> MediatorResult<()> {
        self.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn save_checkpoint(&self, tx: &Transaction, accounts: &[Account]) -> MediatorResult<()> {
        for account in accounts {
            self.accounts.insert(account.id.clone(), account.clone());
        }
        self.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn load_transaction(&self, id: &TransactionId) -> MediatorResult<Option<Transaction>> {
        Ok(self.transactions.get(id).map(|t| t.value().clone()))
    }

    async fn load_account_transactions(
        &self,
        account: &AccountId,
    ) -> MediatorResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| &t.account == account || t.beneficiary() == account)
            .map(|t| t.value().clone())
            .collect())
    }

    async fn load_unfinished(&self) -> MediatorResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.value().clone())
            .collect())
    }

    async fn health_check(&self) -> MediatorResult<()> {
        Ok(())
    }
}
