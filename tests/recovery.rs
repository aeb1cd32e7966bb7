mod common;

use async_trait::async_trait;
use common::{request, Harness};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeropoint_mediator::coordination::{Transaction, TransactionStatus};
use zeropoint_mediator::error::{FailureReason, MediatorError, MediatorResult};
use zeropoint_mediator::ledger::Account;
use zeropoint_mediator::state::{MemoryStore, Store};
use zeropoint_mediator::types::{AccountId, Asset, ChainId, TransactionId, TxKind};

#[tokio::test(start_paused = true)]
async fn funded_balance_survives_restart() {
    let before = Harness::new();
    before.fund("alice", Asset::Zpe, 100).await;

    let after = before.restarted();
    let report = after.coordinator.recover().await.unwrap();

    assert_eq!(report.accounts_restored, 1);
    assert_eq!(after.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

/// Memory store whose confirmation checkpoints fail while `failing` is set
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn save_account(&self, account: &Account) -> MediatorResult<()> {
        self.inner.save_account(account).await
    }

    async fn load_accounts(&self) -> MediatorResult<Vec<Account>> {
        self.inner.load_accounts().await
    }

    async fn save_transaction(&self, tx: &Transaction) -> MediatorResult<()> {
        self.inner.save_transaction(tx).await
    }

    async fn save_checkpoint(&self, tx: &Transaction, accounts: &[Account]) -> MediatorResult<()> {
        if tx.status == TransactionStatus::Confirmed && self.failing.load(Ordering::SeqCst) {
            return Err(MediatorError::Internal("disk full".to_string()));
        }
        self.inner.save_checkpoint(tx, accounts).await
    }

    async fn load_transaction(&self, id: &TransactionId) -> MediatorResult<Option<Transaction>> {
        self.inner.load_transaction(id).await
    }

    async fn load_account_transactions(
        &self,
        account: &AccountId,
    ) -> MediatorResult<Vec<Transaction>> {
        self.inner.load_account_transactions(account).await
    }

    async fn load_unfinished(&self) -> MediatorResult<Vec<Transaction>> {
        self.inner.load_unfinished().await
    }

    async fn health_check(&self) -> MediatorResult<()> {
        self.inner.health_check().await
    }
}

#[tokio::test(start_paused = true)]
async fn lost_confirmation_checkpoint_is_not_settled_twice() {
    let store = Arc::new(FlakyStore::default());
    let before = Harness::with_store(store.clone());
    before.fund("alice", Asset::Zpe, 100).await;
    let token = before.login("alice");

    store.failing.store(true, Ordering::SeqCst);
    let tx = before
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(before.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));

    // neither the record nor the debited balance reached the store
    let persisted = store.load_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TransactionStatus::Submitted);
    store.failing.store(false, Ordering::SeqCst);

    let after = before.restarted();
    let report = after.coordinator.recover().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.rolled_back, 0);

    assert_eq!(after.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));
    assert_eq!(after.zeropoint.posted().len(), 1);
    let persisted = after.store.load_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TransactionStatus::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn reserved_transaction_is_rolled_back_after_restart() {
    let before = Harness::new();
    before.fund("alice", Asset::Zpe, 100).await;
    let token = before.login("alice");

    let reserved = before
        .coordinator
        .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();
    assert_eq!(reserved.status, TransactionStatus::Reserved);

    let after = before.restarted();
    let report = after.coordinator.recover().await.unwrap();
    assert_eq!(report.accounts_restored, 1);
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.confirmed, 0);

    let tx = after.coordinator.status(reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::Interrupted));
    assert_eq!(after.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
    assert_eq!(after.ledger.active_reservations(), 0);
    assert!(after.zeropoint.posted().is_empty());

    let persisted = after.store.load_transaction(&reserved.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TransactionStatus::RolledBack);
}

#[tokio::test(start_paused = true)]
async fn submitted_transaction_is_polled_to_completion_after_restart() {
    let before = Harness::new();
    before.fund("alice", Asset::Zpe, 100).await;
    before.zeropoint.set_polls_to_finality(3);
    let token = before.login("alice");

    let reserved = before
        .coordinator
        .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    let commit = tokio::spawn({
        let coordinator = before.coordinator.clone();
        let id = reserved.id;
        let token = token.clone();
        async move { coordinator.commit(&token, id).await }
    });
    while before.coordinator.status(reserved.id).await.unwrap().status
        != TransactionStatus::Submitted
    {
        tokio::task::yield_now().await;
    }
    // the process dies while waiting for confirmation
    commit.abort();
    assert!(commit.await.unwrap_err().is_cancelled());

    let after = before.restarted();
    assert_eq!(after.balance("alice", Asset::Zpe).await, (0, 0, 0, 0));

    let report = after.coordinator.recover().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(report.stranded, 0);

    let tx = after.coordinator.status(reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(after.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));
    assert_eq!(after.zeropoint.posted().len(), 1);
    assert_eq!(after.coordinator.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn submitted_transaction_rejected_after_restart_is_released() {
    let before = Harness::new();
    before.fund("alice", Asset::Zpe, 100).await;
    before.zeropoint.set_polls_to_finality(3);
    before
        .zeropoint
        .set_outcome(zeropoint_mediator::chain::SimulatedOutcome::Reject);
    let token = before.login("alice");

    let reserved = before
        .coordinator
        .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();
    let commit = tokio::spawn({
        let coordinator = before.coordinator.clone();
        let id = reserved.id;
        let token = token.clone();
        async move { coordinator.commit(&token, id).await }
    });
    while before.coordinator.status(reserved.id).await.unwrap().status
        != TransactionStatus::Submitted
    {
        tokio::task::yield_now().await;
    }
    commit.abort();

    let after = before.restarted();
    let report = after.coordinator.recover().await.unwrap();
    assert_eq!(report.rolled_back, 1);

    let tx = after.coordinator.status(reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::RejectedOnChain));
    assert_eq!(after.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn history_survives_restart() {
    let before = Harness::new();
    before.fund("alice", Asset::Zpe, 100).await;
    let token = before.login("alice");

    let tx = before
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 10))
        .await
        .unwrap();

    let after = before.restarted();
    after.coordinator.recover().await.unwrap();

    let history = after
        .coordinator
        .history(&AccountId::new("alice"))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, tx.id);
    assert_eq!(history[0].status, TransactionStatus::Confirmed);
    assert_eq!(after.balance("alice", Asset::Zpe).await, (90, 90, 0, 0));
}
