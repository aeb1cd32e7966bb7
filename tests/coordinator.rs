mod common;

use async_trait::async_trait;
use common::{request, Harness};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_err;

use zeropoint_mediator::chain::{
    CustomAdapter, CustomChainClient, EntryState, LedgerEntry, SimulatedOutcome,
};
use zeropoint_mediator::config::CoordinatorConfig;
use zeropoint_mediator::coordination::{ChainSource, TransactionStatus};
use zeropoint_mediator::error::{FailureReason, MediatorError, MediatorResult};
use zeropoint_mediator::types::{AccountId, Asset, ChainId, DeviceId, TxKind};

#[tokio::test(start_paused = true)]
async fn withdraw_settles_on_confirmation() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert!(tx.holds.is_empty());
    assert_eq!(tx.handle.as_ref().unwrap().chain, ChainId::Zeropoint);
    assert_eq!(tx.network_fee.as_ref().unwrap().amount, 10);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));
    assert_eq!(h.ledger.active_reservations(), 0);

    let posted = h.zeropoint.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].amount, 40);
    assert_eq!(posted[0].tx_id, tx.id);

    let statuses: Vec<_> = tx.history.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![
            TransactionStatus::Created,
            TransactionStatus::Quoted,
            TransactionStatus::Reserved,
            TransactionStatus::Submitted,
            TransactionStatus::Confirmed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unavailable_adapter_restores_balance() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.set_available(false);
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::AdapterUnavailable));
    assert!(tx.handle.is_none());
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
    assert_eq!(h.ledger.active_reservations(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_submit_failures_are_retried() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.fail_next_posts(2);
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(h.zeropoint.posted().len(), 1);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.fail_next_posts(3);
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::AdapterUnavailable));
    assert!(h.zeropoint.posted().is_empty());
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn slow_submit_times_out() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.set_post_delay(Duration::from_secs(60));
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
    assert!(h.zeropoint.posted().is_empty());
}

/// Ledger that accepts every entry but acknowledges it only after a minute
#[derive(Default)]
struct LateAckLedger {
    posts: AtomicU32,
}

#[async_trait]
impl CustomChainClient for LateAckLedger {
    async fn post_entry(&self, entry: LedgerEntry) -> MediatorResult<String> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(format!("late-{}", entry.tx_id))
    }

    async fn entry_state(&self, _entry_id: &str) -> MediatorResult<EntryState> {
        Ok(EntryState::Final)
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_submit_is_never_resent() {
    let h = Harness::new();
    let late = Arc::new(LateAckLedger::default());
    h.adapters
        .register(Arc::new(CustomAdapter::new(ChainId::Zeropoint, late.clone(), 10)));
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert!(CoordinatorConfig::default().submit_retries > 0);
    assert_eq!(late.posts.load(Ordering::SeqCst), 1);
    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn chain_rejection_leaves_total_unchanged() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.set_outcome(SimulatedOutcome::Reject);
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Lend, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::RejectedOnChain));
    assert!(tx.handle.is_some());
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn stalled_submission_gives_up() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.set_outcome(SimulatedOutcome::Stall);
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn cross_chain_transfer_credits_recipient() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100_000).await;
    let token = h.login("alice");

    let mut req = request(TxKind::Transfer, "alice", ChainId::Zeropoint, 10_000);
    req.dest_chain = Some(ChainId::PiNetwork);
    req.recipient = Some(AccountId::new("bob"));

    let reserved = h.coordinator.begin(&token, req).await.unwrap();
    assert_eq!(reserved.status, TransactionStatus::Reserved);
    assert_eq!(reserved.quote.as_ref().unwrap().dest_amount, 9_800);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100_000, 90_000, 10_000, 0));
    assert_eq!(h.balance("bob", Asset::Zpe).await, (0, 0, 0, 9_800));

    let tx = h.coordinator.commit(&token, reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (90_000, 90_000, 0, 0));
    assert_eq!(h.balance("bob", Asset::Zpe).await, (9_800, 9_800, 0, 0));

    let posted = h.pi.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].beneficiary, AccountId::new("bob"));
    assert!(h.zeropoint.posted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsupported_pair_places_no_holds() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let mut req = request(TxKind::Transfer, "alice", ChainId::PiNetwork, 40);
    req.dest_chain = Some(ChainId::Zeropoint);

    let tx = h.coordinator.execute(&token, req).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::UnsupportedPair));
    assert!(tx.quote.is_none());
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn insufficient_funds_rolls_back() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 30).await;
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Stake, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::InsufficientFunds));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (30, 30, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn non_positive_amount_is_rejected() {
    let h = Harness::new();
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 0))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::InvalidAmount));
}

#[tokio::test(start_paused = true)]
async fn concurrent_reservations_exactly_one_succeeds() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let (first, second) = tokio::join!(
        h.coordinator
            .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 60)),
        h.coordinator
            .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 60)),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let reserved = outcomes
        .iter()
        .filter(|tx| tx.status == TransactionStatus::Reserved)
        .count();
    let refused: Vec<_> = outcomes
        .iter()
        .filter(|tx| tx.status == TransactionStatus::RolledBack)
        .collect();

    assert_eq!(reserved, 1);
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].failure_reason(), Some(FailureReason::InsufficientFunds));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 40, 60, 0));
}

#[tokio::test(start_paused = true)]
async fn expired_quote_is_replaced_on_commit() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100_000).await;
    let token = h.login("alice");

    let mut req = request(TxKind::Transfer, "alice", ChainId::Zeropoint, 10_000);
    req.dest_chain = Some(ChainId::PiNetwork);
    let reserved = h.coordinator.begin(&token, req).await.unwrap();
    let first_quote = reserved.quote.clone().unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;

    let tx = h.coordinator.commit(&token, reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    let second_quote = tx.quote.unwrap();
    assert_ne!(second_quote.id, first_quote.id);
    assert_eq!(second_quote.dest_amount, first_quote.dest_amount);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (99_800, 99_800, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn cancel_before_submission_releases_holds() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let reserved = h
        .coordinator
        .begin(&token, request(TxKind::Farm, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 60, 40, 0));

    let cancelled = h.coordinator.cancel(&token, reserved.id).await.unwrap();
    assert_eq!(cancelled.status, TransactionStatus::RolledBack);
    assert_eq!(cancelled.failure_reason(), Some(FailureReason::Cancelled));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));

    let again = assert_err!(h.coordinator.cancel(&token, reserved.id).await);
    assert!(matches!(again, MediatorError::CancelRejected { .. }));

    let commit = assert_err!(h.coordinator.commit(&token, reserved.id).await);
    assert!(matches!(commit, MediatorError::InvalidStateTransition { .. }));
    assert!(h.zeropoint.posted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_reservation_expires() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");
    let ttl = Duration::from_secs(CoordinatorConfig::default().reservation_ttl_secs);

    let reserved = h
        .coordinator
        .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    tokio::time::advance(ttl - Duration::from_secs(1)).await;
    assert_eq!(h.coordinator.expire_stale().await, 0);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 60, 40, 0));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(h.coordinator.expire_stale().await, 1);

    let tx = h.coordinator.status(reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::RolledBack);
    assert_eq!(tx.failure_reason(), Some(FailureReason::Expired));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));
    assert_eq!(h.ledger.active_reservations(), 0);
    assert_eq!(h.coordinator.in_flight_count(), 0);

    let commit = assert_err!(h.coordinator.commit(&token, reserved.id).await);
    assert!(matches!(commit, MediatorError::InvalidStateTransition { .. }));
    assert!(h.zeropoint.posted().is_empty());
    assert_eq!(h.coordinator.expire_stale().await, 0);
}

#[tokio::test(start_paused = true)]
async fn committed_transactions_do_not_expire() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let tx = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);

    let ttl = Duration::from_secs(CoordinatorConfig::default().reservation_ttl_secs);
    tokio::time::advance(ttl * 2).await;
    assert_eq!(h.coordinator.expire_stale().await, 0);
    assert_eq!(h.coordinator.status(tx.id).await.unwrap().status, TransactionStatus::Confirmed);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn cancel_is_rejected_once_submitted() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    h.zeropoint.set_polls_to_finality(3);
    let token = h.login("alice");

    let reserved = h
        .coordinator
        .begin(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
        .await
        .unwrap();

    let commit = tokio::spawn({
        let coordinator = h.coordinator.clone();
        let token = token.clone();
        let id = reserved.id;
        async move { coordinator.commit(&token, id).await }
    });

    while h.coordinator.status(reserved.id).await.unwrap().status != TransactionStatus::Submitted {
        tokio::task::yield_now().await;
    }

    let err = assert_err!(h.coordinator.cancel(&token, reserved.id).await);
    assert!(matches!(err, MediatorError::CancelRejected { .. }));

    let tx = commit.await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(h.balance("alice", Asset::Zpe).await, (60, 60, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn deposit_credits_on_confirmation() {
    let h = Harness::new();
    let token = h.login("carol");

    let reserved = h
        .coordinator
        .begin(&token, request(TxKind::Deposit, "carol", ChainId::Zeropoint, 500))
        .await
        .unwrap();
    assert_eq!(h.balance("carol", Asset::Zpe).await, (0, 0, 0, 500));

    let tx = h.coordinator.commit(&token, reserved.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert_eq!(h.balance("carol", Asset::Zpe).await, (500, 500, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn locked_positions_record_unlock_time() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");

    let stake = h
        .coordinator
        .execute(&token, request(TxKind::Stake, "alice", ChainId::Zeropoint, 10))
        .await
        .unwrap();
    let unlocks_at = stake.unlocks_at.unwrap();
    let lock = unlocks_at - stake.created_at;
    assert!(lock >= chrono::Duration::days(90) && lock < chrono::Duration::days(91));

    let withdraw = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 10))
        .await
        .unwrap();
    assert!(withdraw.unlocks_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn rejects_foreign_token_and_unbound_device() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let bob = h.login("bob");

    let err = assert_err!(
        h.coordinator
            .execute(&bob, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40))
            .await
    );
    assert!(matches!(err, MediatorError::Unauthorized(_)));

    let alice = h.login("alice");
    let mut req = request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 40);
    req.source = ChainSource::Device(DeviceId::new("phone-1"));
    let err = assert_err!(h.coordinator.execute(&alice, req.clone()).await);
    assert!(matches!(err, MediatorError::NoActiveChain { .. }));
    assert_eq!(h.balance("alice", Asset::Zpe).await, (100, 100, 0, 0));

    h.bindings
        .switch(&DeviceId::new("phone-1"), ChainId::Zeropoint, &h.adapters)
        .await
        .unwrap();
    let tx = h.coordinator.execute(&alice, req).await.unwrap();
    assert_eq!(tx.source_chain, ChainId::Zeropoint);
    assert_eq!(tx.status, TransactionStatus::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn events_and_history_follow_the_lifecycle() {
    let h = Harness::new();
    h.fund("alice", Asset::Zpe, 100).await;
    let token = h.login("alice");
    let mut events = h.coordinator.events().subscribe();

    let first = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 10))
        .await
        .unwrap();
    let second = h
        .coordinator
        .execute(&token, request(TxKind::Withdraw, "alice", ChainId::Zeropoint, 500))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.tx_id == first.id {
            seen.push(event.status);
        }
    }
    assert_eq!(
        seen,
        vec![
            TransactionStatus::Created,
            TransactionStatus::Quoted,
            TransactionStatus::Reserved,
            TransactionStatus::Submitted,
            TransactionStatus::Confirmed,
        ]
    );

    let history = h.coordinator.history(&AccountId::new("alice")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.id);
    assert_eq!(history[0].status, TransactionStatus::RolledBack);
    assert_eq!(history[1].id, first.id);

    let status = h.coordinator.status(first.id).await.unwrap();
    assert_eq!(status.status, TransactionStatus::Confirmed);
}
