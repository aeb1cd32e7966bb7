//! Transaction coordinator
//!
//! Drives one user operation through
//! `Created -> Quoted -> Reserved -> Submitted -> Confirmed`, or through
//! `Failed -> RolledBack` from any earlier state. Every failure releases
//! whatever holds the transaction placed, so balances end exactly where
//! they started.
//!
//! A transaction's record is guarded by its own lock. The lock is not held
//! while waiting for confirmation, so status reads and cancel requests never
//! wait on a chain.

use super::binding::DeviceRegistry;
use super::retry::Backoff;
use super::transaction::{ChainSource, OperationRequest, Transaction, TransactionStatus};
use crate::chain::{AdapterRegistry, ChainAdapter, ChainOperation, NetworkFee, PendingHandle, SubmissionStatus};
use crate::config::CoordinatorConfig;
use crate::error::{FailureReason, MediatorError, MediatorResult};
use crate::events::EventBus;
use crate::ledger::{AssetLedger, HoldDirection, ReservationId};
use crate::mediator::Mediator;
use crate::session::{AuthToken, Authorizer};
use crate::state::Store;
use crate::types::{AccountId, Asset, ChainId, Flow, TransactionId, TxKind};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Result of waiting on a submission
#[derive(Debug, Clone, PartialEq)]
enum PollOutcome {
    Confirmed,
    Failed { reason: FailureReason, detail: String },
}

/// What startup replay did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub accounts_restored: usize,
    pub confirmed: usize,
    pub rolled_back: usize,
    /// Submitted transactions whose chain has no adapter; left in flight
    pub stranded: usize,
}

pub struct TransactionCoordinator {
    ledger: Arc<AssetLedger>,
    mediator: Arc<Mediator>,
    adapters: Arc<AdapterRegistry>,
    devices: Arc<dyn DeviceRegistry>,
    authorizer: Arc<Authorizer>,
    store: Arc<dyn Store>,
    events: EventBus,
    config: CoordinatorConfig,
    backoff: Backoff,
    /// Transactions not yet terminal, each behind its own lock
    in_flight: DashMap<TransactionId, Arc<Mutex<Transaction>>>,
    /// Latest snapshot of every transaction this process has touched
    records: DashMap<TransactionId, Transaction>,
    /// When each transaction currently holding funds entered Reserved
    reserved_since: DashMap<TransactionId, Instant>,
}

impl TransactionCoordinator {
    pub fn new(
        ledger: Arc<AssetLedger>,
        mediator: Arc<Mediator>,
        adapters: Arc<AdapterRegistry>,
        devices: Arc<dyn DeviceRegistry>,
        authorizer: Arc<Authorizer>,
        store: Arc<dyn Store>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            ledger,
            mediator,
            adapters,
            devices,
            authorizer,
            store,
            events: EventBus::default(),
            backoff: Backoff::from_config(&config),
            config,
            in_flight: DashMap::new(),
            records: DashMap::new(),
            reserved_since: DashMap::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.config.adapter_timeout_ms)
    }

    /// Credit an account and persist the new balance.
    ///
    /// A balance that could not be saved is an error: recovery restores
    /// accounts only from the store.
    pub async fn credit(&self, account: &AccountId, asset: Asset, amount: i64) -> MediatorResult<()> {
        self.ledger.credit(account, asset, amount).await?;
        if let Some(snapshot) = self.ledger.snapshot(account).await {
            self.store.save_account(&snapshot).await?;
        }
        info!("Credited {} {} to {}", amount, asset, account);
        Ok(())
    }

    /// Run an operation end to end: begin, then commit
    pub async fn execute(
        &self,
        token: &AuthToken,
        request: OperationRequest,
    ) -> MediatorResult<Transaction> {
        let tx = self.begin(token, request).await?;
        if tx.status != TransactionStatus::Reserved {
            return Ok(tx);
        }
        self.commit(token, tx.id).await
    }

    /// Create a transaction, quote it and place its ledger holds.
    ///
    /// Returns `Err` only when the request is rejected before a transaction
    /// exists (bad token, unbound device). Later failures come back as a
    /// `RolledBack` transaction carrying the reason.
    pub async fn begin(
        &self,
        token: &AuthToken,
        request: OperationRequest,
    ) -> MediatorResult<Transaction> {
        self.authorizer.verify(token, &request.account)?;

        let source_chain = self.resolve_source(&request.source).await?;
        let dest_chain = request.dest_chain.unwrap_or(source_chain);

        let tx = Transaction::new(&request, source_chain, dest_chain);
        crate::metrics::record_transaction_created(tx.kind);
        info!(
            "Transaction {} created: {} {} {} {} -> {} for {}",
            tx.id, tx.kind, tx.amount, tx.asset, source_chain, dest_chain, tx.account
        );

        let id = tx.id;
        let handle = Arc::new(Mutex::new(tx));
        self.in_flight.insert(id, handle.clone());
        let mut tx = handle.lock().await;
        self.checkpoint(&tx).await;

        // Created -> Quoted
        let quote = match self
            .mediator
            .quote(source_chain, dest_chain, tx.asset, tx.amount)
            .await
        {
            Ok(quote) => quote,
            Err(e) => return self.abort(&mut tx, &e).await,
        };
        tx.quote = Some(quote);
        self.advance(&mut tx, TransactionStatus::Quoted).await?;

        // Quoted -> Reserved
        if let Err(e) = self.place_holds(&mut tx).await {
            return self.abort(&mut tx, &e).await;
        }
        self.advance(&mut tx, TransactionStatus::Reserved).await?;

        Ok(tx.clone())
    }

    /// Submit a reserved transaction and wait for its terminal state
    pub async fn commit(&self, token: &AuthToken, id: TransactionId) -> MediatorResult<Transaction> {
        let handle = self.live_handle(id, TransactionStatus::Submitted)?;
        let mut tx = handle.lock().await;
        self.authorizer.verify(token, &tx.account)?;

        if tx.status != TransactionStatus::Reserved {
            return Err(MediatorError::InvalidStateTransition {
                from: tx.status.to_string(),
                to: TransactionStatus::Submitted.to_string(),
            });
        }

        if let Err(e) = self.refresh_quote(&mut tx).await {
            return self.abort(&mut tx, &e).await;
        }

        let adapter = match self.adapters.get(tx.dest_chain) {
            Ok(adapter) => adapter,
            Err(e) => return self.abort(&mut tx, &e).await,
        };
        let op = self.operation(&tx)?;

        tx.network_fee = self.estimate_fee(adapter.as_ref(), &op).await;

        // Reserved -> Submitted
        let pending = match self.submit_with_retry(adapter.as_ref(), &op).await {
            Ok(pending) => pending,
            Err(e) => return self.abort(&mut tx, &e).await,
        };
        tx.handle = Some(pending.clone());
        self.advance(&mut tx, TransactionStatus::Submitted).await?;
        drop(tx);

        let outcome = self.await_confirmation(adapter.as_ref(), &pending).await;

        let mut tx = handle.lock().await;
        self.conclude(&mut tx, outcome).await
    }

    /// Cancel a transaction that has not been submitted yet
    pub async fn cancel(&self, token: &AuthToken, id: TransactionId) -> MediatorResult<Transaction> {
        let handle = match self.in_flight.get(&id) {
            Some(handle) => handle.value().clone(),
            None => {
                let status = self
                    .records
                    .get(&id)
                    .map(|r| r.status)
                    .ok_or_else(|| MediatorError::TransactionNotFound {
                        tx_id: id.to_string(),
                    })?;
                return Err(MediatorError::CancelRejected {
                    tx_id: id.to_string(),
                    status: status.to_string(),
                });
            }
        };

        let mut tx = handle.lock().await;
        self.authorizer.verify(token, &tx.account)?;

        if !tx.status.is_cancellable() {
            return Err(MediatorError::CancelRejected {
                tx_id: id.to_string(),
                status: tx.status.to_string(),
            });
        }

        info!("Cancelling transaction {} in state {}", id, tx.status);
        self.roll_back(&mut tx, FailureReason::Cancelled, "cancelled by caller")
            .await?;
        Ok(tx.clone())
    }

    /// Roll back transactions left in Reserved longer than the configured
    /// reservation TTL. Returns how many were expired.
    pub async fn expire_stale(&self) -> usize {
        let ttl = Duration::from_secs(self.config.reservation_ttl_secs);
        let stale: Vec<TransactionId> = self
            .reserved_since
            .iter()
            .filter(|entry| entry.value().elapsed() >= ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in stale {
            let Some(handle) = self.in_flight.get(&id).map(|h| h.value().clone()) else {
                self.reserved_since.remove(&id);
                continue;
            };
            // A held lock means a commit or cancel is already acting on it
            let Ok(mut tx) = handle.try_lock() else {
                continue;
            };
            if tx.status != TransactionStatus::Reserved {
                continue;
            }

            info!("Expiring transaction {} reserved for over {:?}", id, ttl);
            match self
                .roll_back(&mut tx, FailureReason::Expired, "reservation expired")
                .await
            {
                Ok(()) => expired += 1,
                Err(e) => error!("Failed to expire transaction {}: {}", id, e),
            }
        }

        if expired > 0 {
            info!("Expired {} stale reservations", expired);
        }
        expired
    }

    /// Latest known state of a transaction
    pub async fn status(&self, id: TransactionId) -> MediatorResult<Transaction> {
        if let Some(tx) = self.records.get(&id) {
            return Ok(tx.value().clone());
        }
        self.store
            .load_transaction(&id)
            .await?
            .ok_or_else(|| MediatorError::TransactionNotFound {
                tx_id: id.to_string(),
            })
    }

    /// Transactions initiated by or paying out to an account, newest first
    pub async fn history(&self, account: &AccountId) -> MediatorResult<Vec<Transaction>> {
        let mut by_id: HashMap<TransactionId, Transaction> = self
            .store
            .load_account_transactions(account)
            .await?
            .into_iter()
            .map(|tx| (tx.id, tx))
            .collect();

        for record in self.records.iter() {
            if &record.account == account || record.beneficiary() == account {
                by_id.insert(record.id, record.value().clone());
            }
        }

        let mut history: Vec<Transaction> = by_id.into_values().collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history)
    }

    /// Restore ledger state and finish transactions interrupted by a restart.
    ///
    /// Submitted transactions are polled again until terminal. Anything
    /// earlier never reached a chain and is rolled back.
    pub async fn recover(&self) -> MediatorResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for account in self.store.load_accounts().await? {
            self.ledger.restore_account(account).await;
            report.accounts_restored += 1;
        }

        let mut resumed = Vec::new();
        for tx in self.store.load_unfinished().await? {
            for hold in &tx.holds {
                self.ledger.restore_reservation(hold.clone());
            }

            let id = tx.id;
            let status = tx.status;
            self.records.insert(id, tx.clone());
            let handle = Arc::new(Mutex::new(tx));
            self.in_flight.insert(id, handle.clone());

            match status {
                TransactionStatus::Submitted => {
                    let chain = handle.lock().await.dest_chain;
                    if self.adapters.contains(chain) {
                        resumed.push(handle);
                    } else {
                        error!(
                            "Transaction {} is submitted on {} but no adapter is registered",
                            id, chain
                        );
                        report.stranded += 1;
                    }
                }
                TransactionStatus::Failed => {
                    let mut tx = handle.lock().await;
                    let reason = tx.failure_reason().unwrap_or(FailureReason::Interrupted);
                    self.finish_rollback(&mut tx, reason).await?;
                    report.rolled_back += 1;
                }
                _ => {
                    let mut tx = handle.lock().await;
                    warn!("Rolling back transaction {} interrupted in {}", id, status);
                    self.roll_back(&mut tx, FailureReason::Interrupted, "interrupted by restart")
                        .await?;
                    report.rolled_back += 1;
                }
            }
        }

        info!("Resuming {} submitted transactions", resumed.len());
        let outcomes = join_all(resumed.into_iter().map(|handle| self.resume(handle))).await;
        for outcome in outcomes {
            match outcome {
                Ok(tx) if tx.status == TransactionStatus::Confirmed => report.confirmed += 1,
                Ok(_) => report.rolled_back += 1,
                Err(e) => error!("Failed to resume transaction: {}", e),
            }
        }

        info!(
            "Recovery complete: {} accounts, {} confirmed, {} rolled back, {} stranded",
            report.accounts_restored, report.confirmed, report.rolled_back, report.stranded
        );
        Ok(report)
    }

    async fn resume(&self, handle: Arc<Mutex<Transaction>>) -> MediatorResult<Transaction> {
        let (pending, chain) = {
            let tx = handle.lock().await;
            (tx.handle.clone(), tx.dest_chain)
        };

        let outcome = match pending {
            Some(pending) => {
                let adapter = self.adapters.get(chain)?;
                self.await_confirmation(adapter.as_ref(), &pending).await
            }
            None => PollOutcome::Failed {
                reason: FailureReason::Internal,
                detail: "submitted without a pending handle".to_string(),
            },
        };

        let mut tx = handle.lock().await;
        self.conclude(&mut tx, outcome).await
    }

    async fn resolve_source(&self, source: &ChainSource) -> MediatorResult<ChainId> {
        match source {
            ChainSource::Chain(chain) => Ok(*chain),
            ChainSource::Device(device) => self.devices.active_chain(device).await.ok_or_else(|| {
                MediatorError::NoActiveChain {
                    device: device.to_string(),
                }
            }),
        }
    }

    fn live_handle(
        &self,
        id: TransactionId,
        wanted: TransactionStatus,
    ) -> MediatorResult<Arc<Mutex<Transaction>>> {
        if let Some(handle) = self.in_flight.get(&id) {
            return Ok(handle.value().clone());
        }
        match self.records.get(&id) {
            Some(record) => Err(MediatorError::InvalidStateTransition {
                from: record.status.to_string(),
                to: wanted.to_string(),
            }),
            None => Err(MediatorError::TransactionNotFound {
                tx_id: id.to_string(),
            }),
        }
    }

    async fn place_holds(&self, tx: &mut Transaction) -> MediatorResult<()> {
        let quote = tx
            .quote
            .clone()
            .ok_or_else(|| MediatorError::Internal(format!("{} has no quote", tx.id)))?;

        match tx.kind.flow() {
            Flow::Outbound => {
                let id = self
                    .ledger
                    .reserve(&tx.account, tx.asset, quote.source_amount)
                    .await?;
                self.record_hold(tx, id);

                if tx.kind == TxKind::Transfer {
                    let beneficiary = tx.beneficiary().clone();
                    let id = self
                        .ledger
                        .hold_incoming(&beneficiary, tx.asset, quote.dest_amount)
                        .await?;
                    self.record_hold(tx, id);
                }
            }
            Flow::Inbound => {
                let id = self
                    .ledger
                    .hold_incoming(&tx.account, tx.asset, quote.dest_amount)
                    .await?;
                self.record_hold(tx, id);
            }
        }
        Ok(())
    }

    fn record_hold(&self, tx: &mut Transaction, id: ReservationId) {
        match self.ledger.reservation(&id) {
            Some(reservation) => tx.holds.push(reservation),
            None => error!("Hold {} for {} vanished right after placement", id, tx.id),
        }
    }

    /// Redeem the transaction's quote, replacing it if it expired
    async fn refresh_quote(&self, tx: &mut Transaction) -> MediatorResult<()> {
        let quote = tx
            .quote
            .clone()
            .ok_or_else(|| MediatorError::Internal(format!("{} has no quote", tx.id)))?;

        match self.mediator.redeem(&quote) {
            Ok(()) => return Ok(()),
            Err(MediatorError::QuoteExpired { .. }) => {}
            Err(e) => return Err(e),
        }

        info!("Quote {} for {} expired, requesting a fresh one", quote.id, tx.id);
        let fresh = self
            .mediator
            .quote(quote.source_chain, quote.dest_chain, quote.asset, quote.source_amount)
            .await?;
        self.mediator.redeem(&fresh)?;

        if fresh.dest_amount != quote.dest_amount {
            let incoming: Vec<_> = tx
                .holds
                .iter()
                .filter(|h| h.direction == HoldDirection::Incoming)
                .cloned()
                .collect();
            tx.holds.retain(|h| h.direction != HoldDirection::Incoming);

            for hold in incoming {
                self.ledger.release(&hold.id).await?;
                let id = self
                    .ledger
                    .hold_incoming(&hold.account, hold.asset, fresh.dest_amount)
                    .await?;
                self.record_hold(tx, id);
            }
        }

        tx.quote = Some(fresh);
        Ok(())
    }

    fn operation(&self, tx: &Transaction) -> MediatorResult<ChainOperation> {
        let quote = tx
            .quote
            .as_ref()
            .ok_or_else(|| MediatorError::Internal(format!("{} has no quote", tx.id)))?;

        Ok(ChainOperation {
            tx_id: tx.id,
            kind: tx.kind,
            chain: tx.dest_chain,
            account: tx.account.clone(),
            recipient: tx.recipient.clone(),
            asset: tx.asset,
            amount: quote.dest_amount,
        })
    }

    async fn estimate_fee(&self, adapter: &dyn ChainAdapter, op: &ChainOperation) -> Option<NetworkFee> {
        match timeout(self.adapter_timeout(), adapter.estimate_fee(op)).await {
            Ok(Ok(fee)) => Some(fee),
            Ok(Err(e)) => {
                warn!("Fee estimate for {} on {} failed: {}", op.tx_id, op.chain, e);
                None
            }
            Err(_) => {
                warn!("Fee estimate for {} on {} timed out", op.tx_id, op.chain);
                None
            }
        }
    }

    async fn submit_with_retry(
        &self,
        adapter: &dyn ChainAdapter,
        op: &ChainOperation,
    ) -> MediatorResult<PendingHandle> {
        let mut attempt = 0;
        loop {
            let result = match timeout(self.adapter_timeout(), adapter.submit(op)).await {
                Ok(result) => result,
                Err(_) => Err(MediatorError::Timeout {
                    operation: format!("submit on {}", op.chain),
                }),
            };

            match result {
                Ok(pending) => return Ok(pending),
                Err(e) if e.is_safe_to_resubmit() && attempt < self.config.submit_retries => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "Submit of {} on {} failed ({}), retry {}/{} in {:?}",
                        op.tx_id,
                        op.chain,
                        e,
                        attempt + 1,
                        self.config.submit_retries,
                        delay
                    );
                    crate::metrics::record_submit_retry(op.chain);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if matches!(e, MediatorError::Timeout { .. }) {
                        warn!(
                            "Submit of {} on {} timed out and may have been broadcast; not resending",
                            op.tx_id, op.chain
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn await_confirmation(&self, adapter: &dyn ChainAdapter, pending: &PendingHandle) -> PollOutcome {
        for attempt in 0..self.config.max_poll_attempts {
            sleep(self.backoff.delay(attempt)).await;

            match timeout(self.adapter_timeout(), adapter.query(pending)).await {
                Ok(Ok(SubmissionStatus::Confirmed)) => return PollOutcome::Confirmed,
                Ok(Ok(SubmissionStatus::Failed { reason })) => {
                    return PollOutcome::Failed {
                        reason: FailureReason::RejectedOnChain,
                        detail: reason,
                    }
                }
                Ok(Ok(SubmissionStatus::Pending)) => {
                    debug!("{} on {} still pending (poll {})", pending.reference, pending.chain, attempt + 1)
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!("Query of {} on {} failed: {}", pending.reference, pending.chain, e)
                }
                Ok(Err(e)) => {
                    return PollOutcome::Failed {
                        reason: e.failure_reason(),
                        detail: e.to_string(),
                    }
                }
                Err(_) => warn!("Query of {} on {} timed out", pending.reference, pending.chain),
            }
        }

        PollOutcome::Failed {
            reason: FailureReason::Timeout,
            detail: format!(
                "no confirmation after {} polls",
                self.config.max_poll_attempts
            ),
        }
    }

    async fn conclude(&self, tx: &mut Transaction, outcome: PollOutcome) -> MediatorResult<Transaction> {
        match outcome {
            PollOutcome::Confirmed => {
                for hold in std::mem::take(&mut tx.holds) {
                    if let Err(e) = self.ledger.settle(&hold.id).await {
                        error!("Failed to settle hold {} of {}: {}", hold.id, tx.id, e);
                    }
                }
                tx.unlocks_at = tx.kind.lock_period().map(|period| Utc::now() + period);
                self.advance(tx, TransactionStatus::Confirmed).await?;

                if let Some(pending) = &tx.handle {
                    let latency = (Utc::now() - pending.submitted_at).num_milliseconds() as f64 / 1000.0;
                    crate::metrics::record_confirmation_latency(pending.chain, latency);
                }
                self.in_flight.remove(&tx.id);
                info!("Transaction {} confirmed on {}", tx.id, tx.dest_chain);
            }
            PollOutcome::Failed { reason, detail } => {
                warn!("Transaction {} failed on {}: {}", tx.id, tx.dest_chain, detail);
                self.roll_back(tx, reason, detail).await?;
            }
        }
        Ok(tx.clone())
    }

    async fn abort(&self, tx: &mut Transaction, err: &MediatorError) -> MediatorResult<Transaction> {
        warn!("Transaction {} failed while {}: {}", tx.id, tx.status, err);
        self.roll_back(tx, err.failure_reason(), err.to_string()).await?;
        Ok(tx.clone())
    }

    async fn roll_back(
        &self,
        tx: &mut Transaction,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> MediatorResult<()> {
        tx.fail(reason, detail)?;
        self.checkpoint(tx).await;
        self.finish_rollback(tx, reason).await
    }

    /// Release holds of a Failed transaction and mark it RolledBack
    async fn finish_rollback(&self, tx: &mut Transaction, reason: FailureReason) -> MediatorResult<()> {
        for hold in std::mem::take(&mut tx.holds) {
            if let Err(e) = self.ledger.release(&hold.id).await {
                error!("Failed to release hold {} of {}: {}", hold.id, tx.id, e);
            }
        }

        self.advance(tx, TransactionStatus::RolledBack).await?;
        crate::metrics::record_rollback(reason);
        self.in_flight.remove(&tx.id);
        info!("Transaction {} rolled back ({})", tx.id, reason.as_str());
        Ok(())
    }

    async fn advance(&self, tx: &mut Transaction, next: TransactionStatus) -> MediatorResult<()> {
        tx.transition(next)?;
        debug!("Transaction {} -> {}", tx.id, next);
        if next == TransactionStatus::Reserved {
            self.reserved_since.insert(tx.id, Instant::now());
        } else {
            self.reserved_since.remove(&tx.id);
        }
        self.checkpoint(tx).await;
        Ok(())
    }

    /// Publish and persist the record along with the balances it touches,
    /// in one store write. Persistence failures are logged; in-memory state
    /// stays authoritative.
    async fn checkpoint(&self, tx: &Transaction) {
        self.records.insert(tx.id, tx.clone());

        let mut touched = vec![&tx.account];
        if tx.beneficiary() != &tx.account {
            touched.push(tx.beneficiary());
        }
        let mut accounts = Vec::with_capacity(touched.len());
        for account in touched {
            if let Some(snapshot) = self.ledger.snapshot(account).await {
                accounts.push(snapshot);
            }
        }

        if let Err(e) = self.store.save_checkpoint(tx, &accounts).await {
            warn!("Failed to persist checkpoint of {} ({}): {}", tx.id, tx.status, e);
        }

        self.events.publish(tx);
    }
}
