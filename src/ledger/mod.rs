//! Per-user, per-asset balance store
//!
//! Every mutation of an account happens under that account's lock, so two
//! reservations against the same balance can never both succeed when only
//! one fits. Accounts are independent of each other and never contend.
//!
//! Balances move only through `reserve`/`hold_incoming`, `settle`,
//! `release` and `credit`.

mod account;

pub use account::{Account, AssetBalance, HoldDirection, Reservation, ReservationId};

use crate::error::{MediatorError, MediatorResult};
use crate::types::{AccountId, Asset};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Balance store with pending/settled states
pub struct AssetLedger {
    /// Accounts indexed by id, each behind its own lock
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    /// Open holds
    reservations: DashMap<ReservationId, Reservation>,
}

impl AssetLedger {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            reservations: DashMap::new(),
        }
    }

    fn handle(&self, account: &AccountId) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(account.clone()))))
            .value()
            .clone()
    }

    fn existing_handle(&self, account: &AccountId) -> Option<Arc<Mutex<Account>>> {
        self.accounts.get(account).map(|a| a.value().clone())
    }

    /// Open an account (no-op if it already exists) and return a snapshot
    pub async fn open_account(&self, account: &AccountId) -> Account {
        self.handle(account).lock().await.clone()
    }

    /// Move `amount` from available to pending-out
    pub async fn reserve(
        &self,
        account: &AccountId,
        asset: Asset,
        amount: i64,
    ) -> MediatorResult<ReservationId> {
        if amount <= 0 {
            return Err(MediatorError::InvalidAmount(format!(
                "reservation amount must be positive, got {}",
                amount
            )));
        }

        let handle = self.handle(account);
        let mut acct = handle.lock().await;
        let balance = acct.balance_mut(asset);

        let available = balance.available();
        if available < amount {
            return Err(MediatorError::InsufficientFunds {
                account: account.clone(),
                asset,
                available,
                requested: amount,
            });
        }

        balance.pending_out += amount;
        acct.touch();

        let id = self.insert_reservation(account, asset, amount, HoldDirection::Outgoing);
        debug!("Reserved {} {} from {} ({})", amount, asset, account, id);
        Ok(id)
    }

    /// Record an expected incoming amount as pending-in
    pub async fn hold_incoming(
        &self,
        account: &AccountId,
        asset: Asset,
        amount: i64,
    ) -> MediatorResult<ReservationId> {
        if amount <= 0 {
            return Err(MediatorError::InvalidAmount(format!(
                "incoming amount must be positive, got {}",
                amount
            )));
        }

        let handle = self.handle(account);
        let mut acct = handle.lock().await;
        let balance = acct.balance_mut(asset);
        balance.pending_in = balance
            .pending_in
            .checked_add(amount)
            .ok_or_else(|| MediatorError::InvalidAmount("pending-in overflow".to_string()))?;
        acct.touch();

        let id = self.insert_reservation(account, asset, amount, HoldDirection::Incoming);
        debug!("Holding incoming {} {} for {} ({})", amount, asset, account, id);
        Ok(id)
    }

    fn insert_reservation(
        &self,
        account: &AccountId,
        asset: Asset,
        amount: i64,
        direction: HoldDirection,
    ) -> ReservationId {
        let id = ReservationId::new();
        self.reservations.insert(
            id,
            Reservation {
                id,
                account: account.clone(),
                asset,
                amount,
                direction,
                created_at: Utc::now(),
            },
        );
        crate::metrics::set_active_reservations(self.reservations.len());
        id
    }

    /// Commit a hold. Fails if it was already settled or released.
    ///
    /// The new balance is computed and checked before anything changes, so
    /// a failed settle leaves the hold open and the account untouched.
    pub async fn settle(&self, id: &ReservationId) -> MediatorResult<()> {
        let reservation = self
            .reservations
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| MediatorError::UnknownReservation(id.to_string()))?;

        let handle = self.handle(&reservation.account);
        let mut acct = handle.lock().await;
        let mut settled = acct.balance(reservation.asset);

        match reservation.direction {
            HoldDirection::Outgoing => {
                settled.pending_out -= reservation.amount;
                settled.total = settled.total.checked_sub(reservation.amount).ok_or_else(|| {
                    MediatorError::InvalidAmount("balance underflow on settle".to_string())
                })?;
            }
            HoldDirection::Incoming => {
                settled.pending_in -= reservation.amount;
                settled.total = settled.total.checked_add(reservation.amount).ok_or_else(|| {
                    MediatorError::InvalidAmount("balance overflow on settle".to_string())
                })?;
            }
        }

        if !settled.is_consistent() {
            return Err(MediatorError::Internal(format!(
                "balance of {} in {} would be inconsistent after settling {}",
                reservation.asset, reservation.account, id
            )));
        }

        // Claimed under the account lock: a racing settle or release wins at most once
        if self.reservations.remove(id).is_none() {
            return Err(MediatorError::UnknownReservation(id.to_string()));
        }
        crate::metrics::set_active_reservations(self.reservations.len());

        *acct.balance_mut(reservation.asset) = settled;
        acct.touch();

        info!(
            "Settled {:?} hold {} of {} {} on {}",
            reservation.direction, id, reservation.amount, reservation.asset, reservation.account
        );
        Ok(())
    }

    /// Cancel a hold. Releasing an already settled or released hold is a no-op.
    pub async fn release(&self, id: &ReservationId) -> MediatorResult<()> {
        let Some((_, reservation)) = self.reservations.remove(id) else {
            debug!("Release of {} ignored, hold no longer open", id);
            return Ok(());
        };
        crate::metrics::set_active_reservations(self.reservations.len());

        let handle = self.handle(&reservation.account);
        let mut acct = handle.lock().await;
        let balance = acct.balance_mut(reservation.asset);

        match reservation.direction {
            HoldDirection::Outgoing => balance.pending_out -= reservation.amount,
            HoldDirection::Incoming => balance.pending_in -= reservation.amount,
        }

        if !balance.is_consistent() {
            return Err(MediatorError::Internal(format!(
                "balance of {} in {} inconsistent after releasing {}",
                reservation.asset, reservation.account, id
            )));
        }
        acct.touch();

        debug!(
            "Released {:?} hold {} of {} {} on {}",
            reservation.direction, id, reservation.amount, reservation.asset, reservation.account
        );
        Ok(())
    }

    /// Increase `total` directly
    pub async fn credit(&self, account: &AccountId, asset: Asset, amount: i64) -> MediatorResult<()> {
        if amount < 0 {
            return Err(MediatorError::InvalidAmount(format!(
                "credit amount must be non-negative, got {}",
                amount
            )));
        }

        let handle = self.handle(account);
        let mut acct = handle.lock().await;
        let balance = acct.balance_mut(asset);
        balance.total = balance
            .total
            .checked_add(amount)
            .ok_or_else(|| MediatorError::InvalidAmount("balance overflow".to_string()))?;
        acct.touch();

        debug!("Credited {} {} to {}", amount, asset, account);
        Ok(())
    }

    /// Current balance of one asset (zero for unknown accounts)
    pub async fn balance(&self, account: &AccountId, asset: Asset) -> AssetBalance {
        match self.existing_handle(account) {
            Some(handle) => handle.lock().await.balance(asset),
            None => AssetBalance::new(asset),
        }
    }

    pub async fn snapshot(&self, account: &AccountId) -> Option<Account> {
        let handle = self.existing_handle(account)?;
        let acct = handle.lock().await;
        Some(acct.clone())
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    pub fn active_reservations(&self) -> usize {
        self.reservations.len()
    }

    /// Replace an account with a persisted snapshot (startup replay)
    pub async fn restore_account(&self, account: Account) {
        if account.balances.values().any(|b| !b.is_consistent()) {
            warn!("Restoring account {} with inconsistent balances", account.id);
        }
        let id = account.id.clone();
        match self.existing_handle(&id) {
            Some(handle) => *handle.lock().await = account,
            None => {
                self.accounts.insert(id, Arc::new(Mutex::new(account)));
            }
        }
    }

    /// Re-register an open hold whose amount is already reflected in a
    /// restored account snapshot
    pub fn restore_reservation(&self, reservation: Reservation) {
        self.reservations.insert(reservation.id, reservation);
        crate::metrics::set_active_reservations(self.reservations.len());
    }
}

impl Default for AssetLedger {
    fn default() -> Self {
        Self::new()
    }
}
