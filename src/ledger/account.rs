//! Account and per-asset balance records

use crate::types::{AccountId, Asset};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Balance of one asset inside an account, in minor units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: Asset,
    /// Settled holdings
    pub total: i64,
    /// Reserved for outgoing operations not yet settled
    pub pending_out: i64,
    /// Expected incoming amounts not yet settled
    pub pending_in: i64,
}

impl AssetBalance {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            total: 0,
            pending_out: 0,
            pending_in: 0,
        }
    }

    /// Spendable amount: everything settled that is not reserved
    pub fn available(&self) -> i64 {
        self.total - self.pending_out
    }

    pub(crate) fn is_consistent(&self) -> bool {
        self.total >= 0 && self.pending_out >= 0 && self.pending_in >= 0 && self.pending_out <= self.total
    }
}

/// A user's balances, one entry per supported asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balances: BTreeMap<Asset, AssetBalance>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId) -> Self {
        let balances = Asset::ALL
            .iter()
            .map(|asset| (*asset, AssetBalance::new(*asset)))
            .collect();

        Self {
            id,
            balances,
            updated_at: Utc::now(),
        }
    }

    pub fn balance(&self, asset: Asset) -> AssetBalance {
        self.balances
            .get(&asset)
            .cloned()
            .unwrap_or_else(|| AssetBalance::new(asset))
    }

    pub(crate) fn balance_mut(&mut self, asset: Asset) -> &mut AssetBalance {
        self.balances
            .entry(asset)
            .or_insert_with(|| AssetBalance::new(asset))
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Handle for a hold placed on funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the balance a hold sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldDirection {
    /// Counts against `pending_out`; settling debits `total`
    Outgoing,
    /// Counts against `pending_in`; settling credits `total`
    Incoming,
}

/// An open hold on an account's funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub account: AccountId,
    pub asset: Asset,
    pub amount: i64,
    pub direction: HoldDirection,
    pub created_at: DateTime<Utc>,
}
