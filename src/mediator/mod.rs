//! Cross-chain amount mediation
//!
//! Converts an amount of an asset on a source chain into the equivalent
//! amount on a destination chain using a pluggable [`RateSource`] and a
//! flat basis-point fee. Quotes are single-use and expire after a TTL.

mod rate;

pub use rate::{RateSource, StaticRateSource};

#[cfg(test)]
pub use rate::MockRateSource;

use crate::config::MediatorConfig;
use crate::error::{MediatorError, MediatorResult};
use crate::types::{Asset, ChainId};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default quote lifetime
pub const DEFAULT_QUOTE_TTL: Duration = Duration::from_secs(30);

const BPS_DENOMINATOR: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteId(Uuid);

impl fmt::Display for QuoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable conversion offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediationQuote {
    pub id: QuoteId,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub asset: Asset,
    pub source_amount: i64,
    pub dest_amount: i64,
    pub fee: i64,
    pub rate: Decimal,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MediationQuote {
    pub fn is_pass_through(&self) -> bool {
        self.source_chain == self.dest_chain
    }
}

/// Quote issuer
pub struct Mediator {
    rates: Arc<dyn RateSource>,
    fee_bps: u32,
    ttl: Duration,
    /// Outstanding quotes and their deadlines
    issued: DashMap<QuoteId, Instant>,
}

impl Mediator {
    pub fn new(rates: Arc<dyn RateSource>, config: &MediatorConfig) -> Self {
        Self {
            rates,
            fee_bps: config.fee_bps,
            ttl: Duration::from_secs(config.quote_ttl_secs),
            issued: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Price `amount` of `asset` moving from `source_chain` to `dest_chain`
    pub async fn quote(
        &self,
        source_chain: ChainId,
        dest_chain: ChainId,
        asset: Asset,
        amount: i64,
    ) -> MediatorResult<MediationQuote> {
        if amount <= 0 {
            return Err(MediatorError::InvalidAmount(format!(
                "quote amount must be positive, got {}",
                amount
            )));
        }

        let (rate, gross, fee) = if source_chain == dest_chain {
            (Decimal::ONE, amount, 0)
        } else {
            let unsupported = || MediatorError::UnsupportedPair {
                asset,
                from: source_chain,
                to: dest_chain,
            };

            let rate = self
                .rates
                .get_rate(asset, source_chain, dest_chain)
                .await
                .ok_or_else(unsupported)?;
            if rate <= Decimal::ZERO {
                warn!(
                    "Rate source returned non-positive rate {} for {} {} -> {}",
                    rate, asset, source_chain, dest_chain
                );
                return Err(unsupported());
            }

            let gross = Decimal::from(amount)
                .checked_mul(rate)
                .and_then(|v| v.floor().to_i64())
                .ok_or_else(|| MediatorError::InvalidAmount("converted amount overflows".to_string()))?;
            (rate, gross, self.fee_for(gross))
        };

        let dest_amount = gross - fee;
        if dest_amount <= 0 {
            return Err(MediatorError::InvalidAmount(format!(
                "{} {} does not cover the mediation fee",
                amount, asset
            )));
        }

        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| MediatorError::Config(format!("quote ttl out of range: {}", e)))?;

        let quote = MediationQuote {
            id: QuoteId(Uuid::new_v4()),
            source_chain,
            dest_chain,
            asset,
            source_amount: amount,
            dest_amount,
            fee,
            rate,
            issued_at,
            expires_at: issued_at + ttl,
        };

        self.issued.insert(quote.id, Instant::now() + self.ttl);
        crate::metrics::record_quote_issued(source_chain, dest_chain);

        debug!(
            "Quote {}: {} {} {} -> {} {} (fee {})",
            quote.id, amount, asset, source_chain, dest_chain, dest_amount, fee
        );
        Ok(quote)
    }

    /// Fee in destination minor units, rounded up
    fn fee_for(&self, gross: i64) -> i64 {
        if self.fee_bps == 0 {
            return 0;
        }
        let fee = Decimal::from(gross) * Decimal::from(self.fee_bps) / Decimal::from(BPS_DENOMINATOR);
        fee.ceil().to_i64().unwrap_or(gross)
    }

    /// Consume a quote. Fails if it expired or was already used.
    pub fn redeem(&self, quote: &MediationQuote) -> MediatorResult<()> {
        let expired = || MediatorError::QuoteExpired {
            quote_id: quote.id.to_string(),
        };

        let (_, deadline) = self.issued.remove(&quote.id).ok_or_else(expired)?;
        if Instant::now() >= deadline {
            crate::metrics::record_quote_expired();
            debug!("Quote {} redeemed after expiry", quote.id);
            return Err(expired());
        }
        Ok(())
    }

    /// Whether a quote can still be redeemed
    pub fn is_live(&self, quote: &MediationQuote) -> bool {
        self.issued
            .get(&quote.id)
            .map(|deadline| Instant::now() < *deadline)
            .unwrap_or(false)
    }

    /// Drop expired outstanding quotes, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.issued.len();
        self.issued.retain(|_, deadline| *deadline > now);
        before - self.issued.len()
    }

    /// USD denomination of an amount, in USD minor units
    pub async fn usd_value(&self, asset: Asset, amount: i64) -> Option<i64> {
        let price = self.rates.usd_price(asset).await?;
        let whole = Decimal::from(amount) / Decimal::from(10i64.pow(asset.decimals()));
        let usd_minor = whole * price * Decimal::from(10i64.pow(Asset::Usd.decimals()));
        usd_minor.floor().to_i64()
    }
}
