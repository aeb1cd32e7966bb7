//! Reference rate sources

use crate::config::MediatorConfig;
use crate::types::{Asset, ChainId};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

/// External collaborator supplying conversion rates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Units of `asset` on `to` received per unit on `from`; `None` when no
    /// route exists or the source is unavailable
    async fn get_rate(&self, asset: Asset, from: ChainId, to: ChainId) -> Option<Decimal>;

    /// USD price of one whole unit of `asset`
    async fn usd_price(&self, _asset: Asset) -> Option<Decimal> {
        None
    }
}

/// Fixed rate table loaded from configuration
#[derive(Default)]
pub struct StaticRateSource {
    rates: DashMap<(Asset, ChainId, ChainId), Decimal>,
    usd_prices: DashMap<Asset, Decimal>,
}

impl StaticRateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &MediatorConfig) -> Self {
        let source = Self::new();
        for entry in &config.rates {
            source.set_rate(entry.asset, entry.from, entry.to, entry.rate);
        }
        for entry in &config.usd_prices {
            source.set_usd_price(entry.asset, entry.price);
        }
        source
    }

    pub fn set_rate(&self, asset: Asset, from: ChainId, to: ChainId, rate: Decimal) {
        self.rates.insert((asset, from, to), rate);
    }

    pub fn set_usd_price(&self, asset: Asset, price: Decimal) {
        self.usd_prices.insert(asset, price);
    }

    pub fn remove_rate(&self, asset: Asset, from: ChainId, to: ChainId) {
        self.rates.remove(&(asset, from, to));
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn get_rate(&self, asset: Asset, from: ChainId, to: ChainId) -> Option<Decimal> {
        self.rates.get(&(asset, from, to)).map(|r| *r.value())
    }

    async fn usd_price(&self, asset: Asset) -> Option<Decimal> {
        if asset == Asset::Usd {
            return Some(Decimal::ONE);
        }
        self.usd_prices.get(&asset).map(|p| *p.value())
    }
}
