//! Gas price buffering and network fee calculation for EVM chains

use ethers::types::U256;

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Applies safety buffers to gas limits and prices
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    pub fn buffered_gas_limit(&self, base: u64) -> u64 {
        base.saturating_add(base.saturating_mul(self.gas_limit_buffer_percent) / 100)
    }

    pub fn buffered_price(&self, price: &GasPrice) -> GasPrice {
        let pct = self.gas_price_buffer_percent;
        match price {
            GasPrice::Legacy(p) => GasPrice::Legacy(*p + *p * pct / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas + *max_fee_per_gas * pct / 100,
                max_priority_fee_per_gas: *max_priority_fee_per_gas
                    + *max_priority_fee_per_gas * pct / 100,
            },
        }
    }

    /// Worst-case cost in wei, saturating at `u128::MAX`
    pub fn calculate_cost(gas_limit: u64, gas_price: &GasPrice) -> u128 {
        let per_gas = match gas_price {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        };
        let cost = per_gas.saturating_mul(U256::from(gas_limit));
        if cost > U256::from(u128::MAX) {
            u128::MAX
        } else {
            cost.as_u128()
        }
    }
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers() {
        let estimator = FeeEstimator::new();
        assert_eq!(estimator.buffered_gas_limit(100_000), 120_000);
        assert_eq!(
            estimator.buffered_price(&GasPrice::Legacy(U256::from(1_000u64))),
            GasPrice::Legacy(U256::from(1_100u64))
        );
    }

    #[test]
    fn test_cost_uses_max_fee() {
        let price = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(50u64),
            max_priority_fee_per_gas: U256::from(2u64),
        };
        assert_eq!(FeeEstimator::calculate_cost(21_000, &price), 1_050_000);
        assert_eq!(
            FeeEstimator::calculate_cost(2, &GasPrice::Legacy(U256::MAX)),
            u128::MAX
        );
    }
}
