//! Fee estimation and bumping for resend attempts

use crate::error::{Error, Result};
use crate::tx::types::Fee;

use async_trait::async_trait;
use ethers::types::{Bytes, U256};
use std::sync::Arc;
use tracing::debug;

/// Source of the current market fee, typically an RPC provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    async fn current_fee(&self) -> Result<Fee>;
}

/// Fee quotes for transaction attempts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Market fee and gas limit for a fresh attempt at the given payload
    async fn get_fee(&self, payload: &Bytes, gas_limit_hint: u64) -> Result<(Fee, u64)>;

    /// Fee and gas limit for a replacement attempt, bumped from a previous fee.
    /// Implementations must return a fee that covers `previous`.
    async fn bump_fee(&self, previous: &Fee, gas_limit_hint: u64) -> Result<(Fee, u64)>;
}

/// Default estimator: market quote with a safety buffer, percentage bumps
pub struct GasEstimator {
    source: Arc<dyn GasPriceSource>,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Replacement fee as a percentage of the previous fee (>= 100)
    bump_percent: u64,
}

impl GasEstimator {
    pub fn new(source: Arc<dyn GasPriceSource>) -> Self {
        Self {
            source,
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
            bump_percent: 125,
        }
    }

    fn buffered_limit(&self, gas_limit_hint: u64) -> u64 {
        gas_limit_hint + gas_limit_hint * self.gas_limit_buffer_percent / 100
    }

    fn buffered(&self, fee: Fee) -> Fee {
        let pct = self.gas_price_buffer_percent;
        scale_fee(&fee, 100 + pct)
    }
}

#[async_trait]
impl FeeEstimator for GasEstimator {
    async fn get_fee(&self, _payload: &Bytes, gas_limit_hint: u64) -> Result<(Fee, u64)> {
        let market = self.source.current_fee().await?;
        let fee = self.buffered(market);
        debug!("Market fee quote: {:?}", fee);
        Ok((fee, self.buffered_limit(gas_limit_hint)))
    }

    async fn bump_fee(&self, previous: &Fee, gas_limit_hint: u64) -> Result<(Fee, u64)> {
        if self.bump_percent < 100 {
            return Err(Error::FeeEstimation(format!(
                "bump percent {} would lower the fee",
                self.bump_percent
            )));
        }

        let bumped = scale_fee(previous, self.bump_percent);

        // A replacement priced below the current market would be rejected by
        // the mempool anyway; take the componentwise max of the two.
        let market = self.buffered(self.source.current_fee().await?);
        let fee = max_components(&bumped, &market);

        debug!("Bumped fee: {:?} (previous {:?})", fee, previous);
        Ok((fee, self.buffered_limit(gas_limit_hint)))
    }
}

fn scale_fee(fee: &Fee, percent: u64) -> Fee {
    let pct = U256::from(percent);
    match fee {
        Fee::Legacy(price) => Fee::Legacy(*price * pct / 100),
        Fee::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Fee::Eip1559 {
            max_fee_per_gas: *max_fee_per_gas * pct / 100,
            max_priority_fee_per_gas: *max_priority_fee_per_gas * pct / 100,
        },
    }
}

/// Componentwise max of two fees; falls back to `a` on mixed kinds
fn max_components(a: &Fee, b: &Fee) -> Fee {
    match (a, b) {
        (Fee::Legacy(x), Fee::Legacy(y)) => Fee::Legacy(std::cmp::max(*x, *y)),
        (
            Fee::Eip1559 {
                max_fee_per_gas: x_max,
                max_priority_fee_per_gas: x_prio,
            },
            Fee::Eip1559 {
                max_fee_per_gas: y_max,
                max_priority_fee_per_gas: y_prio,
            },
        ) => Fee::Eip1559 {
            max_fee_per_gas: std::cmp::max(*x_max, *y_max),
            max_priority_fee_per_gas: std::cmp::max(*x_prio, *y_prio),
        },
        _ => a.clone(),
    }
}
