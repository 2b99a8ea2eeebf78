//! Execution backend abstraction.
//!
//! `PaperExecutor` and `LiveExecutor` both implement the same `Executor`
//! trait with exactly `open`/`close`, so `CopyEngine` never branches on
//! mode.

use crate::bankroll::VirtualBankroll;
use crate::config::ExecutorConfig;
use crate::error::CoreError;
use crate::models::TradeSide;
use crate::money::{Probability, Usd};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Fill {
    pub price: Probability,
    pub commission: Usd,
    pub gas_cost: Usd,
    pub external_id: String,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn open(
        &self,
        market_id: &str,
        side: TradeSide,
        size_usd: Usd,
        limit_price: Probability,
        whale_source: Option<&str>,
    ) -> Result<Fill, CoreError>;

    async fn close(&self, position_id: &str, limit_price: Probability) -> Result<Fill, CoreError>;
}

/// Delegates straight to `VirtualBankroll`; fees are a fixed schedule since
/// there is no real order book to report a fill against.
pub struct PaperExecutor {
    bankroll: Arc<VirtualBankroll>,
    commission_rate: rust_decimal::Decimal,
}

impl PaperExecutor {
    pub fn new(bankroll: Arc<VirtualBankroll>, commission_rate: rust_decimal::Decimal) -> Self {
        Self {
            bankroll,
            commission_rate,
        }
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    async fn open(
        &self,
        market_id: &str,
        side: TradeSide,
        size_usd: Usd,
        limit_price: Probability,
        whale_source: Option<&str>,
    ) -> Result<Fill, CoreError> {
        let commission = size_usd * self.commission_rate;
        let gas_cost = Usd::ZERO;
        let position_id = self
            .bankroll
            .open_position(
                market_id,
                side,
                size_usd,
                limit_price,
                commission,
                gas_cost,
                whale_source.map(|s| s.to_string()),
                chrono::Utc::now(),
            )
            .await?;
        Ok(Fill {
            price: limit_price,
            commission,
            gas_cost,
            external_id: position_id,
        })
    }

    async fn close(&self, position_id: &str, limit_price: Probability) -> Result<Fill, CoreError> {
        let commission = Usd::ZERO;
        let gas_cost = Usd::ZERO;
        self.bankroll
            .close_position(position_id, limit_price, commission, gas_cost, chrono::Utc::now())
            .await?;
        Ok(Fill {
            price: limit_price,
            commission,
            gas_cost,
            external_id: position_id.to_string(),
        })
    }
}

/// Interface-only stub: the Builder/REST wire format is out of scope for
/// this paper-trading bot. Every call fails loudly rather than silently
/// no-op'ing, so a misconfigured live run cannot appear to trade
/// successfully.
pub struct LiveExecutor {
    config: ExecutorConfig,
}

impl LiveExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for LiveExecutor {
    async fn open(
        &self,
        _market_id: &str,
        _side: TradeSide,
        _size_usd: Usd,
        _limit_price: Probability,
        _whale_source: Option<&str>,
    ) -> Result<Fill, CoreError> {
        if self.config.clob_api_key.is_none() {
            return Err(CoreError::Auth("live executor missing CLOB credentials".into()));
        }
        Err(CoreError::Executor(
            "live order submission is outside this crate's core (Builder/REST wire format unspecified)".into(),
        ))
    }

    async fn close(&self, _position_id: &str, _limit_price: Probability) -> Result<Fill, CoreError> {
        Err(CoreError::Executor(
            "live order submission is outside this crate's core (Builder/REST wire format unspecified)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::store::Store;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn paper_executor_open_then_close_round_trips_through_bankroll() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config = SupervisorConfig::default();
        config.initial_bankroll_usd = dec!(100);
        let bankroll = Arc::new(VirtualBankroll::new(&config, store));
        let executor = PaperExecutor::new(bankroll.clone(), dec!(0.01));

        let fill = executor
            .open(
                "m1",
                TradeSide::Buy,
                Usd::new(dec!(5)),
                Probability::new(dec!(0.4)),
                Some("0xwhale"),
            )
            .await
            .unwrap();
        assert_eq!(fill.commission, Usd::new(dec!(0.05)));

        let close_fill = executor
            .close(&fill.external_id, Probability::new(dec!(0.5)))
            .await
            .unwrap();
        assert_eq!(close_fill.price, Probability::new(dec!(0.5)));
    }

    #[tokio::test]
    async fn live_executor_without_credentials_fails_auth() {
        let executor = LiveExecutor::new(ExecutorConfig::default());
        let result = executor
            .open(
                "m1",
                TradeSide::Buy,
                Usd::new(dec!(5)),
                Probability::new(dec!(0.4)),
                None,
            )
            .await;
        assert!(matches!(result, Err(CoreError::Auth(_))));
    }
}
