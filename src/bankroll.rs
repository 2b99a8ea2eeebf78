//! Virtual (paper) bankroll ledger.
//!
//! Cash/position bookkeeping, notional-based: a paper position is sized in
//! USD against a 0..1 probability price, not in token shares, using this
//! crate's `Usd`/`Decimal` types throughout rather than floats. All
//! mutation serializes through one `tokio::sync::Mutex`.

use crate::config::SupervisorConfig;
use crate::error::CoreError;
use crate::models::{BankrollSnapshot, PositionStatus, TradeSide, VirtualTradeRecord};
use crate::money::{Probability, Usd};
use crate::store::Store;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OpenPositionRecord {
    pub trade_id: String,
    pub market_id: String,
    pub side: TradeSide,
    pub size_usd: Usd,
    pub entry_price: Probability,
    pub whale_source: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct LedgerState {
    available: Usd,
    allocated: Usd,
    daily_pnl: Usd,
    daily_drawdown: Usd,
    peak_capital: Usd,
    total_trades: u64,
    win_count: u64,
    loss_count: u64,
}

impl LedgerState {
    fn total_capital(&self) -> Usd {
        self.available + self.allocated
    }
}

#[derive(Debug, Clone)]
pub struct BankrollStats {
    pub total_capital: Usd,
    pub available: Usd,
    pub allocated: Usd,
    pub win_rate: rust_decimal::Decimal,
    pub roi: rust_decimal::Decimal,
    pub total_trades: u64,
    pub max_consecutive_losses: u32,
}

struct Inner {
    state: LedgerState,
    open_positions: HashMap<String, OpenPositionRecord>,
    consecutive_losses: u32,
    max_consecutive_losses: u32,
    daily_reset_day: u32,
}

/// Deterministic paper-trading ledger. Constructed once at startup, seeded
/// to `initial_bankroll`, and shared behind an `Arc` with every task that
/// needs to open/close positions (`CopyEngine`'s paper executor,
/// `MetricsAggregator` for unrealized PnL).
pub struct VirtualBankroll {
    initial_bankroll: Usd,
    store: Arc<Store>,
    inner: Mutex<Inner>,
}

impl VirtualBankroll {
    pub fn new(config: &SupervisorConfig, store: Arc<Store>) -> Self {
        let initial_bankroll = Usd::new(config.initial_bankroll_usd);
        Self {
            initial_bankroll,
            store,
            inner: Mutex::new(Inner {
                state: LedgerState {
                    available: initial_bankroll,
                    allocated: Usd::ZERO,
                    daily_pnl: Usd::ZERO,
                    daily_drawdown: Usd::ZERO,
                    peak_capital: initial_bankroll,
                    total_trades: 0,
                    win_count: 0,
                    loss_count: 0,
                },
                open_positions: HashMap::new(),
                consecutive_losses: 0,
                max_consecutive_losses: 0,
                daily_reset_day: Utc::now().ordinal(),
            }),
        }
    }

    /// UTC-midnight rollover for `daily_pnl`/`daily_drawdown`, mirroring
    /// `RiskManager::maybe_reset_daily` so `BankrollSnapshot`'s daily figures
    /// don't drift across day boundaries.
    fn maybe_reset_daily(inner: &mut Inner, now: DateTime<Utc>) {
        let today = now.ordinal();
        if today != inner.daily_reset_day {
            inner.daily_reset_day = today;
            inner.state.daily_pnl = Usd::ZERO;
            inner.state.daily_drawdown = Usd::ZERO;
        }
    }

    /// `size > 0`, `0 < price < 1`; rejects with `InsufficientFunds` if
    /// `available < size + commission + gas_cost`.
    pub async fn open_position(
        &self,
        market_id: &str,
        side: TradeSide,
        size: Usd,
        price: Probability,
        commission: Usd,
        gas_cost: Usd,
        whale_source: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        if size.inner() <= rust_decimal::Decimal::ZERO {
            return Err(CoreError::Protocol("open_position: size must be > 0".into()));
        }
        if !price.is_valid() {
            return Err(CoreError::Protocol(
                "open_position: price must be in (0, 1)".into(),
            ));
        }

        let total_cost = size + commission + gas_cost;
        let mut inner = self.inner.lock().await;
        Self::maybe_reset_daily(&mut inner, now);
        if inner.state.available.inner() < total_cost.inner() {
            return Err(CoreError::InsufficientFunds {
                needed: total_cost.to_string(),
                available: inner.state.available.to_string(),
            });
        }

        let trade_id = Uuid::new_v4().to_string();
        let position_id = trade_id.clone();

        let mut next_state = inner.state;
        next_state.available -= total_cost;
        next_state.allocated += size;
        next_state.total_trades += 1;

        let record = VirtualTradeRecord {
            trade_id: trade_id.clone(),
            position_id: position_id.clone(),
            market_id: market_id.to_string(),
            side,
            status: PositionStatus::Open,
            price,
            exit_price: None,
            size_usd: size,
            commission,
            gas_cost_usd: gas_cost,
            gross_pnl: None,
            whale_source: whale_source.clone(),
            executed_at: now,
            settled_at: None,
        };
        let snapshot = self.snapshot_from(&next_state, now);

        if let Err(e) = self.store.record_trade_and_snapshot(&record, &snapshot).await {
            warn!("rolling back open_position after persistence failure: {e}");
            return Err(e);
        }

        inner.state = next_state;
        inner.open_positions.insert(
            position_id.clone(),
            OpenPositionRecord {
                trade_id,
                market_id: market_id.to_string(),
                side,
                size_usd: size,
                entry_price: price,
                whale_source,
            },
        );

        info!(
            market_id,
            size_usd = %size,
            available = %inner.state.available,
            "opened paper position"
        );
        Ok(position_id)
    }

    /// Gross PnL for a `buy`: `size * (exit - entry) / entry`; negated for
    /// `sell`. All PnL realizes at close — no mark-to-market here.
    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: Probability,
        commission: Usd,
        gas_cost: Usd,
        now: DateTime<Utc>,
    ) -> Result<Usd, CoreError> {
        let mut inner = self.inner.lock().await;
        Self::maybe_reset_daily(&mut inner, now);
        let position = inner
            .open_positions
            .get(position_id)
            .cloned()
            .ok_or_else(|| CoreError::Protocol(format!("no open position {position_id}")))?;

        let raw = position.size_usd.inner()
            * (exit_price.inner() - position.entry_price.inner())
            / position.entry_price.inner();
        let gross_pnl = match position.side {
            TradeSide::Buy => Usd::new(raw),
            TradeSide::Sell => Usd::new(-raw),
        };
        let fees = commission + gas_cost;
        let net_pnl = gross_pnl - fees;

        let mut next_state = inner.state;
        next_state.allocated -= position.size_usd;
        next_state.available += position.size_usd + net_pnl;
        if net_pnl.is_positive() {
            next_state.win_count += 1;
        } else {
            next_state.loss_count += 1;
        }
        next_state.daily_pnl += net_pnl;
        if next_state.total_capital() > next_state.peak_capital {
            next_state.peak_capital = next_state.total_capital();
        }
        if !next_state.peak_capital.is_zero() {
            let drawdown =
                Usd::new((-next_state.daily_pnl.inner()) / next_state.peak_capital.inner());
            next_state.daily_drawdown = next_state.daily_drawdown.max(drawdown);
        }

        let record = VirtualTradeRecord {
            trade_id: position.trade_id.clone(),
            position_id: position_id.to_string(),
            market_id: position.market_id.clone(),
            side: position.side,
            status: PositionStatus::Closed,
            price: position.entry_price,
            exit_price: Some(exit_price),
            size_usd: position.size_usd,
            commission,
            gas_cost_usd: gas_cost,
            gross_pnl: Some(gross_pnl),
            whale_source: position.whale_source.clone(),
            executed_at: now,
            settled_at: Some(now),
        };
        let snapshot = self.snapshot_from(&next_state, now);

        if let Err(e) = self.store.record_trade_and_snapshot(&record, &snapshot).await {
            warn!("rolling back close_position after persistence failure: {e}");
            return Err(e);
        }

        inner.state = next_state;
        inner.open_positions.remove(position_id);
        if net_pnl.is_negative() {
            inner.consecutive_losses += 1;
            inner.max_consecutive_losses =
                inner.max_consecutive_losses.max(inner.consecutive_losses);
        } else {
            inner.consecutive_losses = 0;
        }

        info!(
            position_id,
            net_pnl = %net_pnl,
            available = %inner.state.available,
            "closed paper position"
        );
        Ok(net_pnl)
    }

    /// Test-harness-only reset.
    #[cfg(test)]
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = LedgerState {
            available: self.initial_bankroll,
            allocated: Usd::ZERO,
            daily_pnl: Usd::ZERO,
            daily_drawdown: Usd::ZERO,
            peak_capital: self.initial_bankroll,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
        };
        inner.open_positions.clear();
        inner.consecutive_losses = 0;
        inner.max_consecutive_losses = 0;
        inner.daily_reset_day = Utc::now().ordinal();
    }

    pub async fn stats(&self) -> BankrollStats {
        let inner = self.inner.lock().await;
        let closed_trades = inner.state.win_count + inner.state.loss_count;
        let win_rate = if closed_trades == 0 {
            rust_decimal::Decimal::ZERO
        } else {
            rust_decimal::Decimal::from(inner.state.win_count)
                / rust_decimal::Decimal::from(closed_trades)
        };
        let roi = if self.initial_bankroll.is_zero() {
            rust_decimal::Decimal::ZERO
        } else {
            (inner.state.total_capital().inner() - self.initial_bankroll.inner())
                / self.initial_bankroll.inner()
        };
        BankrollStats {
            total_capital: inner.state.total_capital(),
            available: inner.state.available,
            allocated: inner.state.allocated,
            win_rate,
            roi,
            total_trades: inner.state.total_trades,
            max_consecutive_losses: inner.max_consecutive_losses,
        }
    }

    pub async fn total_capital(&self) -> Usd {
        self.inner.lock().await.state.total_capital()
    }

    pub async fn available(&self) -> Usd {
        self.inner.lock().await.state.available
    }

    fn snapshot_from(&self, state: &LedgerState, now: DateTime<Utc>) -> BankrollSnapshot {
        BankrollSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            total_capital: state.total_capital(),
            allocated_usd: state.allocated,
            available_usd: state.available,
            realized_pnl: state.daily_pnl,
            unrealized_pnl: Usd::ZERO,
            daily_pnl: state.daily_pnl,
            daily_drawdown: state.daily_drawdown,
            total_trades: state.total_trades,
            win_count: state.win_count,
            loss_count: state.loss_count,
            taken_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ledger() -> VirtualBankroll {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config = SupervisorConfig::default();
        config.initial_bankroll_usd = dec!(100);
        VirtualBankroll::new(&config, store)
    }

    #[tokio::test]
    async fn open_then_close_at_even_price_yields_zero_gross_and_negative_fees() {
        let bankroll = ledger();
        let position_id = bankroll
            .open_position(
                "m1",
                TradeSide::Buy,
                Usd::new(dec!(5)),
                Probability::new(dec!(0.40)),
                Usd::new(dec!(0.02)),
                Usd::new(dec!(0.01)),
                Some("0xaaaa".into()),
                now(),
            )
            .await
            .unwrap();

        let net = bankroll
            .close_position(
                &position_id,
                Probability::new(dec!(0.40)),
                Usd::new(dec!(0.02)),
                Usd::new(dec!(0.01)),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(net, Usd::new(dec!(-0.03)));

        let stats = bankroll.stats().await;
        assert_eq!(stats.total_trades, 1);
    }

    #[tokio::test]
    async fn insufficient_funds_is_rejected() {
        let bankroll = ledger();
        let result = bankroll
            .open_position(
                "m1",
                TradeSide::Buy,
                Usd::new(dec!(100.01)),
                Probability::new(dec!(0.5)),
                Usd::ZERO,
                Usd::ZERO,
                None,
                now(),
            )
            .await;
        assert!(matches!(result, Err(CoreError::InsufficientFunds { .. })));
    }

    #[tokio::test]
    async fn total_capital_equals_allocated_plus_available_after_open() {
        let bankroll = ledger();
        bankroll
            .open_position(
                "m1",
                TradeSide::Buy,
                Usd::new(dec!(5)),
                Probability::new(dec!(0.5)),
                Usd::ZERO,
                Usd::ZERO,
                None,
                now(),
            )
            .await
            .unwrap();
        let inner = bankroll.inner.lock().await;
        assert_eq!(
            inner.state.total_capital(),
            inner.state.allocated + inner.state.available
        );
    }

    #[tokio::test]
    async fn full_roundtrip_conserves_capital() {
        let bankroll = ledger();
        let b0 = bankroll.total_capital().await;
        let position_id = bankroll
            .open_position(
                "m1",
                TradeSide::Buy,
                Usd::new(dec!(5)),
                Probability::new(dec!(0.40)),
                Usd::ZERO,
                Usd::ZERO,
                None,
                now(),
            )
            .await
            .unwrap();
        let net = bankroll
            .close_position(
                &position_id,
                Probability::new(dec!(0.50)),
                Usd::ZERO,
                Usd::ZERO,
                now(),
            )
            .await
            .unwrap();
        let available = bankroll.available().await;
        assert_eq!(available, b0 + net);
    }
}
