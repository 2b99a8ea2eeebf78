//! Read-over-Store reporting: win rate, ROI, expectancy, drawdown, and
//! unrealized PnL, recomputed from persisted records only.
//!
//! Every number here is derived from `Store` rows, never from in-memory
//! ledger/detector state, so a restart mid-run reproduces the same report.

use crate::error::CoreError;
use crate::models::{BankrollSnapshot, PositionStatus};
use crate::money::{Probability, Usd};
use crate::store::Store;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Lookback window for the statistics a single `compute` call reports over.
/// Wide enough to span a multi-week paper-trading validation run.
const LOOKBACK_DAYS: i64 = 365;

#[derive(Debug, Clone)]
pub struct MetricsReport {
    pub total_trades: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub win_rate: Decimal,
    pub roi: Decimal,
    pub expectancy: Usd,
    pub max_drawdown_pct: Decimal,
    pub realized_pnl: Usd,
    pub unrealized_pnl: Usd,
    /// Non-gating descriptive statistic; the live-promotion gate never
    /// reads this field.
    pub sharpe_ratio: Option<Decimal>,
}

/// Latest known mark per market, fed by `StreamClient` price-change events,
/// used only to compute `unrealized_pnl` for still-open positions.
pub struct PriceBook {
    marks: std::sync::RwLock<HashMap<String, Probability>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self {
            marks: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, token_id: &str, price: Probability) {
        self.marks.write().unwrap().insert(token_id.to_string(), price);
    }

    pub fn get(&self, token_id: &str) -> Option<Probability> {
        self.marks.read().unwrap().get(token_id).copied()
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure read-over-`Store` aggregator. Holds no ledger state of its own
/// beyond the `PriceBook` marks needed for unrealized PnL.
pub struct MetricsAggregator {
    store: Arc<Store>,
    prices: Arc<PriceBook>,
    initial_bankroll: Usd,
}

impl MetricsAggregator {
    pub fn new(store: Arc<Store>, prices: Arc<PriceBook>, initial_bankroll: Usd) -> Self {
        Self {
            store,
            prices,
            initial_bankroll,
        }
    }

    /// Computes a fresh report from `Store` and persists an equity snapshot
    /// labeled with the current total capital.
    pub async fn compute_and_snapshot(&self, now: DateTime<Utc>) -> Result<MetricsReport, CoreError> {
        let report = self.compute(now).await?;

        let latest = self.store.latest_bankroll_snapshot().await?;
        let (allocated, available) = latest
            .as_ref()
            .map(|s| (s.allocated_usd, s.available_usd))
            .unwrap_or((Usd::ZERO, self.initial_bankroll));
        let total_capital = allocated + available;
        let snapshot = BankrollSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            total_capital,
            allocated_usd: allocated,
            available_usd: available,
            realized_pnl: report.realized_pnl,
            unrealized_pnl: report.unrealized_pnl,
            // This is a periodic equity mark, not the live ledger's own
            // daily bookkeeping (that pairing is written by VirtualBankroll
            // itself); a true daily figure isn't reconstructable here.
            daily_pnl: Usd::ZERO,
            daily_drawdown: Usd::ZERO,
            total_trades: report.total_trades,
            win_count: report.win_count,
            loss_count: report.loss_count,
            taken_at: now,
        };
        self.store.insert_bankroll_snapshot_equity(&snapshot).await?;
        Ok(report)
    }

    /// `total_trades`, `win_rate` (closed only), `roi`, `expectancy`,
    /// `max_drawdown`, `realized_pnl`, `unrealized_pnl`. Never reads
    /// in-memory ledger state.
    pub async fn compute(&self, now: DateTime<Utc>) -> Result<MetricsReport, CoreError> {
        let since = now - chrono::Duration::days(LOOKBACK_DAYS);
        let trades = self.store.trades_in_range(since).await?;

        let closed: Vec<_> = trades
            .iter()
            .filter(|t| t.status == PositionStatus::Closed)
            .collect();
        let total_trades = trades.len() as u64;

        let win_count = closed
            .iter()
            .filter(|t| t.net_pnl().map(|p| p.is_positive()).unwrap_or(false))
            .count() as u64;
        let win_rate = if closed.is_empty() {
            Decimal::ZERO
        } else {
            Decimal::from(win_count) / Decimal::from(closed.len() as u64)
        };

        let realized_pnl = closed
            .iter()
            .filter_map(|t| t.net_pnl())
            .fold(Usd::ZERO, |acc, pnl| acc + pnl);

        let expectancy = if closed.is_empty() {
            Usd::ZERO
        } else {
            Usd::new(realized_pnl.inner() / Decimal::from(closed.len() as u64))
        };

        let open_positions = self.store.all_open_positions().await?;
        let unrealized_pnl = open_positions.iter().fold(Usd::ZERO, |acc, p| {
            let Some(mark) = self.prices.get(&p.token_id) else {
                return acc;
            };
            let raw = p.size_usd.inner() * (mark.inner() - p.entry_price.inner()) / p.entry_price.inner();
            let pnl = match p.status {
                PositionStatus::Open => Usd::new(raw),
                PositionStatus::Closed => Usd::ZERO,
            };
            acc + pnl
        });

        let series = self.store.bankroll_snapshot_series(since).await?;
        let max_drawdown_pct = max_drawdown(&series, self.initial_bankroll);

        let total_capital = series
            .last()
            .map(|s| s.total_capital)
            .unwrap_or(self.initial_bankroll);
        let roi = if self.initial_bankroll.is_zero() {
            Decimal::ZERO
        } else {
            (total_capital.inner() - self.initial_bankroll.inner()) / self.initial_bankroll.inner()
        };

        let sharpe_ratio = sharpe_from_snapshots(&series);

        Ok(MetricsReport {
            total_trades,
            win_count,
            loss_count: closed.len() as u64 - win_count,
            win_rate,
            roi,
            expectancy,
            max_drawdown_pct,
            realized_pnl,
            unrealized_pnl,
            sharpe_ratio,
        })
    }
}

/// Peak-to-trough drawdown over the `total_capital` series, as a percent.
fn max_drawdown(series: &[BankrollSnapshot], floor: Usd) -> Decimal {
    if series.is_empty() {
        return Decimal::ZERO;
    }
    let mut peak = floor.inner().max(series[0].total_capital.inner());
    let mut worst = Decimal::ZERO;
    for snap in series {
        let capital = snap.total_capital.inner();
        if capital > peak {
            peak = capital;
        }
        if peak > Decimal::ZERO {
            let dd = (peak - capital) / peak * Decimal::from(100);
            if dd > worst {
                worst = dd;
            }
        }
    }
    worst
}

/// Mean/stddev of period-over-period returns across the snapshot series;
/// annualization is left to the report renderer since the snapshot cadence
/// is config-driven rather than fixed. Returns `None` with fewer than two
/// snapshots (nothing to diff).
fn sharpe_from_snapshots(series: &[BankrollSnapshot]) -> Option<Decimal> {
    if series.len() < 2 {
        return None;
    }
    let returns: Vec<Decimal> = series
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].total_capital.inner();
            if prev.is_zero() {
                return None;
            }
            Some((w[1].total_capital.inner() - prev) / prev)
        })
        .collect();
    if returns.is_empty() {
        return None;
    }
    let n = Decimal::from(returns.len() as u64);
    let mean = returns.iter().copied().fold(Decimal::ZERO, |a, b| a + b) / n;
    let variance = returns
        .iter()
        .map(|r| (*r - mean) * (*r - mean))
        .fold(Decimal::ZERO, |a, b| a + b)
        / n;
    if variance.is_zero() {
        return None;
    }
    let stddev = variance.sqrt()?;
    if stddev.is_zero() {
        return None;
    }
    Some(mean / stddev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TradeSide, VirtualTradeRecord};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn closed_trade(id: &str, net: Decimal, at: DateTime<Utc>) -> VirtualTradeRecord {
        VirtualTradeRecord {
            trade_id: id.into(),
            position_id: id.into(),
            market_id: "m1".into(),
            side: TradeSide::Buy,
            status: PositionStatus::Closed,
            price: Probability::new(dec!(0.5)),
            exit_price: Some(Probability::new(dec!(0.5))),
            size_usd: Usd::new(dec!(10)),
            commission: Usd::ZERO,
            gas_cost_usd: Usd::ZERO,
            gross_pnl: Some(Usd::new(net)),
            whale_source: None,
            executed_at: at,
            settled_at: Some(at),
        }
    }

    #[tokio::test]
    async fn empty_store_yields_zero_stats_no_divide_by_zero() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let aggregator = MetricsAggregator::new(store, Arc::new(PriceBook::new()), Usd::new(dec!(100)));
        let report = aggregator.compute(now()).await.unwrap();
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.win_rate, Decimal::ZERO);
        assert_eq!(report.roi, Decimal::ZERO);
    }

    #[tokio::test]
    async fn win_rate_counts_only_closed_trades_with_positive_net_pnl() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let snapshot = BankrollSnapshot {
            snapshot_id: "s0".into(),
            total_capital: Usd::new(dec!(100)),
            allocated_usd: Usd::ZERO,
            available_usd: Usd::new(dec!(100)),
            realized_pnl: Usd::ZERO,
            unrealized_pnl: Usd::ZERO,
            daily_pnl: Usd::ZERO,
            daily_drawdown: Usd::ZERO,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
            taken_at: now(),
        };
        store
            .record_trade_and_snapshot(&closed_trade("t1", dec!(5), now()), &snapshot)
            .await
            .unwrap();
        store
            .record_trade_and_snapshot(&closed_trade("t2", dec!(-2), now()), &snapshot)
            .await
            .unwrap();

        let aggregator = MetricsAggregator::new(store, Arc::new(PriceBook::new()), Usd::new(dec!(100)));
        let report = aggregator.compute(now()).await.unwrap();
        assert_eq!(report.total_trades, 2);
        assert_eq!(report.win_rate, dec!(0.5));
        assert_eq!(report.realized_pnl, Usd::new(dec!(3)));
        assert_eq!(report.expectancy, Usd::new(dec!(1.5)));
    }

    #[test]
    fn max_drawdown_measures_peak_to_trough() {
        let series = vec![
            BankrollSnapshot {
                snapshot_id: "1".into(),
                total_capital: Usd::new(dec!(100)),
                allocated_usd: Usd::ZERO,
                available_usd: Usd::new(dec!(100)),
                realized_pnl: Usd::ZERO,
                unrealized_pnl: Usd::ZERO,
                daily_pnl: Usd::ZERO,
                daily_drawdown: Usd::ZERO,
                total_trades: 0,
                win_count: 0,
                loss_count: 0,
                taken_at: now(),
            },
            BankrollSnapshot {
                snapshot_id: "2".into(),
                total_capital: Usd::new(dec!(150)),
                allocated_usd: Usd::ZERO,
                available_usd: Usd::new(dec!(150)),
                realized_pnl: Usd::ZERO,
                unrealized_pnl: Usd::ZERO,
                daily_pnl: Usd::ZERO,
                daily_drawdown: Usd::ZERO,
                total_trades: 0,
                win_count: 0,
                loss_count: 0,
                taken_at: now(),
            },
            BankrollSnapshot {
                snapshot_id: "3".into(),
                total_capital: Usd::new(dec!(120)),
                allocated_usd: Usd::ZERO,
                available_usd: Usd::new(dec!(120)),
                realized_pnl: Usd::ZERO,
                unrealized_pnl: Usd::ZERO,
                daily_pnl: Usd::ZERO,
                daily_drawdown: Usd::ZERO,
                total_trades: 0,
                win_count: 0,
                loss_count: 0,
                taken_at: now(),
            },
        ];
        let dd = max_drawdown(&series, Usd::new(dec!(100)));
        assert_eq!(dd, dec!(20));
    }
}
