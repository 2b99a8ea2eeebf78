//! Per-address whale statistics: fetch, recompute, persist, score.
//!
//! Fetches an address's recent orders and folds them into pure
//! activity-count statistics: no PnL curve, no floats, and a deterministic
//! risk-score table instead of Sharpe ratios.

use crate::config::QualificationConfig;
use crate::data_client::DataClient;
use crate::models::{PositionStatus, Whale, WhaleStatus, WhaleTrade};
use crate::money::Usd;
use crate::store::Store;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

/// Trade history lookback for stat recomputation. Wider than the 72h
/// qualification window so `total_volume_usd`/`total_trades` reflect the
/// whale's full observed history, not just the rolling window.
const STATS_LOOKBACK_DAYS: i64 = 90;
const MAX_PAGES: u32 = 20;

pub struct WhaleTracker {
    data_client: Arc<DataClient>,
    store: Arc<Store>,
    qualification: QualificationConfig,
}

impl WhaleTracker {
    pub fn new(
        data_client: Arc<DataClient>,
        store: Arc<Store>,
        qualification: QualificationConfig,
    ) -> Self {
        Self {
            data_client,
            store,
            qualification,
        }
    }

    /// Fetches recent trades via `DataClient` and recomputes the address's
    /// statistics window. Does not persist — call `persist` explicitly.
    pub async fn refresh(
        &self,
        address: &str,
        existing: Option<&Whale>,
        now: DateTime<Utc>,
    ) -> Result<Whale, crate::error::CoreError> {
        let since = now - chrono::Duration::days(STATS_LOOKBACK_DAYS);
        let trades = self
            .data_client
            .get_trades(address, Some(since), MAX_PAGES)
            .await?;

        let mut whale = existing.cloned().unwrap_or_else(|| Whale::new(address.to_string(), now));
        self.fold_trades(&mut whale, &trades, now);
        self.fold_realized_pnl(&mut whale).await?;
        Ok(whale)
    }

    /// `realized_pnl_usd`/`copied_trade_count`: computed from this crate's
    /// own closed `VirtualTradeRecord`s attributed to `whale.wallet_address`,
    /// not from the broker's API, which has no notion of our copy-trading.
    async fn fold_realized_pnl(&self, whale: &mut Whale) -> Result<(), crate::error::CoreError> {
        let trades = self.store.trades_by_whale(&whale.wallet_address).await?;
        let closed: Vec<_> = trades
            .iter()
            .filter(|t| t.status == PositionStatus::Closed)
            .collect();
        whale.copied_trade_count = closed.len() as u64;
        whale.realized_pnl_usd = closed
            .iter()
            .filter_map(|t| t.net_pnl())
            .fold(Usd::ZERO, |acc, pnl| acc + pnl);
        Ok(())
    }

    fn fold_trades(&self, whale: &mut Whale, trades: &[WhaleTrade], now: DateTime<Utc>) {
        if !trades.is_empty() {
            let cutoff_72h = now - chrono::Duration::hours(72);
            let mut total_volume = Decimal::ZERO;
            let mut trades_last_72h = 0u32;
            let mut distinct_days: HashSet<(i32, u32)> = HashSet::new();
            let mut latest_at = whale.last_seen_at;

            for trade in trades {
                total_volume += trade.size_usd.inner();
                if trade.occurred_at >= cutoff_72h {
                    trades_last_72h += 1;
                }
                distinct_days.insert((trade.occurred_at.year(), trade.occurred_at.ordinal()));
                if trade.occurred_at > latest_at {
                    latest_at = trade.occurred_at;
                }
            }

            whale.total_trades = trades.len() as u64;
            whale.total_volume_usd = Usd::new(total_volume);
            whale.avg_trade_size_usd = Usd::new(total_volume / Decimal::from(whale.total_trades.max(1)));
            whale.trades_last_72h = trades_last_72h;
            whale.days_active = distinct_days.len() as u32;
            whale.last_seen_at = latest_at;
            whale.risk_score = Self::risk_score(whale.total_volume_usd, whale.total_trades, now - latest_at);
        }

        // Recomputed unconditionally: a whale with no new trades this cycle
        // still needs its inactivity clock checked against the wall clock.
        let inactive_days = (now - whale.last_seen_at).num_days();
        whale.is_active = inactive_days <= self.qualification.max_inactive_days as i64;
    }

    pub async fn persist(&self, whale: &Whale) -> Result<(), crate::error::CoreError> {
        self.store.upsert_whale(whale).await
    }

    /// Qualification gate. Returns the pass/fail verdict plus the names of
    /// every gate that failed, for the detector's blocker report.
    pub fn is_qualifying_whale(&self, whale: &Whale, now: DateTime<Utc>) -> (bool, Vec<String>) {
        let mut blockers = Vec::new();
        let q = &self.qualification;

        if whale.total_trades < q.min_trades {
            blockers.push("min_trades".to_string());
        }
        if whale.total_volume_usd.inner() < q.min_volume_usd {
            blockers.push("min_volume_usd".to_string());
        }
        if whale.trades_last_72h < q.min_trades_last_72h {
            blockers.push("trades_last_3_days".to_string());
        }
        if whale.days_active < q.min_days_active {
            blockers.push("days_active".to_string());
        }
        let inactive_days = (now - whale.last_seen_at).num_days();
        if inactive_days > q.max_inactive_days as i64 {
            blockers.push("max_inactive_days".to_string());
        }

        (blockers.is_empty(), blockers)
    }

    /// Activity-based risk-score mapping, pure and deterministic: lower is
    /// better. Ties within a band favor recent activity via the
    /// caller-supplied `since_active` recency, which only matters in the
    /// `8..=10` inactivity band.
    pub fn risk_score(total_volume: Usd, total_trades: u64, since_active: chrono::Duration) -> Decimal {
        let v = total_volume.inner();
        if v >= Decimal::from(100_000) && total_trades >= 500 {
            Decimal::from(1)
        } else if v >= Decimal::from(50_000) && total_trades >= 200 {
            Decimal::from(2)
        } else if v >= Decimal::from(10_000) && total_trades >= 100 {
            Decimal::from(3)
        } else if v >= Decimal::from(5_000) && total_trades >= 50 {
            Decimal::from(4)
        } else if v >= Decimal::from(1_000) && total_trades >= 20 {
            Decimal::from(6)
        } else {
            let inactive_days = since_active.num_days().clamp(0, 2) as i64;
            Decimal::from(8 + inactive_days)
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

    fn tracker() -> WhaleTracker {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let data_client = Arc::new(DataClient::new(crate::config::DataApiConfig::default()).unwrap());
        WhaleTracker::new(data_client, store, QualificationConfig::default())
    }

    #[test]
    fn risk_score_top_band_is_one() {
        let score = WhaleTracker::risk_score(Usd::new(dec!(150_000)), 600, chrono::Duration::hours(1));
        assert_eq!(score, Decimal::from(1));
    }

    #[test]
    fn risk_score_inactive_whale_lands_in_bottom_band() {
        let score = WhaleTracker::risk_score(Usd::new(dec!(10)), 1, chrono::Duration::days(10));
        assert!(score >= Decimal::from(8));
    }

    #[test]
    fn whale_with_nine_trades_fails_qualification() {
        let tracker = tracker();
        let mut whale = Whale::new("0xabc".into(), now());
        whale.total_trades = 9;
        whale.total_volume_usd = Usd::new(dec!(2000));
        whale.trades_last_72h = 4;
        whale.days_active = 2;
        let (ok, blockers) = tracker.is_qualifying_whale(&whale, now());
        assert!(!ok);
        assert!(blockers.contains(&"min_trades".to_string()));
    }

    #[test]
    fn whale_meeting_all_thresholds_qualifies() {
        let tracker = tracker();
        let mut whale = Whale::new("0xaaaa".into(), now());
        whale.total_trades = 12;
        whale.total_volume_usd = Usd::new(dec!(2400));
        whale.trades_last_72h = 4;
        whale.days_active = 2;
        whale.last_seen_at = now();
        let (ok, blockers) = tracker.is_qualifying_whale(&whale, now());
        assert!(ok, "blockers: {blockers:?}");
    }

    #[test]
    fn inactive_whale_fails_on_max_inactive_days() {
        let tracker = tracker();
        let mut whale = Whale::new("0xaaaa".into(), now() - chrono::Duration::days(40));
        whale.total_trades = 50;
        whale.total_volume_usd = Usd::new(dec!(5000));
        whale.trades_last_72h = 0;
        whale.days_active = 5;
        whale.last_seen_at = now() - chrono::Duration::days(40);
        let (ok, blockers) = tracker.is_qualifying_whale(&whale, now());
        assert!(!ok);
        assert!(blockers.contains(&"max_inactive_days".to_string()));
    }

    #[test]
    fn fold_trades_computes_volume_and_averages() {
        let tracker = tracker();
        let mut whale = Whale::new("0xabc".into(), now());
        let trades = vec![
            WhaleTrade {
                external_id: "e1".into(),
                wallet_address: "0xabc".into(),
                market_id: "m1".into(),
                token_id: "t1".into(),
                side: crate::models::TradeSide::Buy,
                price: crate::money::Probability::new(dec!(0.5)),
                size_usd: Usd::new(dec!(100)),
                occurred_at: now(),
            },
            WhaleTrade {
                external_id: "e2".into(),
                wallet_address: "0xabc".into(),
                market_id: "m1".into(),
                token_id: "t1".into(),
                side: crate::models::TradeSide::Sell,
                price: crate::money::Probability::new(dec!(0.6)),
                size_usd: Usd::new(dec!(300)),
                occurred_at: now(),
            },
        ];
        tracker.fold_trades(&mut whale, &trades, now());
        assert_eq!(whale.total_trades, 2);
        assert_eq!(whale.total_volume_usd, Usd::new(dec!(400)));
        assert_eq!(whale.avg_trade_size_usd, Usd::new(dec!(200)));
        assert!(whale.avg_trade_size_consistent());
    }
}
