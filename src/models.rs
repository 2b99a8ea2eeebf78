//! Core domain types shared by every component: whales, trades, positions,
//! bankroll snapshots, risk events and detected opportunities.

use crate::config::RunMode;
use crate::money::{Probability, Usd};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhaleStatus {
    Discovered,
    Qualified,
    Ranked,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Whale {
    pub wallet_address: String,
    pub status: WhaleStatus,
    pub total_volume_usd: Usd,
    pub avg_trade_size_usd: Usd,
    pub total_trades: u64,
    pub trades_last_72h: u32,
    pub days_active: u32,
    pub rank_score: Option<Decimal>,
    pub risk_score: Decimal,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_qualified_at: Option<DateTime<Utc>>,
    /// Cleared to `false` once the whale has gone `max_inactive_days`
    /// without a new trade; independent of `status` so a ranked whale that
    /// goes quiet is flagged before the next demotion is even evaluated.
    pub is_active: bool,
    /// Sum of `net_pnl` over our own closed copied trades attributed to this
    /// whale, not a broker-reported figure. Zero until we've copied one.
    pub realized_pnl_usd: Usd,
    pub copied_trade_count: u64,
}

impl Whale {
    pub fn new(wallet_address: String, now: DateTime<Utc>) -> Self {
        Self {
            wallet_address,
            status: WhaleStatus::Discovered,
            total_volume_usd: Usd::ZERO,
            avg_trade_size_usd: Usd::ZERO,
            total_trades: 0,
            trades_last_72h: 0,
            days_active: 0,
            rank_score: None,
            risk_score: Decimal::ZERO,
            first_seen_at: now,
            last_seen_at: now,
            last_qualified_at: None,
            is_active: true,
            realized_pnl_usd: Usd::ZERO,
            copied_trade_count: 0,
        }
    }

    /// average trade size times trade count must reconcile with volume.
    pub fn avg_trade_size_consistent(&self) -> bool {
        if self.total_trades == 0 {
            return self.avg_trade_size_usd.is_zero();
        }
        let expected = self.avg_trade_size_usd.inner() * Decimal::from(self.total_trades);
        (expected - self.total_volume_usd.inner()).abs() <= Decimal::new(1, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleTrade {
    pub external_id: String,
    pub wallet_address: String,
    pub market_id: String,
    pub token_id: String,
    pub side: TradeSide,
    pub price: Probability,
    pub size_usd: Usd,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalClassification {
    Open,
    Close,
    ScaleIn,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleSignal {
    pub signal_id: String,
    pub wallet_address: String,
    pub market_id: String,
    pub token_id: String,
    pub side: TradeSide,
    pub price: Probability,
    pub size_usd: Usd,
    pub classification: SignalClassification,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPosition {
    pub position_id: String,
    pub wallet_address: String,
    pub market_id: String,
    pub token_id: String,
    pub side: TradeSide,
    pub status: PositionStatus,
    pub entry_price: Probability,
    pub size_usd: Usd,
    pub exit_price: Option<Probability>,
    pub realized_pnl: Option<Usd>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// The whale's `risk_score` at the moment this position was opened,
    /// frozen for audit even if the whale's live score later drifts.
    pub whale_risk_score_at_open: Decimal,
    pub mode: RunMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualTradeRecord {
    pub trade_id: String,
    pub position_id: String,
    pub market_id: String,
    pub side: TradeSide,
    pub status: PositionStatus,
    /// Entry price.
    pub price: Probability,
    pub exit_price: Option<Probability>,
    pub size_usd: Usd,
    pub commission: Usd,
    pub gas_cost_usd: Usd,
    pub gross_pnl: Option<Usd>,
    pub whale_source: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl VirtualTradeRecord {
    /// `net_pnl = gross_pnl - commission - gas_cost_usd`.
    pub fn net_pnl(&self) -> Option<Usd> {
        self.gross_pnl
            .map(|gross| gross - self.commission - self.gas_cost_usd)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankrollSnapshot {
    pub snapshot_id: String,
    pub total_capital: Usd,
    pub allocated_usd: Usd,
    pub available_usd: Usd,
    pub realized_pnl: Usd,
    pub unrealized_pnl: Usd,
    pub daily_pnl: Usd,
    pub daily_drawdown: Usd,
    pub total_trades: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub taken_at: DateTime<Utc>,
}

impl BankrollSnapshot {
    /// `total_capital = allocated + available`.
    pub fn is_consistent(&self) -> bool {
        self.total_capital.inner() == (self.allocated_usd + self.available_usd).inner()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    DrawdownThrottle,
    DrawdownRelease,
    DailyLossLimit,
    ConsecutiveLosses,
    FailedExecutions,
    ManualKillSwitch,
    ExposureLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub event_id: String,
    pub kind: RiskEventKind,
    pub severity: RiskEventSeverity,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub opportunity_id: String,
    pub signal_id: String,
    pub wallet_address: String,
    pub market_id: String,
    pub recommended_size_usd: Usd,
    pub status: OpportunityStatus,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Market-data events emitted by the stream client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade {
        market_id: String,
        token_id: String,
        price: Probability,
        size_usd: Usd,
        taker_address: Option<String>,
        taker_side: Option<TradeSide>,
        at: DateTime<Utc>,
    },
    PriceChange {
        token_id: String,
        price: Probability,
        at: DateTime<Utc>,
    },
    OrderbookDelta {
        token_id: String,
        at: DateTime<Utc>,
    },
    Heartbeat {
        at: DateTime<Utc>,
    },
    ConnectionStateChange {
        connected: bool,
        degraded: bool,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
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

    #[test]
    fn whale_avg_trade_size_consistency_holds_when_reconstructed() {
        let mut whale = Whale::new("0xabc".into(), now());
        whale.total_trades = 4;
        whale.total_volume_usd = Usd::new(dec!(400));
        whale.avg_trade_size_usd = Usd::new(dec!(100));
        assert!(whale.avg_trade_size_consistent());
    }

    #[test]
    fn whale_avg_trade_size_consistency_fails_on_mismatch() {
        let mut whale = Whale::new("0xabc".into(), now());
        whale.total_trades = 4;
        whale.total_volume_usd = Usd::new(dec!(400));
        whale.avg_trade_size_usd = Usd::new(dec!(50));
        assert!(!whale.avg_trade_size_consistent());
    }

    #[test]
    fn bankroll_snapshot_consistency() {
        let snap = BankrollSnapshot {
            snapshot_id: "s1".into(),
            total_capital: Usd::new(dec!(1000)),
            allocated_usd: Usd::new(dec!(300)),
            available_usd: Usd::new(dec!(700)),
            realized_pnl: Usd::ZERO,
            unrealized_pnl: Usd::ZERO,
            daily_pnl: Usd::ZERO,
            daily_drawdown: Usd::ZERO,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
            taken_at: now(),
        };
        assert!(snap.is_consistent());
    }

    #[test]
    fn virtual_trade_net_pnl_subtracts_costs() {
        let record = VirtualTradeRecord {
            trade_id: "t1".into(),
            position_id: "p1".into(),
            market_id: "m1".into(),
            side: TradeSide::Buy,
            status: PositionStatus::Closed,
            price: Probability::new(dec!(0.5)),
            exit_price: Some(Probability::new(dec!(0.6))),
            size_usd: Usd::new(dec!(100)),
            commission: Usd::new(dec!(1)),
            gas_cost_usd: Usd::new(dec!(0.5)),
            gross_pnl: Some(Usd::new(dec!(10))),
            whale_source: None,
            executed_at: now(),
            settled_at: Some(now()),
        };
        assert_eq!(record.net_pnl().unwrap(), Usd::new(dec!(8.5)));
    }
}
