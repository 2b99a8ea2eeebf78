//! Converts qualified-whale trade signals into sized, risk-gated orders.
//!
//! Pipeline: compute an activity-based Kelly size, classify the signal as
//! open/close/scale-in/ignore, check the pre-trade risk gate, record
//! intent, then dispatch to the configured `Executor` — all against a
//! single shared bankroll with decimal-exact money types throughout.

pub mod sizing;

use crate::bankroll::VirtualBankroll;
use crate::config::{RiskConfig, RunMode, SizingConfig};
use crate::error::CoreError;
use crate::executor::Executor;
use crate::models::{
    CopyPosition, Opportunity, OpportunityStatus, PositionStatus, RiskEvent, RiskEventKind, RiskEventSeverity,
    TradeSide, WhaleSignal,
};
use crate::money::Usd;
use crate::risk::{KillSwitchTrigger, RiskManager};
use crate::store::Store;
use crate::whale::WhaleDetector;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Maps a latched kill-switch cause to the `RiskEvent` kind it is persisted
/// under, so a persisted event is queryable by real cause instead of a
/// single catch-all label.
fn risk_event_kind_for_trigger(trigger: &KillSwitchTrigger) -> RiskEventKind {
    match trigger {
        KillSwitchTrigger::SingleTradeDrawdown => RiskEventKind::DrawdownThrottle,
        KillSwitchTrigger::DailyLoss => RiskEventKind::DailyLossLimit,
        KillSwitchTrigger::ConsecutiveLosses => RiskEventKind::ConsecutiveLosses,
        KillSwitchTrigger::FailedExecutions => RiskEventKind::FailedExecutions,
        KillSwitchTrigger::Manual => RiskEventKind::ManualKillSwitch,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Open,
    Close,
    ScaleIn,
    Ignore,
}

struct DedupEntry {
    wallet_address: String,
    market_id: String,
    side: TradeSide,
    price: rust_decimal::Decimal,
    traded_at: DateTime<Utc>,
    seen_at: DateTime<Utc>,
}

pub struct CopyEngine {
    detector: Arc<WhaleDetector>,
    risk: Mutex<RiskManager>,
    executor: Arc<dyn Executor>,
    store: Arc<Store>,
    sizing: SizingConfig,
    risk_score_max: rust_decimal::Decimal,
    bankroll: Arc<VirtualBankroll>,
    mode: RunMode,
    open_positions: Mutex<HashMap<(String, String), CopyPosition>>,
    dedup: Mutex<VecDeque<DedupEntry>>,
}

impl CopyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: Arc<WhaleDetector>,
        risk_config: RiskConfig,
        sizing: SizingConfig,
        executor: Arc<dyn Executor>,
        store: Arc<Store>,
        initial_bankroll: Usd,
        bankroll: Arc<VirtualBankroll>,
        mode: RunMode,
    ) -> Self {
        let risk_score_max = risk_config.risk_score_max;
        Self {
            detector,
            risk: Mutex::new(RiskManager::new(risk_config, initial_bankroll)),
            executor,
            store,
            sizing,
            risk_score_max,
            bankroll,
            mode,
            open_positions: Mutex::new(HashMap::new()),
            dedup: Mutex::new(VecDeque::new()),
        }
    }

    /// Entry point for a newly observed whale trade signal.
    pub async fn on_whale_trade(&self, signal: WhaleSignal, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.is_duplicate(&signal, now).await {
            return Ok(());
        }

        let whale = match self.detector.get(&signal.wallet_address).await {
            Some(w) => w,
            None => return Ok(()),
        };
        if !matches!(
            whale.status,
            crate::models::WhaleStatus::Qualified | crate::models::WhaleStatus::Ranked
        ) {
            return Ok(());
        }
        if whale.risk_score > self.risk_score_max {
            return Ok(());
        }

        let key = (signal.wallet_address.clone(), signal.market_id.clone());
        let classification = {
            let positions = self.open_positions.lock().await;
            match positions.get(&key) {
                None => Classification::Open,
                Some(pos) if pos.side == signal.side => {
                    if self.sizing.scale_in_enabled {
                        Classification::ScaleIn
                    } else {
                        Classification::Ignore
                    }
                }
                Some(_) => Classification::Close,
            }
        };

        match classification {
            Classification::Ignore => Ok(()),
            Classification::Open | Classification::ScaleIn => self.open(whale, signal, now).await,
            Classification::Close => self.close(signal, now).await,
        }
    }

    async fn open(
        &self,
        whale: crate::models::Whale,
        signal: WhaleSignal,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if !signal.price.is_valid() {
            return Ok(());
        }

        let bankroll = self.bankroll.total_capital().await;
        let rank_normalized = whale
            .rank_score
            .map(|s| s.clamp(rust_decimal::Decimal::ZERO, rust_decimal::Decimal::ONE))
            .unwrap_or(rust_decimal::Decimal::ZERO);
        let size_usd = sizing::kelly_size(signal.price, rank_normalized, bankroll, &self.sizing);

        if size_usd.is_zero() {
            return Ok(());
        }

        {
            let mut risk = self.risk.lock().await;
            if let Err(e) = risk.can_trade(&signal.market_id, size_usd, bankroll, now) {
                self.record_risk_rejection(&signal, &e, now).await;
                return Ok(());
            }
        }

        let fill = match self
            .executor
            .open(
                &signal.market_id,
                signal.side,
                size_usd,
                signal.price,
                Some(signal.wallet_address.as_str()),
            )
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                let trigger = {
                    let mut risk = self.risk.lock().await;
                    risk.record_failed_execution(now)
                };
                self.persist_kill_switch_event(trigger, now).await;
                warn!("executor open failed for {}: {e}", signal.wallet_address);
                return Ok(());
            }
        };

        {
            let mut risk = self.risk.lock().await;
            risk.reserve_exposure(&signal.market_id, size_usd);
        }

        let position = CopyPosition {
            position_id: fill.external_id.clone(),
            wallet_address: signal.wallet_address.clone(),
            market_id: signal.market_id.clone(),
            token_id: signal.token_id.clone(),
            side: signal.side,
            status: PositionStatus::Open,
            entry_price: fill.price,
            size_usd,
            exit_price: None,
            realized_pnl: None,
            opened_at: now,
            closed_at: None,
            whale_risk_score_at_open: whale.risk_score,
            mode: self.mode,
        };
        self.store.upsert_position(&position).await?;
        let key = (signal.wallet_address.clone(), signal.market_id.clone());
        self.open_positions.lock().await.insert(key, position);

        info!(
            wallet = %signal.wallet_address,
            market = %signal.market_id,
            size_usd = %size_usd,
            "opened copy position"
        );
        Ok(())
    }

    async fn close(&self, signal: WhaleSignal, now: DateTime<Utc>) -> Result<(), CoreError> {
        let key = (signal.wallet_address.clone(), signal.market_id.clone());
        let position = {
            let mut positions = self.open_positions.lock().await;
            match positions.remove(&key) {
                Some(p) => p,
                None => return Ok(()),
            }
        };

        let fill = match self.executor.close(&position.position_id, signal.price).await {
            Ok(fill) => fill,
            Err(e) => {
                {
                    let mut positions = self.open_positions.lock().await;
                    positions.insert(key, position);
                }
                let trigger = {
                    let mut risk = self.risk.lock().await;
                    risk.record_failed_execution(now)
                };
                self.persist_kill_switch_event(trigger, now).await;
                warn!("executor close failed: {e}");
                return Ok(());
            }
        };

        let raw = position.size_usd.inner() * (fill.price.inner() - position.entry_price.inner())
            / position.entry_price.inner();
        let gross_pnl = match position.side {
            TradeSide::Buy => Usd::new(raw),
            TradeSide::Sell => Usd::new(-raw),
        };
        let net_pnl = gross_pnl - fill.commission - fill.gas_cost;

        let mut closed = position;
        closed.status = PositionStatus::Closed;
        closed.exit_price = Some(fill.price);
        closed.realized_pnl = Some(net_pnl);
        closed.closed_at = Some(now);
        self.store.upsert_position(&closed).await?;

        let trigger = {
            let mut risk = self.risk.lock().await;
            risk.release_exposure(&signal.market_id, closed.size_usd);
            let bankroll_after = self.bankroll.total_capital().await;
            risk.record_outcome(net_pnl, bankroll_after, now)
        };
        self.persist_kill_switch_event(trigger, now).await;

        info!(
            wallet = %signal.wallet_address,
            market = %signal.market_id,
            net_pnl = %net_pnl,
            "closed copy position"
        );
        Ok(())
    }

    /// Persists a `RiskEvent` whenever a kill-switch trigger fired, labeled
    /// with its real cause so it can be filtered by `kind` or `severity`
    /// downstream instead of collapsing to one generic entry.
    async fn persist_kill_switch_event(&self, trigger: Option<KillSwitchTrigger>, now: DateTime<Utc>) {
        let Some(trigger) = trigger else {
            return;
        };
        let event = RiskEvent {
            event_id: Uuid::new_v4().to_string(),
            kind: risk_event_kind_for_trigger(&trigger),
            severity: RiskEventSeverity::Critical,
            detail: format!("kill switch tripped: {trigger:?}"),
            occurred_at: now,
        };
        let _ = self.store.insert_risk_event(&event).await;
    }

    async fn record_risk_rejection(&self, signal: &WhaleSignal, err: &CoreError, now: DateTime<Utc>) {
        let opportunity = Opportunity {
            opportunity_id: Uuid::new_v4().to_string(),
            signal_id: signal.signal_id.clone(),
            wallet_address: signal.wallet_address.clone(),
            market_id: signal.market_id.clone(),
            recommended_size_usd: signal.size_usd,
            status: OpportunityStatus::Rejected,
            reject_reason: Some(err.to_string()),
            created_at: now,
        };
        let _ = self.store.insert_opportunity(&opportunity).await;
    }

    /// Exposes the risk gate's latched kill-switch state for the
    /// live-promotion gate without leaking the `RiskManager` itself.
    pub async fn kill_switch_active(&self) -> bool {
        self.risk.lock().await.is_kill_switch_active()
    }

    async fn is_duplicate(&self, signal: &WhaleSignal, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::seconds(self.sizing.signal_dedup_window_secs as i64);
        let mut dedup = self.dedup.lock().await;
        dedup.retain(|e| now - e.seen_at < window);

        let is_dup = dedup.iter().any(|e| {
            e.wallet_address == signal.wallet_address
                && e.market_id == signal.market_id
                && e.side == signal.side
                && e.price == signal.price.inner()
                && e.traded_at == signal.detected_at
        });
        if !is_dup {
            dedup.push_back(DedupEntry {
                wallet_address: signal.wallet_address.clone(),
                market_id: signal.market_id.clone(),
                side: signal.side,
                price: signal.price.inner(),
                traded_at: signal.detected_at,
                seen_at: now,
            });
        }
        is_dup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataApiConfig, QualificationConfig, RankingConfig};
    use crate::data_client::DataClient;
    use crate::executor::PaperExecutor;
    use crate::money::Probability;
    use crate::whale::WhaleTracker;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn engine_with_ranked_whale() -> (CopyEngine, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let data_client = Arc::new(DataClient::new(DataApiConfig::default()).unwrap());
        let tracker = Arc::new(WhaleTracker::new(
            data_client,
            store.clone(),
            QualificationConfig::default(),
        ));
        let detector = Arc::new(
            WhaleDetector::new(
                tracker,
                store.clone(),
                QualificationConfig::default(),
                RankingConfig::default(),
            )
            .await
            .unwrap(),
        );

        let mut whale = crate::models::Whale::new("0xaaaa".into(), now());
        whale.status = crate::models::WhaleStatus::Ranked;
        whale.rank_score = Some(dec!(1.0));
        whale.risk_score = dec!(2);
        store.upsert_whale(&whale).await.unwrap();
        detector.observe_address("0xaaaa", now()).await.unwrap();
        detector.rerank(&[whale], now()).await.unwrap();

        let mut sup_config = crate::config::SupervisorConfig::default();
        sup_config.initial_bankroll_usd = dec!(100);
        let bankroll = Arc::new(crate::bankroll::VirtualBankroll::new(&sup_config, store.clone()));
        let executor = Arc::new(PaperExecutor::new(bankroll.clone(), dec!(0)));

        let engine = CopyEngine::new(
            detector,
            RiskConfig::default(),
            SizingConfig::default(),
            executor,
            store.clone(),
            Usd::new(dec!(100)),
            bankroll,
            RunMode::Paper,
        );
        (engine, store)
    }

    fn signal(price: rust_decimal::Decimal, side: TradeSide, detected_at: DateTime<Utc>) -> WhaleSignal {
        WhaleSignal {
            signal_id: Uuid::new_v4().to_string(),
            wallet_address: "0xaaaa".into(),
            market_id: "m1".into(),
            token_id: "t1".into(),
            side,
            price: Probability::new(price),
            size_usd: Usd::new(dec!(500)),
            classification: crate::models::SignalClassification::Open,
            detected_at,
        }
    }

    #[tokio::test]
    async fn opens_a_position_for_a_ranked_whale_trade() {
        let (engine, _store) = engine_with_ranked_whale().await;
        engine
            .on_whale_trade(signal(dec!(0.40), TradeSide::Buy, now()), now())
            .await
            .unwrap();
        assert_eq!(engine.open_positions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_signal_within_window_opens_at_most_one_position() {
        let (engine, _store) = engine_with_ranked_whale().await;
        let t0 = now();
        engine
            .on_whale_trade(signal(dec!(0.40), TradeSide::Buy, t0), t0)
            .await
            .unwrap();
        engine
            .on_whale_trade(signal(dec!(0.40), TradeSide::Buy, t0), t0 + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(engine.open_positions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn opposite_side_signal_closes_the_open_position() {
        let (engine, _store) = engine_with_ranked_whale().await;
        let t0 = now();
        engine
            .on_whale_trade(signal(dec!(0.40), TradeSide::Buy, t0), t0)
            .await
            .unwrap();
        engine
            .on_whale_trade(
                signal(dec!(0.40), TradeSide::Sell, t0 + chrono::Duration::seconds(10)),
                t0 + chrono::Duration::seconds(10),
            )
            .await
            .unwrap();
        assert!(engine.open_positions.lock().await.is_empty());
    }
}
