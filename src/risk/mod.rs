//! Pre-trade risk gate and kill switch.
//!
//! Tracks drawdown (throttle/release bands), consecutive losses, failed
//! executions and exposure caps against `Usd`/`Decimal` money types, and
//! exposes a boolean pre-trade decision plus a latched kill switch.

use crate::config::RiskConfig;
use crate::error::CoreError;
use crate::money::Usd;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Why a kill switch tripped, kept distinct from `models::RiskEventKind` so
/// callers can match on the trigger without depending on the persistence enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillSwitchTrigger {
    SingleTradeDrawdown,
    DailyLoss,
    ConsecutiveLosses,
    FailedExecutions,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Win,
    Loss,
}

struct FailedExecutionWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl FailedExecutionWindow {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    fn record(&mut self, at: DateTime<Utc>, window: chrono::Duration) -> usize {
        self.timestamps.retain(|t| at - *t < window);
        self.timestamps.push(at);
        self.timestamps.len()
    }
}

/// Pre-trade gate and kill switch, single-owner over its own mutex in the
/// composition root.
pub struct RiskManager {
    config: RiskConfig,
    kill_switch: Option<KillSwitchTrigger>,
    daily_pnl: Usd,
    daily_reset_day: u32,
    peak_capital: Usd,
    consecutive_losses: u32,
    failed_executions: FailedExecutionWindow,
    per_market_exposure: HashMap<String, Usd>,
    total_exposure: Usd,
}

impl RiskManager {
    pub fn new(config: RiskConfig, initial_bankroll: Usd) -> Self {
        Self {
            config,
            kill_switch: None,
            daily_pnl: Usd::ZERO,
            daily_reset_day: Utc::now().ordinal(),
            peak_capital: initial_bankroll,
            consecutive_losses: 0,
            failed_executions: FailedExecutionWindow::new(),
            per_market_exposure: HashMap::new(),
            total_exposure: Usd::ZERO,
        }
    }

    /// Pre-trade gate. `bankroll` is the current `total_capital`, used as the
    /// exposure-percent denominator.
    pub fn can_trade(
        &mut self,
        market_id: &str,
        size_usd: Usd,
        bankroll: Usd,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.maybe_reset_daily(now);

        if let Some(trigger) = &self.kill_switch {
            return Err(CoreError::KillSwitchTripped(format!("{trigger:?}")));
        }

        let max_daily_loss = bankroll.pct(self.config.max_daily_loss_pct);
        if self.daily_pnl.inner() < -max_daily_loss.inner() {
            return Err(CoreError::RiskBlock(format!(
                "daily pnl {} below -{}",
                self.daily_pnl, max_daily_loss
            )));
        }

        let max_exposure = bankroll.pct(self.config.max_total_exposure_pct);
        if (self.total_exposure + size_usd).inner() > max_exposure.inner() {
            return Err(CoreError::RiskBlock(format!(
                "total exposure {} + {} exceeds cap {}",
                self.total_exposure, size_usd, max_exposure
            )));
        }

        let max_market_exposure = bankroll.pct(self.config.max_per_market_exposure_pct);
        let current_market_exposure = self
            .per_market_exposure
            .get(market_id)
            .copied()
            .unwrap_or(Usd::ZERO);
        if (current_market_exposure + size_usd).inner() > max_market_exposure.inner() {
            return Err(CoreError::RiskBlock(format!(
                "market {market_id} exposure {current_market_exposure} + {size_usd} exceeds cap {max_market_exposure}"
            )));
        }

        Ok(())
    }

    /// Live-mode-only gas ceiling check, separate from `can_trade` since
    /// paper mode has no gas price to evaluate.
    pub fn check_gas_price(&self, gas_price_gwei: Decimal) -> Result<(), CoreError> {
        if gas_price_gwei > self.config.max_gas_gwei {
            return Err(CoreError::RiskBlock(format!(
                "gas price {gas_price_gwei} gwei exceeds ceiling {}",
                self.config.max_gas_gwei
            )));
        }
        Ok(())
    }

    pub fn reserve_exposure(&mut self, market_id: &str, size_usd: Usd) {
        self.total_exposure += size_usd;
        *self
            .per_market_exposure
            .entry(market_id.to_string())
            .or_insert(Usd::ZERO) += size_usd;
    }

    pub fn release_exposure(&mut self, market_id: &str, size_usd: Usd) {
        self.total_exposure = (self.total_exposure - size_usd).max(Usd::ZERO);
        if let Some(existing) = self.per_market_exposure.get_mut(market_id) {
            *existing = (*existing - size_usd).max(Usd::ZERO);
        }
    }

    /// Post-trade bookkeeping. Evaluates the single-trade-drawdown,
    /// daily-loss, and consecutive-loss kill-switch triggers against the
    /// outcome just recorded.
    pub fn record_outcome(
        &mut self,
        pnl: Usd,
        bankroll_after: Usd,
        now: DateTime<Utc>,
    ) -> Option<KillSwitchTrigger> {
        self.maybe_reset_daily(now);
        self.daily_pnl += pnl;

        if bankroll_after > self.peak_capital {
            self.peak_capital = bankroll_after;
        }

        let outcome = if pnl.is_negative() {
            TradeOutcome::Loss
        } else {
            TradeOutcome::Win
        };
        match outcome {
            TradeOutcome::Loss => self.consecutive_losses += 1,
            TradeOutcome::Win => self.consecutive_losses = 0,
        }

        if !self.peak_capital.is_zero() {
            let single_trade_drawdown_pct =
                (-pnl.inner() / self.peak_capital.inner()) * Decimal::from(100);
            if pnl.is_negative() && single_trade_drawdown_pct > self.config.max_single_trade_drawdown_pct
            {
                return self.trip(KillSwitchTrigger::SingleTradeDrawdown);
            }
        }

        let max_daily_loss = bankroll_after.pct(self.config.max_daily_loss_pct);
        if self.daily_pnl.inner() < -max_daily_loss.inner() {
            return self.trip(KillSwitchTrigger::DailyLoss);
        }

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            return self.trip(KillSwitchTrigger::ConsecutiveLosses);
        }

        None
    }

    pub fn record_failed_execution(&mut self, now: DateTime<Utc>) -> Option<KillSwitchTrigger> {
        let window = chrono::Duration::seconds(self.config.failed_execution_window_secs as i64);
        let count = self.failed_executions.record(now, window);
        if count as u32 >= self.config.max_failed_executions_per_window {
            return self.trip(KillSwitchTrigger::FailedExecutions);
        }
        None
    }

    pub fn trip_manual(&mut self) -> Option<KillSwitchTrigger> {
        self.trip(KillSwitchTrigger::Manual)
    }

    fn trip(&mut self, trigger: KillSwitchTrigger) -> Option<KillSwitchTrigger> {
        if self.kill_switch.is_none() {
            self.kill_switch = Some(trigger.clone());
            Some(trigger)
        } else {
            None
        }
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.is_some()
    }

    pub fn kill_switch_trigger(&self) -> Option<&KillSwitchTrigger> {
        self.kill_switch.as_ref()
    }

    /// Releases the kill switch. Used only after an operator-reviewed reset;
    /// there is no automatic release.
    pub fn reset_kill_switch(&mut self) {
        self.kill_switch = None;
    }

    fn maybe_reset_daily(&mut self, now: DateTime<Utc>) {
        let today = now.ordinal();
        if today != self.daily_reset_day {
            self.daily_reset_day = today;
            self.daily_pnl = Usd::ZERO;
            self.consecutive_losses = 0;
        }
    }

    pub fn daily_pnl(&self) -> Usd {
        self.daily_pnl
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
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

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default(), Usd::new(dec!(100)))
    }

    #[test]
    fn exposure_within_caps_is_allowed() {
        let mut rm = manager();
        assert!(rm
            .can_trade("m1", Usd::new(dec!(5)), Usd::new(dec!(100)), now())
            .is_ok());
    }

    #[test]
    fn total_exposure_cap_blocks_oversize_trade() {
        let mut rm = manager();
        rm.reserve_exposure("m1", Usd::new(dec!(75)));
        let result = rm.can_trade("m2", Usd::new(dec!(10)), Usd::new(dec!(100)), now());
        assert!(result.is_err());
    }

    #[test]
    fn three_consecutive_losses_trip_kill_switch() {
        let mut rm = manager();
        assert!(rm.record_outcome(Usd::new(dec!(-1)), Usd::new(dec!(99)), now()).is_none());
        assert!(rm.record_outcome(Usd::new(dec!(-1)), Usd::new(dec!(98)), now()).is_none());
        let tripped = rm.record_outcome(Usd::new(dec!(-1)), Usd::new(dec!(97)), now());
        assert_eq!(tripped, Some(KillSwitchTrigger::ConsecutiveLosses));
        assert!(rm.is_kill_switch_active());
        assert!(rm
            .can_trade("m1", Usd::new(dec!(1)), Usd::new(dec!(97)), now())
            .is_err());
    }

    #[test]
    fn kill_switch_blocks_all_strategies_until_daily_reset() {
        let mut rm = manager();
        rm.trip_manual();
        assert!(rm
            .can_trade("m1", Usd::new(dec!(1)), Usd::new(dec!(100)), now())
            .is_err());
        rm.maybe_reset_daily(now() + chrono::Duration::days(1));
        // Daily reset clears loss counters but the kill switch itself is a
        // separate latch and must be released explicitly.
        assert!(rm.is_kill_switch_active());
        rm.reset_kill_switch();
        assert!(rm
            .can_trade("m1", Usd::new(dec!(1)), Usd::new(dec!(100)), now())
            .is_ok());
    }

    #[test]
    fn single_trade_drawdown_over_five_percent_trips() {
        let mut rm = manager();
        let tripped = rm.record_outcome(Usd::new(dec!(-10)), Usd::new(dec!(90)), now());
        assert_eq!(tripped, Some(KillSwitchTrigger::SingleTradeDrawdown));
    }

    #[test]
    fn daily_loss_limit_trips_kill_switch() {
        let mut rm = manager();
        let tripped = rm.record_outcome(Usd::new(dec!(-11)), Usd::new(dec!(89)), now());
        assert!(matches!(
            tripped,
            Some(KillSwitchTrigger::SingleTradeDrawdown) | Some(KillSwitchTrigger::DailyLoss)
        ));
    }

    #[test]
    fn failed_executions_within_window_trip_kill_switch() {
        let mut rm = manager();
        assert!(rm.record_failed_execution(now()).is_none());
        assert!(rm.record_failed_execution(now()).is_none());
        let tripped = rm.record_failed_execution(now());
        assert_eq!(tripped, Some(KillSwitchTrigger::FailedExecutions));
    }
}
