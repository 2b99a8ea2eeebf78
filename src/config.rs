//! Explicit configuration tree.
//!
//! Loaded once at startup and passed by reference into every component
//! constructor. No component reads an environment variable itself; `Config`
//! resolves all overrides up front so construction is deterministic and
//! testable without touching the process environment from deep call sites.

use crate::error::CoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Paper,
    Live,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Paper
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub data_api: DataApiConfig,
    #[serde(default)]
    pub qualification: QualificationConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default = "default_db_path")]
    pub database_path: String,
}

fn default_db_path() -> String {
    "whalecopy.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            stream: StreamConfig::default(),
            data_api: DataApiConfig::default(),
            qualification: QualificationConfig::default(),
            ranking: RankingConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            executor: ExecutorConfig::default(),
            database_path: default_db_path(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment-variable overrides for
    /// the handful of operational knobs that are commonly set per-deploy.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Config(format!("reading {:?}: {e}", path.as_ref())))?;
        let mut config: Self =
            toml::from_str(&contents).map_err(|e| CoreError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `WHALECOPY_CONFIG_PATH`, falling back to defaults if unset
    /// or unreadable (mirroring the fallback behavior of the ambient
    /// performance-monitoring config in this codebase).
    pub fn from_env_or_default() -> Self {
        let path =
            std::env::var("WHALECOPY_CONFIG_PATH").unwrap_or_else(|_| "whalecopy.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("using default config ({}): {}", path, e);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WHALECOPY_MODE") {
            if v.eq_ignore_ascii_case("live") {
                self.supervisor.mode = RunMode::Live;
            } else if v.eq_ignore_ascii_case("paper") {
                self.supervisor.mode = RunMode::Paper;
            }
        }
        if let Ok(v) = std::env::var("WHALECOPY_DURATION_HOURS") {
            if let Ok(hours) = v.parse() {
                self.supervisor.duration_hours = Some(hours);
            }
        }
        if let Ok(v) = std::env::var("WHALECOPY_DB_PATH") {
            self.database_path = v;
        }
        if let Ok(v) = std::env::var("DOME_API_KEY") {
            self.data_api.dome_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("POLYMARKET_CLOB_API_KEY") {
            self.executor.clob_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("POLYMARKET_CLOB_SECRET") {
            self.executor.clob_secret = Some(v);
        }
        if let Ok(v) = std::env::var("POLYMARKET_CLOB_PASSPHRASE") {
            self.executor.clob_passphrase = Some(v);
        }
    }

    /// Re-validates after CLI/env overrides have been layered on top of a
    /// loaded config, using the same checks `load` applies to the file.
    pub fn validate_for_run(&self) -> Result<(), CoreError> {
        self.validate()
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.supervisor.initial_bankroll_usd <= Decimal::ZERO {
            return Err(CoreError::Config(
                "supervisor.initial_bankroll_usd must be positive".into(),
            ));
        }
        if self.sizing.quarter_kelly_multiplier <= Decimal::ZERO
            || self.sizing.quarter_kelly_multiplier > Decimal::ONE
        {
            return Err(CoreError::Config(
                "sizing.quarter_kelly_multiplier must be in (0, 1]".into(),
            ));
        }
        if let Some(hours) = self.supervisor.duration_hours {
            if hours == 0 {
                return Err(CoreError::Config(
                    "supervisor.duration_hours must be > 0 when set".into(),
                ));
            }
        }
        if matches!(self.supervisor.mode, RunMode::Live) && self.executor.clob_api_key.is_none() {
            return Err(CoreError::Config(
                "live mode requires POLYMARKET_CLOB_API_KEY / clob credentials".into(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let contents = toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default = "default_initial_bankroll")]
    pub initial_bankroll_usd: Decimal,
    /// None = run until manually stopped.
    #[serde(default)]
    pub duration_hours: Option<u64>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_promotion_min_trades")]
    pub promotion_min_trades: u32,
    /// Minimum ROI, as a percent of `initial_bankroll_usd`, required to pass
    /// the promotion gate (default 25, i.e. `total_capital >= bankroll * 1.25`).
    #[serde(default = "default_promotion_min_roi_pct")]
    pub promotion_min_roi_pct: Decimal,
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
    /// Rolling-hours window, not calendar-day counting.
    #[serde(default = "default_detection_window_hours")]
    pub detection_window_hours: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default = "default_top_k_markets")]
    pub top_k_markets: u32,
}

fn default_initial_bankroll() -> Decimal {
    Decimal::from(100)
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_promotion_min_trades() -> u32 {
    30
}
/// ROI gate: `total_capital >= initial_bankroll * 1.25`.
fn default_promotion_min_roi_pct() -> Decimal {
    Decimal::from(25)
}
fn default_polling_interval_secs() -> u64 {
    60
}
fn default_detection_window_hours() -> u64 {
    72
}
fn default_metrics_interval_secs() -> u64 {
    300
}
fn default_report_interval_secs() -> u64 {
    3_600
}
fn default_top_k_markets() -> u32 {
    50
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            initial_bankroll_usd: default_initial_bankroll(),
            duration_hours: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            promotion_min_trades: default_promotion_min_trades(),
            promotion_min_roi_pct: default_promotion_min_roi_pct(),
            polling_interval_secs: default_polling_interval_secs(),
            detection_window_hours: default_detection_window_hours(),
            metrics_interval_secs: default_metrics_interval_secs(),
            report_interval_secs: default_report_interval_secs(),
            top_k_markets: default_top_k_markets(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_read_idle_secs")]
    pub read_idle_timeout_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
    #[serde(default = "default_parse_failure_threshold")]
    pub parse_failure_threshold: u32,
    #[serde(default = "default_parse_failure_window_secs")]
    pub parse_failure_window_secs: u64,
}

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_read_idle_secs() -> u64 {
    30
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_max_buffered_events() -> usize {
    4_096
}
fn default_parse_failure_threshold() -> u32 {
    10
}
fn default_parse_failure_window_secs() -> u64 {
    30
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            read_idle_timeout_secs: default_read_idle_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_buffered_events: default_max_buffered_events(),
            parse_failure_threshold: default_parse_failure_threshold(),
            parse_failure_window_secs: default_parse_failure_window_secs(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataApiConfig {
    #[serde(default = "default_clob_base")]
    pub clob_base_url: String,
    #[serde(default = "default_gamma_base")]
    pub gamma_base_url: String,
    #[serde(default = "default_dome_base")]
    pub dome_base_url: String,
    #[serde(default)]
    pub dome_api_key: Option<String>,
    #[serde(default = "default_requests_per_10s")]
    pub requests_per_10s: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

fn default_clob_base() -> String {
    "https://clob.polymarket.com".to_string()
}
fn default_gamma_base() -> String {
    "https://gamma-api.polymarket.com".to_string()
}
fn default_dome_base() -> String {
    "https://api.domeapi.io/v1/polymarket".to_string()
}
fn default_requests_per_10s() -> u32 {
    100
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_page_limit() -> u32 {
    500
}

impl Default for DataApiConfig {
    fn default() -> Self {
        Self {
            clob_base_url: default_clob_base(),
            gamma_base_url: default_gamma_base(),
            dome_base_url: default_dome_base(),
            dome_api_key: None,
            requests_per_10s: default_requests_per_10s(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            page_limit: default_page_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualificationConfig {
    #[serde(default = "default_min_trades")]
    pub min_trades: u64,
    #[serde(default = "default_min_volume_usd")]
    pub min_volume_usd: Decimal,
    #[serde(default = "default_min_trades_72h")]
    pub min_trades_last_72h: u32,
    #[serde(default = "default_min_days_active")]
    pub min_days_active: u32,
    #[serde(default = "default_max_inactive_days")]
    pub max_inactive_days: u32,
    #[serde(default = "default_daily_trade_threshold")]
    pub daily_trade_threshold: u32,
    #[serde(default = "default_requalify_interval_secs")]
    pub requalify_interval_secs: u64,
}

fn default_min_trades() -> u64 {
    10
}
fn default_min_volume_usd() -> Decimal {
    Decimal::from(500)
}
fn default_min_trades_72h() -> u32 {
    3
}
fn default_min_days_active() -> u32 {
    1
}
fn default_max_inactive_days() -> u32 {
    30
}
fn default_daily_trade_threshold() -> u32 {
    5
}
fn default_requalify_interval_secs() -> u64 {
    3_600
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            min_trades: default_min_trades(),
            min_volume_usd: default_min_volume_usd(),
            min_trades_last_72h: default_min_trades_72h(),
            min_days_active: default_min_days_active(),
            max_inactive_days: default_max_inactive_days(),
            daily_trade_threshold: default_daily_trade_threshold(),
            requalify_interval_secs: default_requalify_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default = "default_weight_volume")]
    pub weight_volume: Decimal,
    #[serde(default = "default_weight_recency")]
    pub weight_recency: Decimal,
    #[serde(default = "default_weight_frequency")]
    pub weight_frequency: Decimal,
    #[serde(default = "default_weight_risk")]
    pub weight_risk: Decimal,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_weight_volume() -> Decimal {
    rust_decimal::Decimal::new(5, 1) // 0.5
}
fn default_weight_recency() -> Decimal {
    rust_decimal::Decimal::new(2, 1) // 0.2
}
fn default_weight_frequency() -> Decimal {
    rust_decimal::Decimal::new(2, 1) // 0.2
}
fn default_weight_risk() -> Decimal {
    rust_decimal::Decimal::new(1, 1) // 0.1
}
fn default_top_n() -> usize {
    10
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            weight_volume: default_weight_volume(),
            weight_recency: default_weight_recency(),
            weight_frequency: default_weight_frequency(),
            weight_risk: default_weight_risk(),
            top_n: default_top_n(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_single_trade_drawdown_pct")]
    pub max_single_trade_drawdown_pct: Decimal,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_failed_executions")]
    pub max_failed_executions_per_window: u32,
    #[serde(default = "default_failed_execution_window_secs")]
    pub failed_execution_window_secs: u64,
    #[serde(default = "default_max_exposure_pct")]
    pub max_total_exposure_pct: Decimal,
    #[serde(default = "default_max_market_exposure_pct")]
    pub max_per_market_exposure_pct: Decimal,
    #[serde(default = "default_drawdown_throttle_pct")]
    pub drawdown_throttle_pct: Decimal,
    #[serde(default = "default_drawdown_release_pct")]
    pub drawdown_release_pct: Decimal,
    #[serde(default = "default_max_gas_usd_per_trade")]
    pub max_gas_usd_per_trade: Decimal,
    #[serde(default = "default_max_gas_gwei")]
    pub max_gas_gwei: Decimal,
    /// A whale's `risk_score` above this (1..10, lower = better) is rejected
    /// by `CopyEngine::OnWhaleTrade` before sizing is attempted.
    #[serde(default = "default_risk_score_max")]
    pub risk_score_max: Decimal,
}

fn default_max_single_trade_drawdown_pct() -> Decimal {
    Decimal::from(5)
}
fn default_max_daily_loss_pct() -> Decimal {
    Decimal::from(10)
}
fn default_max_consecutive_losses() -> u32 {
    3
}
fn default_max_failed_executions() -> u32 {
    3
}
fn default_failed_execution_window_secs() -> u64 {
    600
}
fn default_max_exposure_pct() -> Decimal {
    Decimal::from(80)
}
fn default_max_market_exposure_pct() -> Decimal {
    Decimal::from(20)
}
fn default_drawdown_throttle_pct() -> Decimal {
    rust_decimal::Decimal::new(8, 0)
}
fn default_drawdown_release_pct() -> Decimal {
    rust_decimal::Decimal::new(4, 0)
}
fn default_max_gas_usd_per_trade() -> Decimal {
    rust_decimal::Decimal::new(5, 0)
}
fn default_max_gas_gwei() -> Decimal {
    Decimal::from(100)
}
fn default_risk_score_max() -> Decimal {
    Decimal::from(6)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_single_trade_drawdown_pct: default_max_single_trade_drawdown_pct(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_failed_executions_per_window: default_max_failed_executions(),
            failed_execution_window_secs: default_failed_execution_window_secs(),
            max_total_exposure_pct: default_max_exposure_pct(),
            max_per_market_exposure_pct: default_max_market_exposure_pct(),
            drawdown_throttle_pct: default_drawdown_throttle_pct(),
            drawdown_release_pct: default_drawdown_release_pct(),
            max_gas_usd_per_trade: default_max_gas_usd_per_trade(),
            max_gas_gwei: default_max_gas_gwei(),
            risk_score_max: default_risk_score_max(),
        }
    }
}

/// Parameters for the activity-based bounded-Kelly sizing formula:
/// `p = clamp(kelly_prior + alpha * rank_score_normalized,
/// confidence_floor, confidence_ceiling)`, `f_used = min(kelly_fraction_cap,
/// quarter_kelly_multiplier * f_star)`, `size_usd = clamp(bankroll * f_used,
/// min_position_usd, max_position_usd)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_kelly_prior")]
    pub kelly_prior: Decimal,
    #[serde(default = "default_alpha")]
    pub alpha: Decimal,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: Decimal,
    #[serde(default = "default_confidence_ceiling")]
    pub confidence_ceiling: Decimal,
    #[serde(default = "default_kelly_fraction_cap")]
    pub kelly_fraction_cap: Decimal,
    #[serde(default = "default_quarter_kelly_multiplier")]
    pub quarter_kelly_multiplier: Decimal,
    /// Fraction of bankroll, e.g. 0.01 for `bankroll * 1%`.
    #[serde(default = "default_min_position_pct")]
    pub min_position_pct: Decimal,
    /// Fraction of bankroll, e.g. 0.05 for `bankroll * 5%`.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default)]
    pub scale_in_enabled: bool,
    #[serde(default = "default_signal_dedup_window_secs")]
    pub signal_dedup_window_secs: u64,
    #[serde(default = "default_friction_mode")]
    pub friction_mode: FrictionMode,
}

fn default_kelly_prior() -> Decimal {
    rust_decimal::Decimal::new(52, 2) // 0.52
}
fn default_alpha() -> Decimal {
    rust_decimal::Decimal::new(8, 2) // 0.08
}
fn default_confidence_floor() -> Decimal {
    rust_decimal::Decimal::new(50, 2) // 0.50
}
fn default_confidence_ceiling() -> Decimal {
    rust_decimal::Decimal::new(70, 2) // 0.70
}
fn default_kelly_fraction_cap() -> Decimal {
    rust_decimal::Decimal::new(5, 2) // 0.05
}
fn default_quarter_kelly_multiplier() -> Decimal {
    rust_decimal::Decimal::new(25, 2) // 0.25
}
fn default_min_position_pct() -> Decimal {
    rust_decimal::Decimal::new(1, 2) // 0.01
}
fn default_max_position_pct() -> Decimal {
    rust_decimal::Decimal::new(5, 2) // 0.05
}
fn default_signal_dedup_window_secs() -> u64 {
    5
}
fn default_friction_mode() -> FrictionMode {
    FrictionMode::Base
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_prior: default_kelly_prior(),
            alpha: default_alpha(),
            confidence_floor: default_confidence_floor(),
            confidence_ceiling: default_confidence_ceiling(),
            kelly_fraction_cap: default_kelly_fraction_cap(),
            quarter_kelly_multiplier: default_quarter_kelly_multiplier(),
            min_position_pct: default_min_position_pct(),
            max_position_pct: default_max_position_pct(),
            scale_in_enabled: false,
            signal_dedup_window_secs: default_signal_dedup_window_secs(),
            friction_mode: default_friction_mode(),
        }
    }
}

/// Three-tier execution cost model, adapted from the wallet-analytics
/// friction bands, used as the paper ledger's commission schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrictionMode {
    Optimistic,
    Base,
    Pessimistic,
}

impl FrictionMode {
    /// Total round-trip friction, as a fraction of notional (spread +
    /// slippage + fee).
    pub fn total_friction_pct(&self) -> Decimal {
        match self {
            FrictionMode::Optimistic => rust_decimal::Decimal::new(5, 3), // 0.5%
            FrictionMode::Base => rust_decimal::Decimal::new(10, 3),      // 1.0%
            FrictionMode::Pessimistic => rust_decimal::Decimal::new(20, 3), // 2.0%
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub clob_api_key: Option<String>,
    #[serde(default)]
    pub clob_secret: Option<String>,
    #[serde(default)]
    pub clob_passphrase: Option<String>,
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
}

fn default_order_timeout_secs() -> u64 {
    15
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            clob_api_key: None,
            clob_secret: None,
            clob_passphrase: None,
            order_timeout_secs: default_order_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn live_mode_without_credentials_fails_validation() {
        let mut config = Config::default();
        config.supervisor.mode = RunMode::Live;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.supervisor.initial_bankroll_usd,
            config.supervisor.initial_bankroll_usd
        );
        assert_eq!(
            parsed.sizing.quarter_kelly_multiplier,
            config.sizing.quarter_kelly_multiplier
        );
    }

    #[test]
    fn zero_duration_hours_is_rejected() {
        let mut config = Config::default();
        config.supervisor.duration_hours = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn friction_mode_ordering() {
        assert!(FrictionMode::Optimistic.total_friction_pct() < FrictionMode::Base.total_friction_pct());
        assert!(FrictionMode::Base.total_friction_pct() < FrictionMode::Pessimistic.total_friction_pct());
    }
}
