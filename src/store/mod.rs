//! SQLite persistence.
//!
//! One `Connection` behind a `tokio::sync::Mutex`, WAL mode, natural-key
//! upserts via `ON CONFLICT DO UPDATE` — the same shape as this codebase's
//! vault database, generalized from vault state/activity/NAV tables to the
//! whale/trade/bankroll/risk domain.

use crate::config::RunMode;
use crate::error::CoreError;
use crate::models::{
    BankrollSnapshot, CopyPosition, Opportunity, OpportunityStatus, PositionStatus, RiskEvent,
    RiskEventKind, RiskEventSeverity, TradeSide, VirtualTradeRecord, Whale, WhaleStatus, WhaleTrade,
};
use crate::money::{Probability, Usd};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| CoreError::Persistence(format!("open {:?}: {e}", db_path.as_ref())))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), CoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS whales (
                wallet_address TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                total_volume_usd TEXT NOT NULL,
                avg_trade_size_usd TEXT NOT NULL,
                total_trades INTEGER NOT NULL,
                trades_last_72h INTEGER NOT NULL,
                days_active INTEGER NOT NULL,
                rank_score TEXT,
                risk_score TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                last_qualified_at TEXT,
                is_active INTEGER NOT NULL,
                realized_pnl_usd TEXT NOT NULL DEFAULT '0',
                copied_trade_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS whale_trades (
                external_id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_whale_trades_wallet_time
                ON whale_trades(wallet_address, occurred_at);

            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                exit_price TEXT,
                realized_pnl TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                whale_risk_score_at_open TEXT NOT NULL,
                mode TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                price TEXT NOT NULL,
                exit_price TEXT,
                size_usd TEXT NOT NULL,
                commission TEXT NOT NULL,
                gas_cost_usd TEXT NOT NULL,
                gross_pnl TEXT,
                whale_source TEXT,
                executed_at TEXT NOT NULL,
                settled_at TEXT
            );

            CREATE TABLE IF NOT EXISTS bankroll_snapshots (
                snapshot_id TEXT PRIMARY KEY,
                total_capital TEXT NOT NULL,
                allocated_usd TEXT NOT NULL,
                available_usd TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                daily_pnl TEXT NOT NULL,
                daily_drawdown TEXT NOT NULL,
                total_trades INTEGER NOT NULL,
                win_count INTEGER NOT NULL,
                loss_count INTEGER NOT NULL,
                taken_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bankroll_snapshots_taken_at
                ON bankroll_snapshots(taken_at);

            CREATE TABLE IF NOT EXISTS risk_events (
                event_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                detail TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS opportunities (
                opportunity_id TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                market_id TEXT NOT NULL,
                recommended_size_usd TEXT NOT NULL,
                status TEXT NOT NULL,
                reject_reason TEXT,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| CoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn upsert_whale(&self, whale: &Whale) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO whales (
                wallet_address, status, total_volume_usd, avg_trade_size_usd,
                total_trades, trades_last_72h, days_active, rank_score, risk_score,
                first_seen_at, last_seen_at, last_qualified_at, is_active,
                realized_pnl_usd, copied_trade_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(wallet_address) DO UPDATE SET
                status = excluded.status,
                total_volume_usd = excluded.total_volume_usd,
                avg_trade_size_usd = excluded.avg_trade_size_usd,
                total_trades = excluded.total_trades,
                trades_last_72h = excluded.trades_last_72h,
                days_active = excluded.days_active,
                rank_score = excluded.rank_score,
                risk_score = excluded.risk_score,
                last_seen_at = excluded.last_seen_at,
                last_qualified_at = excluded.last_qualified_at,
                is_active = excluded.is_active,
                realized_pnl_usd = excluded.realized_pnl_usd,
                copied_trade_count = excluded.copied_trade_count",
            params![
                whale.wallet_address,
                status_to_str(whale.status),
                whale.total_volume_usd.inner().to_string(),
                whale.avg_trade_size_usd.inner().to_string(),
                whale.total_trades as i64,
                whale.trades_last_72h as i64,
                whale.days_active as i64,
                whale.rank_score.map(|v| v.to_string()),
                whale.risk_score.to_string(),
                whale.first_seen_at.to_rfc3339(),
                whale.last_seen_at.to_rfc3339(),
                whale.last_qualified_at.map(|t| t.to_rfc3339()),
                whale.is_active as i64,
                whale.realized_pnl_usd.inner().to_string(),
                whale.copied_trade_count as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn get_whale(&self, wallet_address: &str) -> Result<Option<Whale>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, status, total_volume_usd, avg_trade_size_usd,
                    total_trades, trades_last_72h, days_active, rank_score, risk_score,
                    first_seen_at, last_seen_at, last_qualified_at, is_active,
                    realized_pnl_usd, copied_trade_count
             FROM whales WHERE wallet_address = ?1",
        )?;
        let whale = stmt
            .query_row(params![wallet_address], row_to_whale)
            .optional()?;
        Ok(whale)
    }

    /// Primes `WhaleDetector`'s in-memory `known_whales` cache at startup;
    /// nothing is served from that cache until this call has returned.
    pub async fn load_known_whales(
        &self,
    ) -> Result<std::collections::HashMap<String, Whale>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, status, total_volume_usd, avg_trade_size_usd,
                    total_trades, trades_last_72h, days_active, rank_score, risk_score,
                    first_seen_at, last_seen_at, last_qualified_at, is_active,
                    realized_pnl_usd, copied_trade_count
             FROM whales",
        )?;
        let rows = stmt
            .query_map(params![], row_to_whale)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|w| (w.wallet_address.clone(), w)).collect())
    }

    /// Ordered by the persisted composite `rank_score`, descending;
    /// `WhaleDetector` recomputes and persists `rank_score` every polling
    /// cycle, so this reads the most recent ranking without recomputation.
    pub async fn load_top_whales(&self, n: usize) -> Result<Vec<Whale>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, status, total_volume_usd, avg_trade_size_usd,
                    total_trades, trades_last_72h, days_active, rank_score, risk_score,
                    first_seen_at, last_seen_at, last_qualified_at, is_active,
                    realized_pnl_usd, copied_trade_count
             FROM whales WHERE status = 'ranked'
             ORDER BY CAST(rank_score AS REAL) DESC, CAST(risk_score AS REAL) ASC, first_seen_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![n as i64], row_to_whale)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn list_whales_by_status(&self, status: WhaleStatus) -> Result<Vec<Whale>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, status, total_volume_usd, avg_trade_size_usd,
                    total_trades, trades_last_72h, days_active, rank_score, risk_score,
                    first_seen_at, last_seen_at, last_qualified_at, is_active,
                    realized_pnl_usd, copied_trade_count
             FROM whales WHERE status = ?1",
        )?;
        let rows = stmt
            .query_map(params![status_to_str(status)], row_to_whale)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn insert_whale_trade(&self, trade: &WhaleTrade) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO whale_trades
                (external_id, wallet_address, market_id, token_id, side, price, size_usd, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trade.external_id,
                trade.wallet_address,
                trade.market_id,
                trade.token_id,
                side_to_str(trade.side),
                trade.price.inner().to_string(),
                trade.size_usd.inner().to_string(),
                trade.occurred_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn whale_trades_since(
        &self,
        wallet_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WhaleTrade>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT external_id, wallet_address, market_id, token_id, side, price, size_usd, occurred_at
             FROM whale_trades WHERE wallet_address = ?1 AND occurred_at >= ?2
             ORDER BY occurred_at ASC",
        )?;
        let rows = stmt
            .query_map(params![wallet_address, since.to_rfc3339()], row_to_whale_trade)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn upsert_position(&self, position: &CopyPosition) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions (
                position_id, wallet_address, market_id, token_id, side, status, entry_price,
                size_usd, exit_price, realized_pnl, opened_at, closed_at,
                whale_risk_score_at_open, mode
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(position_id) DO UPDATE SET
                status = excluded.status,
                exit_price = excluded.exit_price,
                realized_pnl = excluded.realized_pnl,
                closed_at = excluded.closed_at",
            params![
                position.position_id,
                position.wallet_address,
                position.market_id,
                position.token_id,
                side_to_str(position.side),
                position_status_to_str(position.status),
                position.entry_price.inner().to_string(),
                position.size_usd.inner().to_string(),
                position.exit_price.map(|p| p.inner().to_string()),
                position.realized_pnl.map(|p| p.inner().to_string()),
                position.opened_at.to_rfc3339(),
                position.closed_at.map(|t| t.to_rfc3339()),
                position.whale_risk_score_at_open.to_string(),
                mode_to_str(position.mode),
            ],
        )?;
        Ok(())
    }

    pub async fn open_positions_for_wallet_market(
        &self,
        wallet_address: &str,
        market_id: &str,
    ) -> Result<Vec<CopyPosition>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, wallet_address, market_id, token_id, side, status, entry_price,
                    size_usd, exit_price, realized_pnl, opened_at, closed_at,
                    whale_risk_score_at_open, mode
             FROM positions WHERE wallet_address = ?1 AND market_id = ?2 AND status = 'open'",
        )?;
        let rows = stmt
            .query_map(params![wallet_address, market_id], row_to_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every currently-open position across all wallets/markets, for
    /// `MetricsAggregator`'s cross-position unrealized-PnL mark.
    pub async fn all_open_positions(&self) -> Result<Vec<CopyPosition>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, wallet_address, market_id, token_id, side, status, entry_price,
                    size_usd, exit_price, realized_pnl, opened_at, closed_at,
                    whale_risk_score_at_open, mode
             FROM positions WHERE status = 'open'",
        )?;
        let rows = stmt
            .query_map(params![], row_to_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persists a trade record and its bankroll snapshot in a single
    /// transaction, so the two never diverge on partial failure.
    pub async fn record_trade_and_snapshot(
        &self,
        trade: &VirtualTradeRecord,
        snapshot: &BankrollSnapshot,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        tx.execute(
            "INSERT INTO trades (
                trade_id, position_id, market_id, side, status, price, exit_price, size_usd,
                commission, gas_cost_usd, gross_pnl, whale_source, executed_at, settled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(trade_id) DO UPDATE SET
                status = excluded.status,
                exit_price = excluded.exit_price,
                gross_pnl = excluded.gross_pnl,
                settled_at = excluded.settled_at",
            params![
                trade.trade_id,
                trade.position_id,
                trade.market_id,
                side_to_str(trade.side),
                position_status_to_str(trade.status),
                trade.price.inner().to_string(),
                trade.exit_price.map(|p| p.inner().to_string()),
                trade.size_usd.inner().to_string(),
                trade.commission.inner().to_string(),
                trade.gas_cost_usd.inner().to_string(),
                trade.gross_pnl.map(|p| p.inner().to_string()),
                trade.whale_source,
                trade.executed_at.to_rfc3339(),
                trade.settled_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| CoreError::Persistence(e.to_string()))?;
        tx.execute(
            "INSERT INTO bankroll_snapshots (
                snapshot_id, total_capital, allocated_usd, available_usd,
                realized_pnl, unrealized_pnl, daily_pnl, daily_drawdown,
                total_trades, win_count, loss_count, taken_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                snapshot.snapshot_id,
                snapshot.total_capital.inner().to_string(),
                snapshot.allocated_usd.inner().to_string(),
                snapshot.available_usd.inner().to_string(),
                snapshot.realized_pnl.inner().to_string(),
                snapshot.unrealized_pnl.inner().to_string(),
                snapshot.daily_pnl.inner().to_string(),
                snapshot.daily_drawdown.inner().to_string(),
                snapshot.total_trades as i64,
                snapshot.win_count as i64,
                snapshot.loss_count as i64,
                snapshot.taken_at.to_rfc3339(),
            ],
        )
        .map_err(|e| CoreError::Persistence(e.to_string()))?;
        tx.commit().map_err(|e| CoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn latest_bankroll_snapshot(&self) -> Result<Option<BankrollSnapshot>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_id, total_capital, allocated_usd, available_usd,
                    realized_pnl, unrealized_pnl, daily_pnl, daily_drawdown,
                    total_trades, win_count, loss_count, taken_at
             FROM bankroll_snapshots ORDER BY taken_at DESC LIMIT 1",
        )?;
        let snap = stmt.query_row(params![], row_to_snapshot).optional()?;
        Ok(snap)
    }

    /// Full snapshot series since `since`, ascending, for `MetricsAggregator`'s
    /// peak-to-trough `max_drawdown` computation.
    pub async fn bankroll_snapshot_series(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BankrollSnapshot>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_id, total_capital, allocated_usd, available_usd,
                    realized_pnl, unrealized_pnl, daily_pnl, daily_drawdown,
                    total_trades, win_count, loss_count, taken_at
             FROM bankroll_snapshots WHERE taken_at >= ?1 ORDER BY taken_at ASC",
        )?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn trades_in_range(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<VirtualTradeRecord>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, position_id, market_id, side, status, price, exit_price, size_usd,
                    commission, gas_cost_usd, gross_pnl, whale_source, executed_at, settled_at
             FROM trades WHERE executed_at >= ?1 ORDER BY executed_at ASC",
        )?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], row_to_trade)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every trade attributed to `wallet_address`, open and closed, used by
    /// `WhaleTracker` to fold `realized_pnl_usd`/`copied_trade_count` onto
    /// the whale's own record.
    pub async fn trades_by_whale(
        &self,
        wallet_address: &str,
    ) -> Result<Vec<VirtualTradeRecord>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, position_id, market_id, side, status, price, exit_price, size_usd,
                    commission, gas_cost_usd, gross_pnl, whale_source, executed_at, settled_at
             FROM trades WHERE whale_source = ?1",
        )?;
        let rows = stmt
            .query_map(params![wallet_address], row_to_trade)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Standalone snapshot insert used by `MetricsAggregator` for periodic
    /// equity snapshots that have no paired trade write.
    pub async fn insert_bankroll_snapshot_equity(
        &self,
        snapshot: &BankrollSnapshot,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO bankroll_snapshots (
                snapshot_id, total_capital, allocated_usd, available_usd,
                realized_pnl, unrealized_pnl, daily_pnl, daily_drawdown,
                total_trades, win_count, loss_count, taken_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                snapshot.snapshot_id,
                snapshot.total_capital.inner().to_string(),
                snapshot.allocated_usd.inner().to_string(),
                snapshot.available_usd.inner().to_string(),
                snapshot.realized_pnl.inner().to_string(),
                snapshot.unrealized_pnl.inner().to_string(),
                snapshot.daily_pnl.inner().to_string(),
                snapshot.daily_drawdown.inner().to_string(),
                snapshot.total_trades as i64,
                snapshot.win_count as i64,
                snapshot.loss_count as i64,
                snapshot.taken_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn insert_risk_event(&self, event: &RiskEvent) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO risk_events (event_id, kind, severity, detail, occurred_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id,
                risk_event_kind_to_str(event.kind),
                risk_event_severity_to_str(event.severity),
                event.detail,
                event.occurred_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn insert_opportunity(&self, opp: &Opportunity) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO opportunities (
                opportunity_id, signal_id, wallet_address, market_id, recommended_size_usd,
                status, reject_reason, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(opportunity_id) DO UPDATE SET
                status = excluded.status, reject_reason = excluded.reject_reason",
            params![
                opp.opportunity_id,
                opp.signal_id,
                opp.wallet_address,
                opp.market_id,
                opp.recommended_size_usd.inner().to_string(),
                opportunity_status_to_str(opp.status),
                opp.reject_reason,
                opp.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn status_to_str(status: WhaleStatus) -> &'static str {
    match status {
        WhaleStatus::Discovered => "discovered",
        WhaleStatus::Qualified => "qualified",
        WhaleStatus::Ranked => "ranked",
        WhaleStatus::Rejected => "rejected",
    }
}

fn status_from_str(s: &str) -> WhaleStatus {
    match s {
        "qualified" => WhaleStatus::Qualified,
        "ranked" => WhaleStatus::Ranked,
        "rejected" => WhaleStatus::Rejected,
        _ => WhaleStatus::Discovered,
    }
}

fn side_to_str(side: TradeSide) -> &'static str {
    match side {
        TradeSide::Buy => "buy",
        TradeSide::Sell => "sell",
    }
}

fn side_from_str(s: &str) -> TradeSide {
    if s == "sell" {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    }
}

fn position_status_to_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "open",
        PositionStatus::Closed => "closed",
    }
}

fn position_status_from_str(s: &str) -> PositionStatus {
    if s == "closed" {
        PositionStatus::Closed
    } else {
        PositionStatus::Open
    }
}

fn risk_event_kind_to_str(kind: RiskEventKind) -> &'static str {
    match kind {
        RiskEventKind::DrawdownThrottle => "drawdown_throttle",
        RiskEventKind::DrawdownRelease => "drawdown_release",
        RiskEventKind::DailyLossLimit => "daily_loss_limit",
        RiskEventKind::ConsecutiveLosses => "consecutive_losses",
        RiskEventKind::FailedExecutions => "failed_executions",
        RiskEventKind::ManualKillSwitch => "manual_kill_switch",
        RiskEventKind::ExposureLimit => "exposure_limit",
    }
}

fn risk_event_severity_to_str(severity: RiskEventSeverity) -> &'static str {
    match severity {
        RiskEventSeverity::Info => "info",
        RiskEventSeverity::Warning => "warning",
        RiskEventSeverity::Critical => "critical",
    }
}

fn mode_to_str(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Paper => "paper",
        RunMode::Live => "live",
    }
}

fn mode_from_str(s: &str) -> RunMode {
    if s == "live" {
        RunMode::Live
    } else {
        RunMode::Paper
    }
}

fn opportunity_status_to_str(status: OpportunityStatus) -> &'static str {
    match status {
        OpportunityStatus::Pending => "pending",
        OpportunityStatus::Accepted => "accepted",
        OpportunityStatus::Rejected => "rejected",
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn parse_decimal(s: &str) -> rust_decimal::Decimal {
    rust_decimal::Decimal::from_str(s).unwrap_or_default()
}

fn row_to_whale(row: &rusqlite::Row) -> rusqlite::Result<Whale> {
    let rank_score: Option<String> = row.get(7)?;
    let last_qualified_at: Option<String> = row.get(11)?;
    Ok(Whale {
        wallet_address: row.get(0)?,
        status: status_from_str(&row.get::<_, String>(1)?),
        total_volume_usd: Usd::new(parse_decimal(&row.get::<_, String>(2)?)),
        avg_trade_size_usd: Usd::new(parse_decimal(&row.get::<_, String>(3)?)),
        total_trades: row.get::<_, i64>(4)? as u64,
        trades_last_72h: row.get::<_, i64>(5)? as u32,
        days_active: row.get::<_, i64>(6)? as u32,
        rank_score: rank_score.map(|s| parse_decimal(&s)),
        risk_score: parse_decimal(&row.get::<_, String>(8)?),
        first_seen_at: parse_rfc3339(&row.get::<_, String>(9)?),
        last_seen_at: parse_rfc3339(&row.get::<_, String>(10)?),
        last_qualified_at: last_qualified_at.map(|s| parse_rfc3339(&s)),
        is_active: row.get::<_, i64>(12)? != 0,
        realized_pnl_usd: Usd::new(parse_decimal(&row.get::<_, String>(13)?)),
        copied_trade_count: row.get::<_, i64>(14)? as u64,
    })
}

fn row_to_whale_trade(row: &rusqlite::Row) -> rusqlite::Result<WhaleTrade> {
    Ok(WhaleTrade {
        external_id: row.get(0)?,
        wallet_address: row.get(1)?,
        market_id: row.get(2)?,
        token_id: row.get(3)?,
        side: side_from_str(&row.get::<_, String>(4)?),
        price: Probability::new(parse_decimal(&row.get::<_, String>(5)?)),
        size_usd: Usd::new(parse_decimal(&row.get::<_, String>(6)?)),
        occurred_at: parse_rfc3339(&row.get::<_, String>(7)?),
    })
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<CopyPosition> {
    let exit_price: Option<String> = row.get(8)?;
    let realized_pnl: Option<String> = row.get(9)?;
    let closed_at: Option<String> = row.get(11)?;
    Ok(CopyPosition {
        position_id: row.get(0)?,
        wallet_address: row.get(1)?,
        market_id: row.get(2)?,
        token_id: row.get(3)?,
        side: side_from_str(&row.get::<_, String>(4)?),
        status: position_status_from_str(&row.get::<_, String>(5)?),
        entry_price: Probability::new(parse_decimal(&row.get::<_, String>(6)?)),
        size_usd: Usd::new(parse_decimal(&row.get::<_, String>(7)?)),
        exit_price: exit_price.map(|s| Probability::new(parse_decimal(&s))),
        realized_pnl: realized_pnl.map(|s| Usd::new(parse_decimal(&s))),
        opened_at: parse_rfc3339(&row.get::<_, String>(10)?),
        closed_at: closed_at.map(|s| parse_rfc3339(&s)),
        whale_risk_score_at_open: parse_decimal(&row.get::<_, String>(12)?),
        mode: mode_from_str(&row.get::<_, String>(13)?),
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<VirtualTradeRecord> {
    let exit_price: Option<String> = row.get(6)?;
    let gross_pnl: Option<String> = row.get(10)?;
    let whale_source: Option<String> = row.get(11)?;
    let settled_at: Option<String> = row.get(13)?;
    Ok(VirtualTradeRecord {
        trade_id: row.get(0)?,
        position_id: row.get(1)?,
        market_id: row.get(2)?,
        side: side_from_str(&row.get::<_, String>(3)?),
        status: position_status_from_str(&row.get::<_, String>(4)?),
        price: Probability::new(parse_decimal(&row.get::<_, String>(5)?)),
        exit_price: exit_price.map(|s| Probability::new(parse_decimal(&s))),
        size_usd: Usd::new(parse_decimal(&row.get::<_, String>(7)?)),
        commission: Usd::new(parse_decimal(&row.get::<_, String>(8)?)),
        gas_cost_usd: Usd::new(parse_decimal(&row.get::<_, String>(9)?)),
        gross_pnl: gross_pnl.map(|s| Usd::new(parse_decimal(&s))),
        whale_source,
        executed_at: parse_rfc3339(&row.get::<_, String>(12)?),
        settled_at: settled_at.map(|s| parse_rfc3339(&s)),
    })
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<BankrollSnapshot> {
    Ok(BankrollSnapshot {
        snapshot_id: row.get(0)?,
        total_capital: Usd::new(parse_decimal(&row.get::<_, String>(1)?)),
        allocated_usd: Usd::new(parse_decimal(&row.get::<_, String>(2)?)),
        available_usd: Usd::new(parse_decimal(&row.get::<_, String>(3)?)),
        realized_pnl: Usd::new(parse_decimal(&row.get::<_, String>(4)?)),
        unrealized_pnl: Usd::new(parse_decimal(&row.get::<_, String>(5)?)),
        daily_pnl: Usd::new(parse_decimal(&row.get::<_, String>(6)?)),
        daily_drawdown: Usd::new(parse_decimal(&row.get::<_, String>(7)?)),
        total_trades: row.get::<_, i64>(8)? as u64,
        win_count: row.get::<_, i64>(9)? as u64,
        loss_count: row.get::<_, i64>(10)? as u64,
        taken_at: parse_rfc3339(&row.get::<_, String>(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn whale_upsert_is_idempotent_and_persists_before_any_cache_would_read() {
        let store = Store::open_in_memory().unwrap();
        let mut whale = Whale::new("0xabc".into(), now());
        whale.total_volume_usd = Usd::new(dec!(1000));
        store.upsert_whale(&whale).await.unwrap();

        let fetched = store.get_whale("0xabc").await.unwrap().unwrap();
        assert_eq!(fetched.total_volume_usd, Usd::new(dec!(1000)));

        whale.status = WhaleStatus::Qualified;
        whale.total_volume_usd = Usd::new(dec!(2000));
        store.upsert_whale(&whale).await.unwrap();

        let fetched = store.get_whale("0xabc").await.unwrap().unwrap();
        assert_eq!(fetched.status, WhaleStatus::Qualified);
        assert_eq!(fetched.total_volume_usd, Usd::new(dec!(2000)));
    }

    #[tokio::test]
    async fn whale_trade_insert_is_natural_key_deduped() {
        let store = Store::open_in_memory().unwrap();
        let trade = WhaleTrade {
            external_id: "ext-1".into(),
            wallet_address: "0xabc".into(),
            market_id: "m1".into(),
            token_id: "t1".into(),
            side: TradeSide::Buy,
            price: Probability::new(dec!(0.5)),
            size_usd: Usd::new(dec!(100)),
            occurred_at: now(),
        };
        store.insert_whale_trade(&trade).await.unwrap();
        store.insert_whale_trade(&trade).await.unwrap();

        let trades = store
            .whale_trades_since("0xabc", now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn trade_and_snapshot_are_committed_together() {
        let store = Store::open_in_memory().unwrap();
        let trade = VirtualTradeRecord {
            trade_id: "t1".into(),
            position_id: "p1".into(),
            market_id: "m1".into(),
            side: TradeSide::Buy,
            status: PositionStatus::Open,
            price: Probability::new(dec!(0.5)),
            exit_price: None,
            size_usd: Usd::new(dec!(100)),
            commission: Usd::new(dec!(1)),
            gas_cost_usd: Usd::ZERO,
            gross_pnl: None,
            whale_source: None,
            executed_at: now(),
            settled_at: None,
        };
        let snapshot = BankrollSnapshot {
            snapshot_id: "s1".into(),
            total_capital: Usd::new(dec!(9900)),
            allocated_usd: Usd::new(dec!(100)),
            available_usd: Usd::new(dec!(9800)),
            realized_pnl: Usd::ZERO,
            unrealized_pnl: Usd::ZERO,
            daily_pnl: Usd::ZERO,
            daily_drawdown: Usd::ZERO,
            total_trades: 1,
            win_count: 0,
            loss_count: 0,
            taken_at: now(),
        };
        store
            .record_trade_and_snapshot(&trade, &snapshot)
            .await
            .unwrap();

        let fetched = store.latest_bankroll_snapshot().await.unwrap().unwrap();
        assert_eq!(fetched.snapshot_id, "s1");
    }

    #[tokio::test]
    async fn data_survives_reopening_a_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("whalecopy.db");

        {
            let store = Store::open(&db_path).unwrap();
            let mut whale = Whale::new("0xabc".into(), now());
            whale.total_volume_usd = Usd::new(dec!(1000));
            store.upsert_whale(&whale).await.unwrap();
        }

        let store = Store::open(&db_path).unwrap();
        let fetched = store.get_whale("0xabc").await.unwrap().unwrap();
        assert_eq!(fetched.total_volume_usd, Usd::new(dec!(1000)));
    }
}
