//! WebSocket market-data stream client.
//!
//! Reconnect/backoff/heartbeat shape follows this codebase's Polymarket
//! market-data cache worker: a background task owns the socket, commands
//! flow in over a bounded channel, and a typed handler (not a callback
//! closure) receives decoded events.

use crate::config::StreamConfig;
use crate::error::CoreError;
use crate::models::{MarketEvent, TradeSide};
use crate::money::{Probability, Usd};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Bounds how many undelivered events a stalled handler can pile up before
/// the connection starts shedding load. Orderbook deltas are dropped first,
/// trades are never dropped.
struct BackpressureBuffer {
    events: VecDeque<MarketEvent>,
    capacity: usize,
    degraded: bool,
}

impl BackpressureBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            degraded: false,
        }
    }

    /// Pushes an event, evicting the oldest non-trade event first if the
    /// buffer is at capacity. Trades are always enqueued. Returns `true` the
    /// first time a drop occurs on this connection (caller should surface a
    /// degraded `ConnectionStateChange`).
    fn push(&mut self, event: MarketEvent) -> bool {
        let mut became_degraded = false;
        if self.events.len() >= self.capacity {
            let evict_at = self
                .events
                .iter()
                .position(|e| matches!(e, MarketEvent::OrderbookDelta { .. }))
                .or_else(|| {
                    self.events
                        .iter()
                        .position(|e| matches!(e, MarketEvent::PriceChange { .. }))
                });
            match evict_at {
                Some(idx) => {
                    self.events.remove(idx);
                }
                None if !matches!(event, MarketEvent::Trade { .. }) => {
                    // Nothing evictable and the new event isn't a trade either;
                    // drop the incoming event instead of growing unbounded.
                    if !self.degraded {
                        self.degraded = true;
                        became_degraded = true;
                    }
                    return became_degraded;
                }
                None => {}
            }
            if !self.degraded {
                self.degraded = true;
                became_degraded = true;
            }
        }
        self.events.push_back(event);
        became_degraded
    }

    fn drain(&mut self) -> Vec<MarketEvent> {
        self.events.drain(..).collect()
    }
}

#[async_trait]
pub trait MarketEventHandler: Send + Sync {
    async fn handle(&self, event: MarketEvent);
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

pub struct StreamClient {
    cmd_tx: mpsc::Sender<Command>,
}

impl StreamClient {
    /// Opens the stream and spawns the background connection-management
    /// task. Events are pushed to `handler` as they are decoded.
    pub fn open(config: StreamConfig, handler: Arc<dyn MarketEventHandler>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(run(config, handler, cmd_rx));
        Self { cmd_tx }
    }

    pub async fn subscribe(&self, token_id: String) -> Result<(), CoreError> {
        self.cmd_tx
            .send(Command::Subscribe(token_id))
            .await
            .map_err(|_| CoreError::Protocol("stream worker closed".into()))
    }

    pub async fn unsubscribe(&self, token_id: String) -> Result<(), CoreError> {
        self.cmd_tx
            .send(Command::Unsubscribe(token_id))
            .await
            .map_err(|_| CoreError::Protocol("stream worker closed".into()))
    }

    pub async fn close(&self) -> Result<(), CoreError> {
        self.cmd_tx
            .send(Command::Close)
            .await
            .map_err(|_| CoreError::Protocol("stream worker already closed".into()))
    }
}

async fn run(
    config: StreamConfig,
    handler: Arc<dyn MarketEventHandler>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let mut desired_assets: HashSet<String> = HashSet::new();
    let mut backoff_ms = config.backoff_initial_ms;
    let mut parse_failures: Vec<Instant> = Vec::new();

    loop {
        tokio::select! {
            result = connect_and_stream(&config, &desired_assets, &mut cmd_rx, &handler, &mut parse_failures) => {
                match result {
                    StreamOutcome::Closed => {
                        info!("stream client closed");
                        return;
                    }
                    StreamOutcome::Disconnected => {
                        handler
                            .handle(MarketEvent::ConnectionStateChange {
                                connected: false,
                                degraded: false,
                                reason: None,
                                at: Utc::now(),
                            })
                            .await;
                        let sleep_ms = jittered(backoff_ms);
                        warn!("stream disconnected, reconnecting in {}ms", sleep_ms);
                        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(config.backoff_max_ms);
                    }
                }
            }
        }

        // Drain any subscribe/unsubscribe commands issued while disconnected
        // so the next connection attempt resends the exact desired set.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Command::Subscribe(id) => {
                    desired_assets.insert(id);
                }
                Command::Unsubscribe(id) => {
                    desired_assets.remove(&id);
                }
                Command::Close => return,
            }
        }
    }
}

enum StreamOutcome {
    Disconnected,
    Closed,
}

/// Applies +/-20% jitter to a backoff duration so a bulk reconnect event
/// (e.g. an upstream restart) doesn't land every client on the same tick.
fn jittered(base_ms: u64) -> u64 {
    let spread = (base_ms as f64 * 0.2) as i64;
    if spread == 0 {
        return base_ms;
    }
    let delta = rand::thread_rng().gen_range(-spread..=spread);
    (base_ms as i64 + delta).max(0) as u64
}

async fn connect_and_stream(
    config: &StreamConfig,
    desired_assets: &HashSet<String>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    handler: &Arc<dyn MarketEventHandler>,
    parse_failures: &mut Vec<Instant>,
) -> StreamOutcome {
    let mut buffer = BackpressureBuffer::new(config.max_buffered_events);
    let (ws_stream, _) = match tokio_tungstenite::connect_async(&config.url).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("websocket connect failed: {e}");
            return StreamOutcome::Disconnected;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    if !desired_assets.is_empty() {
        let assets: Vec<&String> = desired_assets.iter().collect();
        let subscribe_msg = serde_json::json!({
            "type": "market",
            "assets_ids": assets,
        });
        if write
            .send(Message::Text(subscribe_msg.to_string()))
            .await
            .is_err()
        {
            return StreamOutcome::Disconnected;
        }
    }

    handler
        .handle(MarketEvent::ConnectionStateChange {
            connected: true,
            degraded: false,
            reason: None,
            at: Utc::now(),
        })
        .await;

    let mut heartbeat = interval(config.heartbeat_interval());
    let mut desired_assets = desired_assets.clone();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if write.send(Message::Text("PING".to_string())).await.is_err() {
                    return StreamOutcome::Disconnected;
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Subscribe(token_id)) => {
                        desired_assets.insert(token_id.clone());
                        let msg = serde_json::json!({
                            "assets_ids": [token_id],
                            "operation": "subscribe",
                        });
                        let _ = write.send(Message::Text(msg.to_string())).await;
                    }
                    Some(Command::Unsubscribe(token_id)) => {
                        desired_assets.remove(&token_id);
                        let msg = serde_json::json!({
                            "assets_ids": [token_id],
                            "operation": "unsubscribe",
                        });
                        let _ = write.send(Message::Text(msg.to_string())).await;
                    }
                    Some(Command::Close) => {
                        let _ = write.close().await;
                        return StreamOutcome::Closed;
                    }
                    None => return StreamOutcome::Closed,
                }
            }
            msg = tokio::time::timeout(config.read_idle_timeout(), read.next()) => {
                let msg = match msg {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(e))) => {
                        error!("websocket read error: {e}");
                        return StreamOutcome::Disconnected;
                    }
                    Ok(None) => return StreamOutcome::Disconnected,
                    Err(_) => {
                        warn!("no messages received within read idle timeout");
                        return StreamOutcome::Disconnected;
                    }
                };
                for event in decode_message(msg, parse_failures) {
                    if buffer.push(event) {
                        handler
                            .handle(MarketEvent::ConnectionStateChange {
                                connected: true,
                                degraded: true,
                                reason: Some("backpressure".to_string()),
                                at: Utc::now(),
                            })
                            .await;
                        warn!("stream backpressure: dropping oldest orderbook deltas, handler degraded");
                    }
                }
                for event in buffer.drain() {
                    handler.handle(event).await;
                }
                if parse_failures_exceeded(parse_failures, config) {
                    warn!("too many parse failures, forcing reconnect");
                    return StreamOutcome::Disconnected;
                }
            }
        }
    }
}

fn parse_failures_exceeded(parse_failures: &mut Vec<Instant>, config: &StreamConfig) -> bool {
    let window = Duration::from_secs(config.parse_failure_window_secs);
    let now = Instant::now();
    parse_failures.retain(|t| now.duration_since(*t) < window);
    parse_failures.len() as u32 >= config.parse_failure_threshold
}

/// Decodes one WS frame into zero or more market events. Accepts plain text,
/// brotli-compressed binary payloads, and both JSON-object (single event)
/// and JSON-array (multiple events, fanned out preserving order) frames.
fn decode_message(msg: Message, parse_failures: &mut Vec<Instant>) -> Vec<MarketEvent> {
    let text = match msg {
        Message::Text(t) => t,
        Message::Binary(bytes) => match decompress_brotli(&bytes) {
            Some(t) => t,
            None => {
                debug!("failed to decompress binary ws frame");
                parse_failures.push(Instant::now());
                return Vec::new();
            }
        },
        Message::Ping(_) | Message::Pong(_) => return Vec::new(),
        _ => return Vec::new(),
    };

    if text == "PONG" {
        return Vec::new();
    }

    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            debug!("failed to parse ws message: {e}");
            parse_failures.push(Instant::now());
            return Vec::new();
        }
    };

    let envelopes: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut events = Vec::with_capacity(envelopes.len());
    for raw in envelopes {
        match serde_json::from_value::<WsEnvelope>(raw) {
            Ok(envelope) => {
                if let Some(event) = envelope.into_market_event() {
                    events.push(event);
                }
            }
            Err(e) => {
                debug!("failed to parse ws envelope: {e}");
                parse_failures.push(Instant::now());
            }
        }
    }
    events
}

/// Polymarket may serve brotli-compressed binary frames under load. Returns
/// `None` on malformed/non-brotli payloads so the caller can count it as a
/// parse failure rather than panic.
fn decompress_brotli(bytes: &[u8]) -> Option<String> {
    let mut decoder = brotli::Decompressor::new(bytes, 4096);
    let mut out = String::new();
    decoder.read_to_string(&mut out).ok()?;
    Some(out)
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    event_type: String,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    market: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    taker_address: Option<String>,
    #[serde(default)]
    side: Option<String>,
}

impl WsEnvelope {
    fn into_market_event(self) -> Option<MarketEvent> {
        let at = Utc::now();
        match self.event_type.as_str() {
            "last_trade_price" => {
                let token_id = self.asset_id?;
                let price = Probability::new(Decimal::from_str(&self.price?).ok()?);
                let size_usd = Usd::new(
                    self.size
                        .and_then(|s| Decimal::from_str(&s).ok())
                        .unwrap_or_default(),
                );
                let taker_side = self.side.map(|s| {
                    if s.eq_ignore_ascii_case("sell") {
                        TradeSide::Sell
                    } else {
                        TradeSide::Buy
                    }
                });
                Some(MarketEvent::Trade {
                    market_id: self.market.unwrap_or_default(),
                    token_id,
                    price,
                    size_usd,
                    taker_address: self.taker_address,
                    taker_side,
                    at,
                })
            }
            "price_change" => {
                let token_id = self.asset_id?;
                let price = Probability::new(Decimal::from_str(&self.price?).ok()?);
                Some(MarketEvent::PriceChange { token_id, price, at })
            }
            "book" => {
                let token_id = self.asset_id?;
                Some(MarketEvent::OrderbookDelta { token_id, at })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_and_unknown_envelopes_are_not_events() {
        let envelope: WsEnvelope = serde_json::from_str(
            r#"{"event_type":"unknown_type","asset_id":"t1"}"#,
        )
        .unwrap();
        assert!(envelope.into_market_event().is_none());
    }

    #[test]
    fn trade_envelope_parses_into_decimal_price_and_size() {
        let envelope: WsEnvelope = serde_json::from_str(
            r#"{"event_type":"last_trade_price","asset_id":"t1","market":"m1","price":"0.42","size":"100.5","side":"SELL"}"#,
        )
        .unwrap();
        match envelope.into_market_event().unwrap() {
            MarketEvent::Trade { price, size_usd, taker_side, .. } => {
                assert_eq!(price.inner(), Decimal::from_str("0.42").unwrap());
                assert_eq!(size_usd.inner(), Decimal::from_str("100.5").unwrap());
                assert_eq!(taker_side, Some(TradeSide::Sell));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_failure_window_forgets_old_failures() {
        let config = StreamConfig {
            parse_failure_threshold: 2,
            parse_failure_window_secs: 30,
            ..StreamConfig::default()
        };
        let mut failures = vec![Instant::now() - Duration::from_secs(60)];
        assert!(!parse_failures_exceeded(&mut failures, &config));
        assert!(failures.is_empty());
    }

    #[test]
    fn array_frame_fans_out_preserving_order() {
        let mut failures = Vec::new();
        let text = r#"[{"event_type":"price_change","asset_id":"t1","price":"0.3"},
                       {"event_type":"price_change","asset_id":"t2","price":"0.7"}]"#;
        let events = decode_message(Message::Text(text.to_string()), &mut failures);
        assert_eq!(events.len(), 2);
        match &events[0] {
            MarketEvent::PriceChange { token_id, .. } => assert_eq!(token_id, "t1"),
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[1] {
            MarketEvent::PriceChange { token_id, .. } => assert_eq!(token_id, "t2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn trade_event(at: chrono::DateTime<Utc>) -> MarketEvent {
        MarketEvent::Trade {
            market_id: "m1".into(),
            token_id: "t1".into(),
            price: Probability::new(Decimal::from_str("0.5").unwrap()),
            size_usd: Usd::new(Decimal::from_str("10").unwrap()),
            taker_address: None,
            taker_side: None,
            at,
        }
    }

    fn delta_event(at: chrono::DateTime<Utc>) -> MarketEvent {
        MarketEvent::OrderbookDelta { token_id: "t1".into(), at }
    }

    #[test]
    fn backpressure_drops_oldest_orderbook_delta_before_trades() {
        let mut buffer = BackpressureBuffer::new(2);
        let now = Utc::now();
        assert!(!buffer.push(delta_event(now)));
        assert!(!buffer.push(delta_event(now)));
        assert!(buffer.push(trade_event(now)));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], MarketEvent::OrderbookDelta { .. }));
        assert!(matches!(drained[1], MarketEvent::Trade { .. }));
    }

    #[test]
    fn jittered_backoff_stays_within_twenty_percent_band() {
        for _ in 0..100 {
            let ms = jittered(1000);
            assert!((800..=1200).contains(&ms), "jitter out of band: {ms}");
        }
        assert_eq!(jittered(0), 0);
    }

    #[test]
    fn backpressure_never_drops_trades_even_when_buffer_is_full_of_trades() {
        let mut buffer = BackpressureBuffer::new(1);
        let now = Utc::now();
        buffer.push(trade_event(now));
        buffer.push(trade_event(now));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| matches!(e, MarketEvent::Trade { .. })));
    }
}
