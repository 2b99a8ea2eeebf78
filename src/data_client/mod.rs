//! REST data client: paged trade/position/market history over Polymarket's
//! Gamma/CLOB APIs and the Dome wallet-activity API, rate limited and
//! retried the way this codebase's scraper clients already are.

use crate::config::DataApiConfig;
use crate::error::CoreError;
use crate::models::{TradeSide, WhaleTrade};
use crate::money::{Probability, Usd};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

struct RateLimiter {
    requests_per_window: u32,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            requests_per_window,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                while timestamps
                    .front()
                    .map(|t| now.duration_since(*t) > self.window)
                    .unwrap_or(false)
                {
                    timestamps.pop_front();
                }
                if timestamps.len() < self.requests_per_window as usize {
                    timestamps.push_back(now);
                    None
                } else {
                    let oldest = *timestamps.front().unwrap();
                    Some(self.window - now.duration_since(oldest))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DomeOrder {
    token_id: String,
    side: String,
    price: String,
    shares_normalized: String,
    timestamp: i64,
    market_slug: String,
    user: String,
    #[serde(default)]
    order_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GammaMarket {
    id: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct DomePosition {
    token_id: String,
    market_slug: String,
    side: String,
    shares_normalized: String,
    avg_price: String,
    user: String,
}

/// A wallet's current standing position in one market, per `GetPositions`.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub wallet_address: String,
    pub market_id: String,
    pub token_id: String,
    pub side: TradeSide,
    pub size_usd: Usd,
    pub avg_price: Probability,
}

pub struct DataClient {
    http: Client,
    config: DataApiConfig,
    clob_limiter: RateLimiter,
    dome_limiter: RateLimiter,
}

impl DataClient {
    pub fn new(config: DataApiConfig) -> Result<Self, CoreError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("whalecopy/1.0")
            .build()
            .map_err(CoreError::from)?;
        Ok(Self {
            clob_limiter: RateLimiter::new(config.requests_per_10s, Duration::from_secs(10)),
            dome_limiter: RateLimiter::new(60, Duration::from_secs(60)),
            http,
            config,
        })
    }

    /// Paged buy-side trades for a wallet, newest page caps respected.
    pub async fn get_trades(
        &self,
        wallet_address: &str,
        since: Option<DateTime<Utc>>,
        max_pages: u32,
    ) -> Result<Vec<WhaleTrade>, CoreError> {
        let mut all = Vec::new();
        for page in 0..max_pages {
            self.dome_limiter.acquire().await;
            let offset = page * self.config.page_limit;
            let mut query = vec![
                ("user".to_string(), wallet_address.to_string()),
                ("limit".to_string(), self.config.page_limit.to_string()),
                ("offset".to_string(), offset.to_string()),
            ];
            if let Some(ts) = since {
                query.push(("start_time".to_string(), ts.timestamp().to_string()));
            }

            let url = format!("{}/orders", self.config.dome_base_url);
            let mut request = self.http.get(&url).query(&query);
            if let Some(key) = &self.config.dome_api_key {
                request = request.bearer_auth(key);
            }

            let orders: Vec<DomeOrder> = self.execute_with_retry(request).await?;
            let count = orders.len();
            all.extend(orders.into_iter().filter_map(|o| order_to_trade(o).ok()));

            if count < self.config.page_limit as usize {
                break;
            }
        }
        Ok(all)
    }

    /// Paged current positions for a wallet, same rate-limited/retrying path
    /// as `get_trades`.
    pub async fn get_positions(
        &self,
        wallet_address: &str,
        max_pages: u32,
    ) -> Result<Vec<PositionRecord>, CoreError> {
        let mut all = Vec::new();
        for page in 0..max_pages {
            self.dome_limiter.acquire().await;
            let offset = page * self.config.page_limit;
            let query = vec![
                ("user".to_string(), wallet_address.to_string()),
                ("limit".to_string(), self.config.page_limit.to_string()),
                ("offset".to_string(), offset.to_string()),
            ];

            let url = format!("{}/positions", self.config.dome_base_url);
            let mut request = self.http.get(&url).query(&query);
            if let Some(key) = &self.config.dome_api_key {
                request = request.bearer_auth(key);
            }

            let positions: Vec<DomePosition> = self.execute_with_retry(request).await?;
            let count = positions.len();
            all.extend(positions.into_iter().filter_map(|p| position_to_record(p).ok()));

            if count < self.config.page_limit as usize {
                break;
            }
        }
        Ok(all)
    }

    pub async fn get_active_markets(&self) -> Result<Vec<String>, CoreError> {
        self.clob_limiter.acquire().await;
        let url = format!("{}/markets", self.config.gamma_base_url);
        let request = self
            .http
            .get(&url)
            .query(&[("active", "true"), ("closed", "false")]);
        let markets: Vec<GammaMarket> = self.execute_with_retry(request).await?;
        Ok(markets
            .into_iter()
            .filter(|m| m.active && !m.closed)
            .map(|m| m.id)
            .collect())
    }

    async fn execute_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, CoreError> {
        let mut backoff = Duration::from_millis(100);
        let mut last_err = None;

        for attempt in 1..=self.config.max_retries {
            let cloned = request
                .try_clone()
                .ok_or_else(|| CoreError::Protocol("request body not cloneable".into()))?;

            match cloned.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(CoreError::from);
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after_ms = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(|secs| secs * 1000)
                            .unwrap_or(10_000);
                        warn!("rate limited (429), backing off {}ms", retry_after_ms);
                        sleep(Duration::from_millis(retry_after_ms)).await;
                    } else if status.is_server_error() {
                        warn!("server error {status} on attempt {attempt}, backing off {backoff:?}");
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(16));
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(CoreError::Protocol(format!("api error {status}: {body}")));
                    }
                }
                Err(e) => {
                    debug!("request failed (attempt {attempt}): {e}");
                    last_err = Some(CoreError::from(e));
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(16));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::TransientNetwork("max retries exceeded".into())))
    }
}

fn order_to_trade(order: DomeOrder) -> Result<WhaleTrade, CoreError> {
    let price = Decimal::from_str(&order.price)
        .map_err(|e| CoreError::Protocol(format!("bad price: {e}")))?;
    let shares = Decimal::from_str(&order.shares_normalized)
        .map_err(|e| CoreError::Protocol(format!("bad size: {e}")))?;
    let side = if order.side.eq_ignore_ascii_case("sell") {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };
    Ok(WhaleTrade {
        external_id: order
            .order_hash
            .unwrap_or_else(|| format!("{}-{}", order.user, order.timestamp)),
        wallet_address: order.user,
        market_id: order.market_slug,
        token_id: order.token_id,
        side,
        price: Probability::new(price),
        size_usd: Usd::new(price * shares),
        occurred_at: Utc
            .timestamp_opt(order.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn position_to_record(position: DomePosition) -> Result<PositionRecord, CoreError> {
    let avg_price = Decimal::from_str(&position.avg_price)
        .map_err(|e| CoreError::Protocol(format!("bad price: {e}")))?;
    let shares = Decimal::from_str(&position.shares_normalized)
        .map_err(|e| CoreError::Protocol(format!("bad size: {e}")))?;
    let side = if position.side.eq_ignore_ascii_case("sell") {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };
    Ok(PositionRecord {
        wallet_address: position.user,
        market_id: position.market_slug,
        token_id: position.token_id,
        side,
        size_usd: Usd::new(avg_price * shares),
        avg_price: Probability::new(avg_price),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_up_to_capacity_without_waiting() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn order_to_trade_computes_size_usd_from_price_times_shares() {
        let order = DomeOrder {
            token_id: "t1".into(),
            side: "BUY".into(),
            price: "0.40".into(),
            shares_normalized: "250".into(),
            timestamp: 1_700_000_000,
            market_slug: "m1".into(),
            user: "0xabc".into(),
            order_hash: Some("h1".into()),
        };
        let trade = order_to_trade(order).unwrap();
        assert_eq!(trade.size_usd.inner(), Decimal::from_str("100.00").unwrap());
        assert_eq!(trade.side, TradeSide::Buy);
    }

    #[test]
    fn position_to_record_computes_size_usd_from_avg_price_times_shares() {
        let position = DomePosition {
            token_id: "t1".into(),
            market_slug: "m1".into(),
            side: "BUY".into(),
            shares_normalized: "250".into(),
            avg_price: "0.40".into(),
            user: "0xabc".into(),
        };
        let record = position_to_record(position).unwrap();
        assert_eq!(record.size_usd.inner(), Decimal::from_str("100.00").unwrap());
        assert_eq!(record.side, TradeSide::Buy);
        assert_eq!(record.wallet_address, "0xabc");
    }
}
