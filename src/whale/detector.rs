//! Discovery → Qualification → Ranking state machine.
//!
//! The in-memory `known_whales` cache sits over the durable store (see
//! `store::Store`'s doc comment), but every transition is persisted through
//! `WhaleTracker::persist` *before* the cache is updated, so a crash can
//! never leave the cache ahead of the store.

use crate::config::{QualificationConfig, RankingConfig};
use crate::error::CoreError;
use crate::models::{Whale, WhaleStatus};
use crate::store::Store;
use crate::whale::tracker::WhaleTracker;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhaleEventKind {
    Discovered,
    Qualified,
    Ranked,
    Demoted,
    Inactive,
}

#[derive(Debug, Clone)]
pub struct WhaleEvent {
    pub kind: WhaleEventKind,
    pub whale: Whale,
}

#[derive(Debug, Clone, Default)]
pub struct BlockerReport {
    pub counts: HashMap<String, u32>,
}

struct Cache {
    known_whales: HashMap<String, Whale>,
    top_whales: Vec<Whale>,
}

pub struct WhaleDetector {
    tracker: Arc<WhaleTracker>,
    store: Arc<Store>,
    qualification: QualificationConfig,
    ranking: RankingConfig,
    cache: RwLock<Cache>,
    events: broadcast::Sender<WhaleEvent>,
}

impl WhaleDetector {
    /// Primes the cache from `Store::load_known_whales` before the detector
    /// is usable — nothing is served from the cache until this call returns.
    pub async fn new(
        tracker: Arc<WhaleTracker>,
        store: Arc<Store>,
        qualification: QualificationConfig,
        ranking: RankingConfig,
    ) -> Result<Self, CoreError> {
        let known_whales = store.load_known_whales().await?;
        let top_whales = store.load_top_whales(ranking.top_n).await?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            tracker,
            store,
            qualification,
            ranking,
            cache: RwLock::new(Cache {
                known_whales,
                top_whales,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WhaleEvent> {
        self.events.subscribe()
    }

    /// First observation of an address (e.g. attributed from a market
    /// trade or a discovery feed). A no-op if the address is already known
    /// — subsequent trades update counters via `poll_once`, not this call.
    pub async fn observe_address(&self, address: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        {
            let cache = self.cache.read().await;
            if cache.known_whales.contains_key(address) {
                return Ok(());
            }
        }
        let whale = Whale::new(address.to_string(), now);
        self.tracker.persist(&whale).await?;
        let mut cache = self.cache.write().await;
        cache.known_whales.insert(address.to_string(), whale.clone());
        drop(cache);
        let _ = self.events.send(WhaleEvent {
            kind: WhaleEventKind::Discovered,
            whale,
        });
        Ok(())
    }

    /// One polling cycle: refresh every known address's stats, re-evaluate
    /// status transitions, persist before updating the cache, then
    /// recompute the composite ranking over the qualified cohort.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<BlockerReport, CoreError> {
        let addresses: Vec<String> = {
            let cache = self.cache.read().await;
            cache.known_whales.keys().cloned().collect()
        };

        let mut report = BlockerReport::default();
        let mut refreshed = Vec::with_capacity(addresses.len());

        for address in &addresses {
            let existing = {
                let cache = self.cache.read().await;
                cache.known_whales.get(address).cloned()
            };
            let was_active = existing.as_ref().map(|w| w.is_active).unwrap_or(true);
            let mut whale = self.tracker.refresh(address, existing.as_ref(), now).await?;
            let (qualifies, blockers) = self.tracker.is_qualifying_whale(&whale, now);
            for b in &blockers {
                *report.counts.entry(b.clone()).or_insert(0) += 1;
            }

            let previous_status = whale.status;
            let next_status = if qualifies {
                match previous_status {
                    WhaleStatus::Rejected => WhaleStatus::Rejected,
                    _ => WhaleStatus::Qualified,
                }
            } else {
                match previous_status {
                    WhaleStatus::Qualified | WhaleStatus::Ranked => WhaleStatus::Discovered,
                    WhaleStatus::Discovered if !whale.is_active => WhaleStatus::Rejected,
                    other => other,
                }
            };

            let event_kind = match (previous_status, next_status) {
                (WhaleStatus::Discovered, WhaleStatus::Qualified) => Some(WhaleEventKind::Qualified),
                (WhaleStatus::Qualified, WhaleStatus::Discovered)
                | (WhaleStatus::Ranked, WhaleStatus::Discovered) => Some(WhaleEventKind::Demoted),
                _ => None,
            };

            whale.status = next_status;
            if qualifies {
                whale.last_qualified_at = Some(now);
            }

            self.tracker.persist(&whale).await?;
            {
                let mut cache = self.cache.write().await;
                cache.known_whales.insert(address.clone(), whale.clone());
            }
            if let Some(kind) = event_kind {
                let _ = self.events.send(WhaleEvent { kind, whale: whale.clone() });
            }
            if was_active && !whale.is_active {
                let _ = self.events.send(WhaleEvent {
                    kind: WhaleEventKind::Inactive,
                    whale: whale.clone(),
                });
            }
            refreshed.push(whale);
        }

        self.rerank(&refreshed, now).await?;
        Ok(report)
    }

    /// Composite `rank_score` over the qualified cohort, min-max
    /// normalized; the top `ranking.top_n` are promoted to `ranked`.
    pub(crate) async fn rerank(&self, refreshed: &[Whale], now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut cohort: Vec<Whale> = refreshed
            .iter()
            .filter(|w| matches!(w.status, WhaleStatus::Qualified | WhaleStatus::Ranked))
            .cloned()
            .collect();
        if cohort.is_empty() {
            let mut cache = self.cache.write().await;
            cache.top_whales.clear();
            return Ok(());
        }

        let volumes: Vec<Decimal> = cohort.iter().map(|w| w.total_volume_usd.inner()).collect();
        let recencies: Vec<Decimal> = cohort
            .iter()
            .map(|w| {
                let days_since = Decimal::from((now - w.last_seen_at).num_days().max(0));
                Decimal::ONE / (Decimal::ONE + days_since)
            })
            .collect();
        let freqs: Vec<Decimal> = cohort.iter().map(|w| Decimal::from(w.trades_last_72h)).collect();

        let vol_range = min_max(&volumes);
        let rec_range = min_max(&recencies);
        let freq_range = min_max(&freqs);

        for (i, whale) in cohort.iter_mut().enumerate() {
            let norm_vol = normalize(volumes[i], vol_range);
            let norm_rec = normalize(recencies[i], rec_range);
            let norm_freq = normalize(freqs[i], freq_range);
            let risk_component = whale.risk_score / Decimal::from(10);
            let score = self.ranking.weight_volume * norm_vol
                + self.ranking.weight_recency * norm_rec
                + self.ranking.weight_frequency * norm_freq
                - self.ranking.weight_risk * risk_component;
            whale.rank_score = Some(score);
        }

        cohort.sort_by(|a, b| {
            b.rank_score
                .unwrap_or_default()
                .cmp(&a.rank_score.unwrap_or_default())
                .then_with(|| a.risk_score.cmp(&b.risk_score))
                .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
        });

        let mut cache = self.cache.write().await;
        for (i, whale) in cohort.iter_mut().enumerate() {
            let was_ranked = whale.status == WhaleStatus::Ranked;
            whale.status = if i < self.ranking.top_n {
                WhaleStatus::Ranked
            } else {
                WhaleStatus::Qualified
            };
            self.store.upsert_whale(whale).await?;
            cache.known_whales.insert(whale.wallet_address.clone(), whale.clone());
            if whale.status == WhaleStatus::Ranked && !was_ranked {
                let _ = self.events.send(WhaleEvent {
                    kind: WhaleEventKind::Ranked,
                    whale: whale.clone(),
                });
            }
        }
        cache.top_whales = cohort.into_iter().take(self.ranking.top_n).collect();
        info!(count = cache.top_whales.len(), "recomputed top whales");
        Ok(())
    }

    /// Refreshed at most once per polling cycle: reads the cache populated
    /// by the last `poll_once`, never recomputes inline.
    pub async fn top_whales(&self, n: usize) -> Vec<Whale> {
        let cache = self.cache.read().await;
        cache.top_whales.iter().take(n).cloned().collect()
    }

    pub async fn get(&self, address: &str) -> Option<Whale> {
        self.cache.read().await.known_whales.get(address).cloned()
    }
}

fn min_max(values: &[Decimal]) -> (Decimal, Decimal) {
    let min = values.iter().copied().fold(values[0], |a, b| a.min(b));
    let max = values.iter().copied().fold(values[0], |a, b| a.max(b));
    (min, max)
}

fn normalize(value: Decimal, (min, max): (Decimal, Decimal)) -> Decimal {
    if max == min {
        Decimal::ONE
    } else {
        (value - min) / (max - min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_client::DataClient;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn detector() -> (WhaleDetector, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let data_client = Arc::new(DataClient::new(crate::config::DataApiConfig::default()).unwrap());
        let tracker = Arc::new(WhaleTracker::new(
            data_client,
            store.clone(),
            QualificationConfig::default(),
        ));
        let detector = WhaleDetector::new(
            tracker,
            store.clone(),
            QualificationConfig::default(),
            RankingConfig::default(),
        )
        .await
        .unwrap();
        (detector, store)
    }

    #[tokio::test]
    async fn observing_a_new_address_emits_discovered_and_is_idempotent() {
        let (detector, _store) = detector().await;
        let mut rx = detector.subscribe();
        detector.observe_address("0xaaaa", now()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, WhaleEventKind::Discovered);

        detector.observe_address("0xaaaa", now()).await.unwrap();
        assert!(detector.get("0xaaaa").await.is_some());
    }

    #[tokio::test]
    async fn rerank_promotes_top_n_qualified_whales_to_ranked() {
        let (detector, _store) = detector().await;
        let mut a = Whale::new("0xaaaa".into(), now());
        a.status = WhaleStatus::Qualified;
        a.total_volume_usd = Usd::new(dec!(10_000));
        a.trades_last_72h = 5;
        a.last_seen_at = now();
        a.risk_score = dec!(2);

        let mut b = Whale::new("0xbbbb".into(), now());
        b.status = WhaleStatus::Qualified;
        b.total_volume_usd = Usd::new(dec!(500));
        b.trades_last_72h = 3;
        b.last_seen_at = now();
        b.risk_score = dec!(8);

        detector.rerank(&[a.clone(), b.clone()], now()).await.unwrap();
        let top = detector.top_whales(10).await;
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].wallet_address, "0xaaaa");
        assert!(detector.get("0xaaaa").await.unwrap().status == WhaleStatus::Ranked);
    }

    #[tokio::test]
    async fn rerank_with_empty_cohort_clears_top_whales() {
        let (detector, _store) = detector().await;
        detector.rerank(&[], now()).await.unwrap();
        assert!(detector.top_whales(10).await.is_empty());
    }

    use crate::money::Usd;

    #[test]
    fn normalize_handles_degenerate_range() {
        assert_eq!(normalize(dec!(5), (dec!(5), dec!(5))), Decimal::ONE);
        assert_eq!(normalize(dec!(5), (dec!(0), dec!(10))), dec!(0.5));
    }
}
