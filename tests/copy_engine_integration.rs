//! End-to-end exercise of the whale-signal -> sizing -> risk gate ->
//! executor -> bankroll/store pipeline, wired the same way `Supervisor`
//! wires it but without any network or websocket dependency.

use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use whalecopy_core::bankroll::VirtualBankroll;
use whalecopy_core::config::{
    QualificationConfig, RankingConfig, RiskConfig, RunMode, SizingConfig, SupervisorConfig,
};
use whalecopy_core::copy_engine::CopyEngine;
use whalecopy_core::executor::PaperExecutor;
use whalecopy_core::models::{SignalClassification, TradeSide, WhaleSignal, WhaleStatus};
use whalecopy_core::money::{Probability, Usd};
use whalecopy_core::store::Store;
use whalecopy_core::whale::WhaleTracker;

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn signal(wallet: &str, price: &str, size: &str, at: DateTime<Utc>) -> WhaleSignal {
    WhaleSignal {
        signal_id: uuid::Uuid::new_v4().to_string(),
        wallet_address: wallet.to_string(),
        market_id: "market-1".to_string(),
        token_id: "token-1".to_string(),
        side: TradeSide::Buy,
        price: Probability::new(price.parse().unwrap()),
        size_usd: Usd::new(size.parse().unwrap()),
        classification: SignalClassification::Open,
        detected_at: at,
    }
}

#[tokio::test]
async fn a_ranked_whale_trade_opens_a_sized_paper_position_and_persists_it() {
    let store = Arc::new(Store::open_in_memory().unwrap());

    // Seed a ranked whale directly: the discovery/qualification pipeline is
    // exercised separately in whale::detector's own tests.
    let mut whale = whalecopy_core::models::Whale::new("0xwhale".to_string(), now());
    whale.status = WhaleStatus::Ranked;
    whale.rank_score = Some(dec!(0.8));
    whale.risk_score = dec!(2);
    store.upsert_whale(&whale).await.unwrap();

    let tracker = Arc::new(WhaleTracker::new(
        Arc::new(whalecopy_core::data_client::DataClient::new(Default::default()).unwrap()),
        store.clone(),
        QualificationConfig::default(),
    ));
    let detector = Arc::new(
        whalecopy_core::whale::WhaleDetector::new(
            tracker,
            store.clone(),
            QualificationConfig::default(),
            RankingConfig::default(),
        )
        .await
        .unwrap(),
    );

    let mut supervisor_cfg = SupervisorConfig::default();
    supervisor_cfg.initial_bankroll_usd = dec!(1000);
    let bankroll = Arc::new(VirtualBankroll::new(&supervisor_cfg, store.clone()));
    let executor = Arc::new(PaperExecutor::new(bankroll.clone(), dec!(0.02)));

    let copy_engine = Arc::new(CopyEngine::new(
        detector,
        RiskConfig::default(),
        SizingConfig::default(),
        executor,
        store.clone(),
        Usd::new(dec!(1000)),
        bankroll.clone(),
        RunMode::Paper,
    ));

    copy_engine
        .on_whale_trade(signal("0xwhale", "0.40", "500", now()), now())
        .await
        .unwrap();

    let stats = bankroll.stats().await;
    assert_eq!(stats.total_trades, 1);
    assert!(stats.allocated > Usd::ZERO);

    let open = store.all_open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].wallet_address, "0xwhale");
}

#[tokio::test]
async fn an_unranked_whale_trade_is_ignored_and_opens_nothing() {
    let store = Arc::new(Store::open_in_memory().unwrap());

    let mut whale = whalecopy_core::models::Whale::new("0xnewcomer".to_string(), now());
    whale.status = WhaleStatus::Discovered;
    store.upsert_whale(&whale).await.unwrap();

    let tracker = Arc::new(WhaleTracker::new(
        Arc::new(whalecopy_core::data_client::DataClient::new(Default::default()).unwrap()),
        store.clone(),
        QualificationConfig::default(),
    ));
    let detector = Arc::new(
        whalecopy_core::whale::WhaleDetector::new(
            tracker,
            store.clone(),
            QualificationConfig::default(),
            RankingConfig::default(),
        )
        .await
        .unwrap(),
    );

    let mut supervisor_cfg = SupervisorConfig::default();
    supervisor_cfg.initial_bankroll_usd = dec!(1000);
    let bankroll = Arc::new(VirtualBankroll::new(&supervisor_cfg, store.clone()));
    let executor = Arc::new(PaperExecutor::new(bankroll.clone(), dec!(0.02)));

    let copy_engine = Arc::new(CopyEngine::new(
        detector,
        RiskConfig::default(),
        SizingConfig::default(),
        executor,
        store.clone(),
        Usd::new(dec!(1000)),
        bankroll.clone(),
        RunMode::Paper,
    ));

    copy_engine
        .on_whale_trade(signal("0xnewcomer", "0.40", "500", now()), now())
        .await
        .unwrap();

    let open = store.all_open_positions().await.unwrap();
    assert!(open.is_empty());
    assert_eq!(bankroll.stats().await.total_trades, 0);
}
