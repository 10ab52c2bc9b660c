//! End-to-end exercise of the signal-to-trade loop without venue I/O:
//! installed snapshots drive the strategy bank, recorded trades resolve
//! against a fake venue, and the resolutions feed calibration and the
//! learned thresholds.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use edgebot_backend::engine::CalibrationStore;
use edgebot_backend::models::{MarketSnapshot, Side, Venue};
use edgebot_backend::paper::learning::ThresholdBook;
use edgebot_backend::paper::resolver::{resolve_batch, MarketState, MarketStateSource};
use edgebot_backend::paper::{ArchivedSignal, PaperTrader};
use edgebot_backend::risk::KellyParams;
use edgebot_backend::scrapers::book_store::BookStore;
use edgebot_backend::scrapers::market_cache::MarketDataCache;
use edgebot_backend::scrapers::polymarket::PolymarketClient;
use edgebot_backend::strategies::{self, StrategyCtx};

fn snapshot(id: &str, yes: f64, no: f64) -> MarketSnapshot {
    MarketSnapshot {
        id: id.to_string(),
        question: format!("Will outcome {id} happen?"),
        venue: Venue::Polymarket,
        yes_price: yes,
        no_price: no,
        yes_token: format!("{id}-yes"),
        no_token: format!("{id}-no"),
        volume_24h: 12_000.0,
        liquidity: 60_000.0,
        spread: 0.01,
        group_slug: None,
        neg_risk: false,
        end_date: None,
        resolution: None,
        fetched_at: Utc::now(),
    }
}

struct ScriptedVenue {
    outcomes: Mutex<HashMap<String, MarketState>>,
}

#[async_trait]
impl MarketStateSource for ScriptedVenue {
    async fn market_state(&self, market_id: &str) -> Result<Option<MarketState>> {
        Ok(self.outcomes.lock().get(market_id).cloned())
    }
}

#[tokio::test]
async fn scan_record_resolve_learn_round_trip() {
    let (events, _rx) = broadcast::channel(256);
    let calibration = Arc::new(CalibrationStore::new(None));
    let thresholds = Arc::new(ThresholdBook::new(None));
    let trader = PaperTrader::new(
        1_000.0,
        calibration.clone(),
        thresholds.clone(),
        events,
        None,
    );

    // A market with a complement gap wide enough for the arbitrage strategy.
    let cache = Arc::new(MarketDataCache::new(Arc::new(PolymarketClient::new()), None));
    cache.install(vec![snapshot("m1", 0.47, 0.49), snapshot("m2", 0.60, 0.40)], 0);

    let ctx = StrategyCtx {
        book_store: Arc::new(BookStore::new()),
        market_cache: cache.clone(),
        polymarket: Arc::new(PolymarketClient::new()),
        odds: None,
        thresholds: thresholds.clone(),
        histories: HashMap::new(),
        kelly: KellyParams::default(),
    };

    let markets = cache.all();
    let mut opportunities = Vec::new();
    for strategy in strategies::default_bank() {
        opportunities.extend(strategy.evaluate(&ctx, &markets, 1_000.0).await.unwrap());
    }
    assert!(
        !opportunities.is_empty(),
        "the 4-cent complement gap should surface an opportunity"
    );

    // Record the scan with an archived evidence signal for m1.
    let snapshots: HashMap<String, Arc<MarketSnapshot>> =
        markets.iter().map(|m| (m.id.clone(), m.clone())).collect();
    let mut archived = HashMap::new();
    archived.insert(
        "m1".to_string(),
        vec![ArchivedSignal {
            name: "orderbook_imbalance".to_string(),
            raw_llr: 0.18,
            direction: Side::Yes,
        }],
    );
    let recorded = trader.record_scan_results(&opportunities, &snapshots, &archived);
    assert!(!recorded.is_empty());

    // The venue resolves m1 YES; the resolver closes the trades.
    let venue = ScriptedVenue {
        outcomes: Mutex::new(HashMap::from([(
            "m1".to_string(),
            MarketState {
                resolution: Some("YES".to_string()),
                yes_price: Some(0.99),
            },
        )])),
    };
    let closed = resolve_batch(&trader, &venue).await;
    assert!(closed >= 1);

    let summary = trader.summary();
    assert_eq!(summary.resolved_trades, closed);
    assert!(summary.account.bankroll != 1_000.0);

    // The resolution reached the calibration store, signal scoring included.
    let view = calibration.view();
    assert_eq!(view.total_resolutions, 1);
    let perf = view
        .signals
        .get("orderbook_imbalance")
        .expect("signal outcome recorded");
    assert_eq!(perf.total, 1);
    assert_eq!(perf.correct, 1);
}
