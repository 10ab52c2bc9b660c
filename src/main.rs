//! Edgebot - autonomous trading intelligence for prediction markets.
//!
//! Long-running service: a periodic scan drives the strategy bank over a
//! fresh market snapshot, a resolution task closes paper trades against
//! ground truth, and a WebSocket task keeps orderbooks warm. Consumers
//! (HTTP/SSE surface, dashboard) attach to the broadcast status channel.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use edgebot_backend::engine::{CalibrationStore, ProbabilityEngine};
use edgebot_backend::models::{Config, EngineEvent};
use edgebot_backend::orchestrator::{run_scan_loop, Scanner};
use edgebot_backend::paper::learning::ThresholdBook;
use edgebot_backend::paper::resolver::run_resolution_loop;
use edgebot_backend::paper::PaperTrader;
use edgebot_backend::risk::KellyParams;
use edgebot_backend::scrapers::book_store::BookStore;
use edgebot_backend::scrapers::clob_ws::MarketWsFeed;
use edgebot_backend::scrapers::kalshi::KalshiClient;
use edgebot_backend::scrapers::market_cache::MarketDataCache;
use edgebot_backend::scrapers::news::{NewsApiClient, NullSentimentProvider, SentimentProvider};
use edgebot_backend::scrapers::odds_api::OddsClient;
use edgebot_backend::scrapers::polymarket::PolymarketClient;
use edgebot_backend::storage::SqliteStore;
use edgebot_backend::strategies;
use edgebot_backend::tracker::PersistenceTracker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edgebot_backend=debug".into()),
        )
        .init();

    let config = Config::from_env().context("configuration rejected")?;
    info!(
        scan_interval = config.scan_interval_secs,
        bankroll = config.starting_bankroll,
        "starting edgebot"
    );

    let data_dir = PathBuf::from(&config.data_dir);
    let (events, _keepalive_rx) = broadcast::channel::<EngineEvent>(1024);

    // Storage degrades to in-memory rather than refusing to start.
    let storage = Arc::new(SqliteStore::open_or_memory(&config.database_path));
    if !storage.durable {
        let _ = events.send(EngineEvent::StatusUpdate {
            component: "storage".to_string(),
            status: "degraded: in-memory only".to_string(),
        });
    }

    // Venue clients and stores.
    let polymarket = Arc::new(PolymarketClient::new());
    let kalshi = config.kalshi_enabled.then(|| Arc::new(KalshiClient::new()));
    let cache = Arc::new(MarketDataCache::new(polymarket.clone(), kalshi.clone()));
    let book_store = Arc::new(BookStore::new());
    let ws_feed = MarketWsFeed::spawn(book_store.clone());

    let odds = config
        .odds_api_key
        .as_ref()
        .map(|key| Arc::new(OddsClient::new(key.clone(), data_dir.join("odds-cache.json"))));
    if odds.is_none() {
        info!("no odds api key; cross-venue value and parlays run without bookmaker data");
    }
    let news: Arc<dyn SentimentProvider> = match &config.news_api_key {
        Some(key) => Arc::new(NewsApiClient::new(key.clone())),
        None => Arc::new(NullSentimentProvider),
    };

    // Learning state and probability engine.
    let calibration = Arc::new(CalibrationStore::new(Some(data_dir.join("calibration.json"))));
    let thresholds = Arc::new(ThresholdBook::new(Some(data_dir.join("learning-state.json"))));
    let engine = Arc::new(ProbabilityEngine::new(calibration.clone()));

    let trader = Arc::new(PaperTrader::with_storage(
        config.starting_bankroll,
        calibration.clone(),
        thresholds.clone(),
        events.clone(),
        Some(data_dir.join("paper-trades.json")),
        Some(storage.clone()),
    ));

    // One-time import of any legacy JSON state into SQLite.
    match storage.migrate_json(
        &data_dir.join("paper-trades.json"),
        &data_dir.join("calibration.json"),
    ) {
        Ok(report) if report.trades > 0 || report.calibration_buckets > 0 => {
            info!(?report, "legacy json state imported");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "json migration failed; continuing"),
    }

    let kelly = KellyParams {
        bankroll: config.starting_bankroll,
        kelly_fraction: config.kelly_fraction,
        max_exposure_pct: config.max_exposure_pct,
    };

    let scanner = Arc::new(Scanner::new(
        cache,
        book_store,
        Some(ws_feed),
        polymarket.clone(),
        kalshi,
        odds.clone(),
        news,
        engine,
        strategies::default_bank(),
        thresholds,
        trader.clone(),
        PersistenceTracker::with_path(data_dir.join("signal-persistence.json")),
        storage,
        events.clone(),
        kelly,
        config.top_n_per_scan,
    ));

    // Periodic tasks.
    let scan_handle = tokio::spawn(run_scan_loop(
        scanner.clone(),
        Duration::from_secs(config.scan_interval_secs),
    ));
    let resolution_handle = tokio::spawn(run_resolution_loop(
        trader.clone(),
        polymarket,
        Duration::from_secs(config.resolution_interval_secs),
    ));

    // Bookmaker odds refresh on its own slower cadence.
    let odds_handle = odds.map(|client| {
        let events = events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(900));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for sport in ["basketball_nba", "americanfootball_nfl", "soccer_epl", "icehockey_nhl"] {
                    if let Err(e) = client.fetch_odds(sport).await {
                        warn!(sport, error = %e, "odds refresh failed");
                    }
                }
                let quota = client.quota();
                let _ = events.send(EngineEvent::StatusUpdate {
                    component: "odds".to_string(),
                    status: format!(
                        "quota remaining: {}",
                        quota.remaining.map_or("unknown".to_string(), |r| r.to_string())
                    ),
                });
            }
        })
    });

    let _ = events.send(EngineEvent::StatusUpdate {
        component: "engine".to_string(),
        status: "running".to_string(),
    });

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown requested; stopping tasks");

    scan_handle.abort();
    resolution_handle.abort();
    if let Some(handle) = odds_handle {
        handle.abort();
    }

    // State files are flushed on every mutation; log the final account so
    // the operator sees where the session ended.
    let summary = trader.summary();
    info!(
        bankroll = summary.account.bankroll,
        open = summary.open_trades,
        resolved = summary.resolved_trades,
        "edgebot stopped"
    );
    Ok(())
}
