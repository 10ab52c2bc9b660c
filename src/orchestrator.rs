//! Scan orchestrator.
//!
//! One scan: refresh the market cache, top up orderbooks and price history,
//! fan the strategy bank out concurrently, then dedup, rank, boost and hand
//! the survivors to the paper trader. A tick that lands while a scan is
//! running is dropped, never queued.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::engine::estimator::EvidenceBundle;
use crate::engine::ProbabilityEngine;
use crate::models::{EngineEvent, MarketSnapshot, Opportunity, PricePoint, Side, Venue};
use crate::paper::learning::ThresholdBook;
use crate::paper::{ArchivedSignal, PaperTrader};
use crate::risk::KellyParams;
use crate::scrapers::book_store::BookStore;
use crate::scrapers::clob_ws::{MarketWsFeed, WS_STALE_MS};
use crate::scrapers::kalshi::KalshiClient;
use crate::scrapers::market_cache::MarketDataCache;
use crate::scrapers::news::SentimentProvider;
use crate::scrapers::odds_api::OddsClient;
use crate::scrapers::polymarket::PolymarketClient;
use crate::storage::SqliteStore;
use crate::strategies::{Strategy, StrategyCtx};
use crate::tracker::PersistenceTracker;

/// Markets carried into each scan, ranked by 24h volume.
const SCAN_UNIVERSE: usize = 40;
/// Markets that get price-history prefetch per scan.
const HISTORY_PREFETCH: usize = 20;
/// Markets that get a REST book fallback when the feed has nothing fresh.
const BOOK_FALLBACK: usize = 15;
/// Wall-clock allowance per strategy before it is dropped from the scan.
const STRATEGY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan_id: i64,
    pub markets: usize,
    pub opportunities: usize,
    pub recorded_trades: usize,
    pub duration_ms: u64,
}

pub struct Scanner {
    pub cache: Arc<MarketDataCache>,
    pub book_store: Arc<BookStore>,
    pub ws_feed: Option<Arc<MarketWsFeed>>,
    pub polymarket: Arc<PolymarketClient>,
    pub kalshi: Option<Arc<KalshiClient>>,
    pub odds: Option<Arc<OddsClient>>,
    pub news: Arc<dyn SentimentProvider>,
    pub engine: Arc<ProbabilityEngine>,
    pub strategies: Vec<Arc<dyn Strategy>>,
    pub thresholds: Arc<ThresholdBook>,
    pub trader: Arc<PaperTrader>,
    pub tracker: PersistenceTracker,
    pub storage: Arc<SqliteStore>,
    pub events: broadcast::Sender<EngineEvent>,
    pub kelly: KellyParams,
    pub top_n: usize,
    running: AtomicBool,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<MarketDataCache>,
        book_store: Arc<BookStore>,
        ws_feed: Option<Arc<MarketWsFeed>>,
        polymarket: Arc<PolymarketClient>,
        kalshi: Option<Arc<KalshiClient>>,
        odds: Option<Arc<OddsClient>>,
        news: Arc<dyn SentimentProvider>,
        engine: Arc<ProbabilityEngine>,
        strategies: Vec<Arc<dyn Strategy>>,
        thresholds: Arc<ThresholdBook>,
        trader: Arc<PaperTrader>,
        tracker: PersistenceTracker,
        storage: Arc<SqliteStore>,
        events: broadcast::Sender<EngineEvent>,
        kelly: KellyParams,
        top_n: usize,
    ) -> Self {
        Self {
            cache,
            book_store,
            ws_feed,
            polymarket,
            kalshi,
            odds,
            news,
            engine,
            strategies,
            thresholds,
            trader,
            tracker,
            storage,
            events,
            kelly,
            top_n,
            running: AtomicBool::new(false),
        }
    }

    /// One full scan cycle. Returns `None` when a scan is already running.
    pub async fn run_scan(&self) -> Result<Option<ScanReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scan tick dropped; previous scan still running");
            return Ok(None);
        }
        let result = self.scan_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn scan_inner(&self) -> Result<ScanReport> {
        let started = Instant::now();

        // 1. Fresh snapshots.
        let stats = self.cache.refresh().await?;
        for (market_id, previous, current) in &stats.price_moves {
            let _ = self.events.send(EngineEvent::PriceMove {
                market_id: market_id.clone(),
                previous: *previous,
                current: *current,
            });
        }

        let universe = self.cache.top_by_volume(SCAN_UNIVERSE);

        // 2. Books: subscribe the live feed, REST-fallback the gaps.
        if let Some(feed) = &self.ws_feed {
            for market in &universe {
                if market.venue == Venue::Polymarket {
                    feed.request_subscribe(&market.yes_token);
                    feed.request_subscribe(&market.no_token);
                }
            }
        }
        for market in universe.iter().take(BOOK_FALLBACK) {
            if self.book_store.latest(&market.yes_token, WS_STALE_MS).is_some() {
                continue;
            }
            match market.venue {
                Venue::Polymarket => match self.polymarket.orderbook(&market.yes_token).await {
                    Ok(book) => {
                        self.book_store.record(&market.yes_token, &book);
                        self.book_store.record(&market.no_token, &book.inverted());
                    }
                    Err(e) => debug!(market = %market.id, error = %e, "book fallback failed"),
                },
                Venue::Kalshi => {
                    if let Some(kalshi) = &self.kalshi {
                        match kalshi.orderbook(&market.yes_token).await {
                            Ok(book) => {
                                self.book_store.record(&market.yes_token, &book);
                                self.book_store.record(&market.no_token, &book.inverted());
                            }
                            Err(e) => debug!(market = %market.id, error = %e, "kalshi book fallback failed"),
                        }
                    }
                }
            }
        }

        // 3. Price history prefetch.
        let mut histories: HashMap<String, Arc<Vec<PricePoint>>> = HashMap::new();
        for market in universe.iter().take(HISTORY_PREFETCH) {
            let history = match market.venue {
                Venue::Polymarket => self.polymarket.price_history(&market.yes_token, 5, 40).await,
                Venue::Kalshi => match &self.kalshi {
                    Some(kalshi) => kalshi.trades(&market.yes_token, 40).await,
                    None => continue,
                },
            };
            match history {
                Ok(points) if !points.is_empty() => {
                    histories.insert(market.id.clone(), Arc::new(points));
                }
                Ok(_) => {}
                Err(e) => debug!(market = %market.id, error = %e, "history prefetch failed"),
            }
        }

        // 4. Strategy fan-out, one task per strategy, bounded by timeout.
        let bankroll = self.trader.summary().account.bankroll;
        let ctx = Arc::new(StrategyCtx {
            book_store: self.book_store.clone(),
            market_cache: self.cache.clone(),
            polymarket: self.polymarket.clone(),
            odds: self.odds.clone(),
            thresholds: self.thresholds.clone(),
            histories,
            kelly: self.kelly.clone(),
        });

        let mut join_set: JoinSet<(String, Result<Vec<Opportunity>>)> = JoinSet::new();
        for strategy in &self.strategies {
            let strategy = strategy.clone();
            let ctx = ctx.clone();
            let markets = universe.clone();
            join_set.spawn(async move {
                let name = strategy.name().to_string();
                let result = timeout(STRATEGY_TIMEOUT, strategy.evaluate(&ctx, &markets, bankroll)).await;
                match result {
                    Ok(inner) => (name, inner),
                    Err(_) => (name, Err(anyhow::anyhow!("strategy timed out"))),
                }
            });
        }

        let mut opportunities: Vec<Opportunity> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(mut found))) => {
                    debug!(strategy = %name, count = found.len(), "strategy complete");
                    opportunities.append(&mut found);
                }
                Ok((name, Err(e))) => warn!(strategy = %name, error = %e, "strategy omitted from scan"),
                Err(e) => warn!(error = %e, "strategy task panicked; omitted"),
            }
        }

        // 5. Dedup per (market, strategy), keep the best-scored instance.
        let mut best: HashMap<String, Opportunity> = HashMap::new();
        for opp in opportunities {
            match best.get(&opp.rank_key()) {
                Some(existing) if existing.score >= opp.score => {}
                _ => {
                    best.insert(opp.rank_key(), opp);
                }
            }
        }
        let mut ranked: Vec<Opportunity> = best.into_values().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        // 6. Persistence boosts, then re-rank on the boosted scores.
        let tags = self.tracker.apply(&mut ranked);
        if !tags.is_empty() {
            debug!(boosted = tags.len(), "persistence boosts applied");
        }
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        // 7. Posterior audit trail for the markets the paper trader will see.
        let top: Vec<Opportunity> = ranked.iter().take(self.top_n).cloned().collect();
        let mut snapshots: HashMap<String, Arc<MarketSnapshot>> = HashMap::new();
        let mut archived: HashMap<String, Vec<ArchivedSignal>> = HashMap::new();
        for opp in &top {
            let _ = self.events.send(EngineEvent::EdgeDetected {
                market_id: opp.market_id.clone(),
                strategy: opp.strategy.clone(),
                side: opp.side,
                score: opp.score,
                net_ev: opp.net_ev,
            });
            let Some(snapshot) = self.cache.by_id(&opp.market_id) else {
                continue;
            };
            if !archived.contains_key(&opp.market_id) {
                let clean = self.book_store.clean_book(&snapshot.yes_token, WS_STALE_MS);
                let news = match self.news.sentiment_for(&snapshot.question).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(market = %opp.market_id, error = %e, "sentiment lookup failed");
                        None
                    }
                };
                let consensus = self
                    .odds
                    .as_ref()
                    .and_then(|odds| odds.consensus_for_question(&snapshot.question));
                let history = ctx.history(&opp.market_id).map(|h| h.to_vec()).unwrap_or_default();
                let estimate = self.engine.estimate(
                    &snapshot,
                    &EvidenceBundle {
                        clean_book: clean.as_ref().map(|(book, _)| book),
                        history: &history,
                        news: news.as_ref(),
                        consensus: consensus.as_ref(),
                    },
                );
                let signals: Vec<ArchivedSignal> = estimate
                    .contributions
                    .iter()
                    .map(|c| ArchivedSignal {
                        name: c.name.clone(),
                        raw_llr: c.raw_llr,
                        direction: if c.raw_llr >= 0.0 { Side::Yes } else { Side::No },
                    })
                    .collect();
                archived.insert(opp.market_id.clone(), signals);
            }
            snapshots.insert(opp.market_id.clone(), snapshot);
        }

        // 8. Hand off to the paper trader (which mirrors trades into the
        //    store itself) and persist the scan.
        let recorded = self.trader.record_scan_results(&top, &snapshots, &archived);

        let duration_ms = started.elapsed().as_millis() as u64;
        let scan_id = self
            .storage
            .insert_scan(stats.count, ranked.len(), recorded.len(), duration_ms)
            .unwrap_or(-1);
        if let Err(e) = self.storage.insert_edges(scan_id, &top) {
            warn!(error = %e, "edge persist failed");
        }

        let report = ScanReport {
            scan_id,
            markets: stats.count,
            opportunities: ranked.len(),
            recorded_trades: recorded.len(),
            duration_ms,
        };
        let _ = self.events.send(EngineEvent::ScanComplete {
            scan_id,
            markets: report.markets,
            opportunities: report.opportunities,
            duration_ms,
        });
        info!(
            scan_id,
            markets = report.markets,
            opportunities = report.opportunities,
            recorded = report.recorded_trades,
            duration_ms,
            "scan complete"
        );
        Ok(report)
    }
}

/// Long-running scan loop on a fixed period.
pub async fn run_scan_loop(scanner: Arc<Scanner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if let Err(e) = scanner.run_scan().await {
            warn!(error = %e, "scan failed; retrying next period");
        }
    }
}
