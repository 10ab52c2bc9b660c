//! Market-data cache: one normalised snapshot set per scan.
//!
//! The refresh task is the only writer; readers grab the current snapshot
//! vector through an `ArcSwap` pointer load, so strategy fan-out never
//! contends with a refresh in flight.

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{MarketSnapshot, Venue};
use crate::scrapers::kalshi::{self, KalshiClient};
use crate::scrapers::polymarket::{self, PolymarketClient};

/// Snapshots older than this are not trusted for trading decisions.
pub const STALE_THRESHOLD_MS: i64 = 120_000;

/// A cache-relative price move worth broadcasting.
const PRICE_MOVE_THRESHOLD: f64 = 0.02;

const POLYMARKET_FETCH_LIMIT: usize = 250;
const KALSHI_FETCH_LIMIT: usize = 200;

#[derive(Default)]
struct CacheState {
    all: Vec<Arc<MarketSnapshot>>,
    by_id: HashMap<String, Arc<MarketSnapshot>>,
}

/// Result of one refresh pass.
#[derive(Debug, Default)]
pub struct RefreshStats {
    pub count: usize,
    pub dropped: usize,
    /// Markets whose yes price moved at least 2 cents since last refresh.
    pub price_moves: Vec<(String, f64, f64)>,
}

pub struct MarketDataCache {
    polymarket: Arc<PolymarketClient>,
    kalshi: Option<Arc<KalshiClient>>,
    state: ArcSwap<CacheState>,
}

impl MarketDataCache {
    pub fn new(polymarket: Arc<PolymarketClient>, kalshi: Option<Arc<KalshiClient>>) -> Self {
        Self {
            polymarket,
            kalshi,
            state: ArcSwap::from_pointee(CacheState::default()),
        }
    }

    /// Fetch fresh markets from the venue clients, normalise and swap the
    /// snapshot set. Per-market normalisation failures drop silently.
    pub async fn refresh(&self) -> Result<RefreshStats> {
        let mut snapshots: Vec<MarketSnapshot> = Vec::with_capacity(POLYMARKET_FETCH_LIMIT);
        let mut dropped = 0usize;

        match self.polymarket.list_markets(POLYMARKET_FETCH_LIMIT, 0).await {
            Ok(markets) => {
                for market in &markets {
                    match polymarket::normalize_market(market) {
                        Some(snap) => snapshots.push(snap),
                        None => dropped += 1,
                    }
                }
            }
            Err(e) => warn!(error = %e, "polymarket refresh failed; keeping previous snapshots"),
        }

        if let Some(kalshi_client) = &self.kalshi {
            match kalshi_client.list_markets(KALSHI_FETCH_LIMIT).await {
                Ok(markets) => {
                    for market in &markets {
                        match kalshi::normalize_market(market) {
                            Some(snap) => snapshots.push(snap),
                            None => dropped += 1,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "kalshi refresh failed; continuing with polymarket only"),
            }
        }

        if snapshots.is_empty() {
            debug!("refresh produced no snapshots; previous set retained");
            return Ok(RefreshStats::default());
        }

        let stats = self.install(snapshots, dropped);
        info!(
            markets = stats.count,
            dropped = stats.dropped,
            moves = stats.price_moves.len(),
            "market cache refreshed"
        );
        Ok(stats)
    }

    /// Swap in a fully-normalised snapshot set. Exposed so tests and replay
    /// feeds can seed the cache without venue I/O.
    pub fn install(&self, snapshots: Vec<MarketSnapshot>, dropped: usize) -> RefreshStats {
        let previous = self.state.load();
        let mut price_moves = Vec::new();

        let all: Vec<Arc<MarketSnapshot>> = snapshots.into_iter().map(Arc::new).collect();
        let mut by_id = HashMap::with_capacity(all.len());
        for snap in &all {
            if let Some(old) = previous.by_id.get(&snap.id) {
                let delta = (snap.yes_price - old.yes_price).abs();
                if delta >= PRICE_MOVE_THRESHOLD {
                    price_moves.push((snap.id.clone(), old.yes_price, snap.yes_price));
                }
            }
            by_id.insert(snap.id.clone(), snap.clone());
        }

        let count = all.len();
        self.state.store(Arc::new(CacheState { all, by_id }));
        RefreshStats {
            count,
            dropped,
            price_moves,
        }
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<MarketSnapshot>> {
        self.state.load().by_id.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<MarketSnapshot>> {
        self.state.load().all.clone()
    }

    pub fn venue_markets(&self, venue: Venue) -> Vec<Arc<MarketSnapshot>> {
        self.state
            .load()
            .all
            .iter()
            .filter(|s| s.venue == venue)
            .cloned()
            .collect()
    }

    pub fn top_by_volume(&self, n: usize) -> Vec<Arc<MarketSnapshot>> {
        let mut markets = self.all();
        markets.sort_by(|a, b| {
            b.volume_24h
                .partial_cmp(&a.volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        markets.truncate(n);
        markets
    }

    pub fn top_by_liquidity(&self, n: usize) -> Vec<Arc<MarketSnapshot>> {
        let mut markets = self.all();
        markets.sort_by(|a, b| {
            b.liquidity
                .partial_cmp(&a.liquidity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        markets.truncate(n);
        markets
    }

    pub fn len(&self) -> usize {
        self.state.load().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a snapshot has aged past the trust window.
pub fn is_stale(snapshot: &MarketSnapshot) -> bool {
    Utc::now().timestamp_millis() - snapshot.fetched_at.timestamp_millis() > STALE_THRESHOLD_MS
}
