//! Auto-resolution of open paper trades against venue ground truth.
//!
//! A periodic task batches open markets, asks the venue for current state
//! and closes trades once the venue either reports an explicit resolution
//! or the mid price has pinned to an extreme. A rate-limited venue halts
//! the batch; the remainder waits for the next period.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::models::{EngineError, Side};
use crate::paper::PaperTrader;
use crate::scrapers::polymarket::{self, PolymarketClient};

/// Open markets checked per resolution pass.
pub const RESOLUTION_BATCH: usize = 15;
/// Mid price at or beyond which a market counts as decided.
const PRICE_DECIDED_HIGH: f64 = 0.95;
const PRICE_DECIDED_LOW: f64 = 0.05;

/// Current venue view of one market, as the resolver needs it.
#[derive(Debug, Clone, Default)]
pub struct MarketState {
    /// Upper-cased explicit resolution when the venue has one.
    pub resolution: Option<String>,
    pub yes_price: Option<f64>,
}

/// Narrow venue capability used by the resolver; mocked in tests.
#[async_trait]
pub trait MarketStateSource: Send + Sync {
    async fn market_state(&self, market_id: &str) -> Result<Option<MarketState>>;
}

#[async_trait]
impl MarketStateSource for PolymarketClient {
    async fn market_state(&self, market_id: &str) -> Result<Option<MarketState>> {
        let Some(market) = self.market_by_id(market_id).await? else {
            return Ok(None);
        };
        let snapshot = polymarket::normalize_market(&market);
        Ok(Some(MarketState {
            resolution: snapshot.as_ref().and_then(|s| s.resolution.clone()),
            yes_price: snapshot.map(|s| s.yes_price),
        }))
    }
}

/// Ground-truth outcome, if the market state is decisive.
pub fn outcome_from_state(state: &MarketState) -> Option<Side> {
    match state.resolution.as_deref() {
        Some("YES") => return Some(Side::Yes),
        Some("NO") => return Some(Side::No),
        _ => {}
    }
    match state.yes_price {
        Some(p) if p >= PRICE_DECIDED_HIGH => Some(Side::Yes),
        Some(p) if p <= PRICE_DECIDED_LOW => Some(Side::No),
        _ => None,
    }
}

/// One resolution pass over up to [`RESOLUTION_BATCH`] open markets.
pub async fn resolve_batch(trader: &PaperTrader, source: &dyn MarketStateSource) -> usize {
    let markets = trader.open_market_ids(RESOLUTION_BATCH);
    if markets.is_empty() {
        return 0;
    }

    let mut resolved = 0usize;
    for market_id in markets {
        let state = match source.market_state(&market_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(market = %market_id, "market not found at venue; skipping");
                continue;
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("429") || message.to_lowercase().contains("rate") {
                    // Venue is throttling; stop the batch and retry next tick.
                    warn!(market = %market_id, "venue rate limit; halting resolution batch");
                    break;
                }
                debug!(market = %market_id, error = %e, "market state fetch failed");
                continue;
            }
        };

        let Some(outcome) = outcome_from_state(&state) else {
            continue;
        };

        match trader.resolve_market(&market_id, outcome) {
            Ok(count) => {
                info!(market = %market_id, outcome = outcome.as_str(), trades = count, "market resolved");
                resolved += count;
            }
            Err(EngineError::AlreadyResolved(_)) => {}
            Err(e) => warn!(market = %market_id, error = %e, "resolution rejected"),
        }
    }
    resolved
}

/// Long-running resolution loop.
pub async fn run_resolution_loop(
    trader: Arc<PaperTrader>,
    source: Arc<dyn MarketStateSource>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let resolved = resolve_batch(&trader, source.as_ref()).await;
        if resolved > 0 {
            debug!(resolved, "resolution pass complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::calibration::CalibrationStore;
    use crate::paper::learning::ThresholdBook;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::broadcast;

    struct FakeVenue {
        states: Mutex<HashMap<String, MarketState>>,
        rate_limited: bool,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl MarketStateSource for FakeVenue {
        async fn market_state(&self, market_id: &str) -> Result<Option<MarketState>> {
            *self.calls.lock() += 1;
            if self.rate_limited {
                anyhow::bail!("status 429 too many requests");
            }
            Ok(self.states.lock().get(market_id).cloned())
        }
    }

    fn trader() -> PaperTrader {
        let (tx, _rx) = broadcast::channel(64);
        PaperTrader::new(
            1000.0,
            Arc::new(CalibrationStore::new(None)),
            Arc::new(ThresholdBook::new(None)),
            tx,
            None,
        )
    }

    #[test]
    fn explicit_resolution_beats_price() {
        let state = MarketState {
            resolution: Some("NO".to_string()),
            yes_price: Some(0.97),
        };
        assert_eq!(outcome_from_state(&state), Some(Side::No));
    }

    #[test]
    fn pinned_price_decides() {
        assert_eq!(
            outcome_from_state(&MarketState { resolution: None, yes_price: Some(0.96) }),
            Some(Side::Yes)
        );
        assert_eq!(
            outcome_from_state(&MarketState { resolution: None, yes_price: Some(0.04) }),
            Some(Side::No)
        );
        assert_eq!(
            outcome_from_state(&MarketState { resolution: None, yes_price: Some(0.60) }),
            None
        );
    }

    #[tokio::test]
    async fn batch_resolves_decided_markets() {
        let trader = trader();
        trader.record_manual("m1", Side::Yes, 0.40, 10.0).unwrap();
        trader.record_manual("m2", Side::Yes, 0.40, 10.0).unwrap();

        let mut states = HashMap::new();
        states.insert(
            "m1".to_string(),
            MarketState { resolution: Some("YES".to_string()), yes_price: None },
        );
        states.insert(
            "m2".to_string(),
            MarketState { resolution: None, yes_price: Some(0.50) },
        );
        let venue = FakeVenue {
            states: Mutex::new(states),
            rate_limited: false,
            calls: Mutex::new(0),
        };

        let resolved = resolve_batch(&trader, &venue).await;
        assert_eq!(resolved, 1);
        assert_eq!(trader.open_trades().len(), 1);
        assert_eq!(trader.resolved_trades().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_halts_batch() {
        let trader = trader();
        trader.record_manual("m1", Side::Yes, 0.40, 10.0).unwrap();
        trader.record_manual("m2", Side::Yes, 0.40, 10.0).unwrap();

        let venue = FakeVenue {
            states: Mutex::new(HashMap::new()),
            rate_limited: true,
            calls: Mutex::new(0),
        };
        let resolved = resolve_batch(&trader, &venue).await;
        assert_eq!(resolved, 0);
        // The first 429 stops the batch; the second market is never queried.
        assert_eq!(*venue.calls.lock(), 1);
    }
}
