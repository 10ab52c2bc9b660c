//! Strategy bank.
//!
//! Every strategy sees the same scan snapshot and the same capability bundle,
//! and yields fee-adjusted opportunities. A strategy failure on one market is
//! that market's problem: the strategy logs, skips it and keeps going.

pub mod arbitrage;
pub mod ict;
pub mod momentum;
pub mod value;
pub mod whale;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{MarketSnapshot, Opportunity, PricePoint};
use crate::paper::learning::ThresholdBook;
use crate::risk::KellyParams;
use crate::scrapers::book_store::BookStore;
use crate::scrapers::market_cache::MarketDataCache;
use crate::scrapers::odds_api::OddsClient;
use crate::scrapers::polymarket::PolymarketClient;

/// Fallback minimum score until a strategy has learned its own cutoff.
pub const DEFAULT_MIN_SCORE: f64 = 30.0;

/// Capability bundle handed to every strategy. Strategies depend on these
/// narrow interfaces, never on the engine wiring that builds them.
pub struct StrategyCtx {
    pub book_store: Arc<BookStore>,
    pub market_cache: Arc<MarketDataCache>,
    pub polymarket: Arc<PolymarketClient>,
    pub odds: Option<Arc<OddsClient>>,
    pub thresholds: Arc<ThresholdBook>,
    /// Per-market price history prefetched for this scan.
    pub histories: HashMap<String, Arc<Vec<PricePoint>>>,
    pub kelly: KellyParams,
}

impl StrategyCtx {
    pub fn history(&self, market_id: &str) -> Option<&[PricePoint]> {
        self.histories.get(market_id).map(|h| h.as_slice())
    }

    /// Learned minimum score for a strategy; the learned cutoff only counts
    /// once it rests on enough resolved trades.
    pub fn min_score(&self, strategy: &str) -> f64 {
        self.thresholds.min_score(strategy, DEFAULT_MIN_SCORE)
    }

    /// Kelly parameters bound to the current bankroll.
    pub fn kelly_for(&self, bankroll: f64) -> KellyParams {
        KellyParams {
            bankroll,
            ..self.kelly.clone()
        }
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluate the scan snapshot. Implementations must skip (not abort on)
    /// per-market failures.
    async fn evaluate(
        &self,
        ctx: &StrategyCtx,
        markets: &[Arc<MarketSnapshot>],
        bankroll: f64,
    ) -> Result<Vec<Opportunity>>;
}

/// The full bank in evaluation order.
pub fn default_bank() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(value::CrossVenueValue),
        Arc::new(arbitrage::LogicArbitrage),
        Arc::new(ict::Microstructure),
        Arc::new(momentum::MomentumStrategy),
        Arc::new(whale::WhaleFlow),
    ]
}
