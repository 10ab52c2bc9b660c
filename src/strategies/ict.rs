//! Orderbook-microstructure strategy.
//!
//! Four weighted sub-signals over the clean book and recent tape: near-touch
//! vs deep imbalance, liquidity sweeps, institutional order blocks and
//! volume-price divergence. The spoof score taxes the aggregate, and a thin
//! book shrinks both conviction and size.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::models::{
    ConfidenceTier, MarketSnapshot, Opportunity, OpportunitySignal, PricePoint, RiskTier, Side,
};
use crate::risk::{kelly_stake, net_ev, slippage};
use crate::scrapers::book_store::{assess_depth, find_walls};
use crate::scrapers::clob_ws::WS_STALE_MS;
use crate::scrapers::polymarket::OrderBook;
use crate::strategies::{Strategy, StrategyCtx};

const MIN_VOLUME: f64 = 2_000.0;
const MIN_LIQUIDITY: f64 = 5_000.0;

const WEIGHT_IMBALANCE: f64 = 0.40;
const WEIGHT_SWEEP: f64 = 0.25;
const WEIGHT_ORDER_BLOCKS: f64 = 0.20;
const WEIGHT_DIVERGENCE: f64 = 0.15;

/// History points a sweep read requires.
const SWEEP_MIN_POINTS: usize = 8;

/// One sub-signal's verdict: strength in [0, 100] and a directional vote.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubSignal {
    pub score: f64,
    pub vote: i8,
}

pub struct Microstructure;

#[async_trait]
impl Strategy for Microstructure {
    fn name(&self) -> &'static str {
        "ICT"
    }

    async fn evaluate(
        &self,
        ctx: &StrategyCtx,
        markets: &[Arc<MarketSnapshot>],
        bankroll: f64,
    ) -> Result<Vec<Opportunity>> {
        let min_score = ctx.min_score(self.name());
        let mut opportunities = Vec::new();

        for market in markets {
            if !market.in_tradeable_band()
                || market.volume_24h < MIN_VOLUME
                || market.liquidity < MIN_LIQUIDITY
            {
                continue;
            }

            let Some((book, spoof_report)) = ctx.book_store.clean_book(&market.yes_token, WS_STALE_MS)
            else {
                continue;
            };
            let history = ctx.history(&market.id).unwrap_or(&[]);

            let imbalance = tight_wide_imbalance(&book);
            let sweep = liquidity_sweep(history);
            let blocks = order_blocks(&book);
            let divergence = volume_price_divergence(history);

            let depth = assess_depth(&book);
            let base = WEIGHT_IMBALANCE * imbalance.score
                + WEIGHT_SWEEP * sweep.map(|s| s.score).unwrap_or(0.0)
                + WEIGHT_ORDER_BLOCKS * blocks.score
                + WEIGHT_DIVERGENCE * divergence.score;
            let score = aggregate_score(base, depth.confidence_factor, spoof_report.score);
            if score < min_score {
                continue;
            }

            let votes = [
                imbalance.vote,
                sweep.map(|s| s.vote).unwrap_or(0),
                blocks.vote,
                divergence.vote,
            ];
            let net_vote: i32 = votes.iter().map(|&v| v as i32).sum();
            if net_vote == 0 {
                debug!(market = %market.id, "microstructure votes tied; rejecting");
                continue;
            }
            let side = if net_vote > 0 { Side::Yes } else { Side::No };

            let entry = match side {
                Side::Yes => market.yes_price,
                Side::No => market.no_price,
            };
            let slip = slippage(100.0, market.liquidity);
            // Conviction maps to a modest probability edge over the entry.
            let win_prob = (entry + (score / 100.0) * 0.05).min(0.97);
            let ev = net_ev(win_prob, entry, slip);
            if ev <= 0.0 {
                continue;
            }

            let kelly = kelly_stake(win_prob, entry, market.liquidity, &ctx.kelly_for(bankroll));
            let size_usd = kelly.stake_usd * depth.confidence_factor;
            if size_usd <= 0.0 {
                continue;
            }

            opportunities.push(Opportunity {
                strategy: self.name().to_string(),
                venue: market.venue,
                market_id: market.id.clone(),
                question: market.question.clone(),
                side,
                entry_price: entry,
                size_usd,
                raw_edge: win_prob - entry,
                net_ev: ev,
                score,
                confidence: if score >= 70.0 && spoof_report.score == 0 {
                    ConfidenceTier::High
                } else if score >= 45.0 {
                    ConfidenceTier::Medium
                } else {
                    ConfidenceTier::Low
                },
                risk_tier: if depth.is_thin { RiskTier::High } else { RiskTier::Medium },
                risk_note: format!(
                    "Microstructure reads decay fast; worst case the book flips and the ${size_usd:.2} stake rides to resolution"
                ),
                signal: OpportunitySignal::Microstructure {
                    imbalance: imbalance.score,
                    sweep: sweep.map(|s| s.score).unwrap_or(0.0),
                    order_blocks: blocks.score,
                    divergence: divergence.score,
                    spoof_score: spoof_report.score,
                    book_confidence: depth.confidence_factor,
                },
                detected_at: Utc::now(),
            });
        }

        Ok(opportunities)
    }
}

/// Confidence scaling first, spoof tax second, floored at zero.
pub fn aggregate_score(base: f64, confidence_factor: f64, spoof_score: u32) -> f64 {
    let penalty = (5.0 * spoof_score as f64).min(25.0);
    (base * confidence_factor - penalty).max(0.0)
}

/// Near-touch conviction confirmed against the deeper book.
pub fn tight_wide_imbalance(book: &OrderBook) -> SubSignal {
    let Some(mid) = book.mid_price() else {
        return SubSignal::default();
    };
    let ratio = |band: f64| {
        let vol = |orders: &[crate::scrapers::polymarket::Order]| {
            orders
                .iter()
                .filter(|o| (o.price - mid).abs() <= band)
                .map(|o| o.size)
                .sum::<f64>()
        };
        let bids = vol(&book.bids);
        let asks = vol(&book.asks);
        if bids + asks <= 0.0 {
            None
        } else {
            Some(bids / (bids + asks))
        }
    };

    let (Some(tight), Some(wide)) = (ratio(0.02), ratio(0.10)) else {
        return SubSignal::default();
    };

    if tight > 0.60 && tight >= wide {
        SubSignal {
            score: ((tight - 0.5) * 250.0).min(100.0),
            vote: 1,
        }
    } else if tight < 0.40 && tight <= wide {
        SubSignal {
            score: ((0.5 - tight) * 250.0).min(100.0),
            vote: -1,
        }
    } else {
        SubSignal::default()
    }
}

/// Sweep-and-reject: price takes out a recent extreme and closes back inside.
/// Needs at least eight points of tape; below that there is no read at all.
pub fn liquidity_sweep(history: &[PricePoint]) -> Option<SubSignal> {
    if history.len() < SWEEP_MIN_POINTS {
        return None;
    }
    let window = &history[history.len().saturating_sub(10)..];
    let n = window.len();
    let poke = window[n - 2].price;
    let last = window[n - 1].price;
    let body = &window[..n - 2];

    let prior_high = body.iter().map(|p| p.price).fold(f64::MIN, f64::max);
    let prior_low = body.iter().map(|p| p.price).fold(f64::MAX, f64::min);

    if poke > prior_high && last < poke {
        // Highs were swept and rejected.
        return Some(SubSignal {
            score: ((poke - last) * 1000.0).min(100.0),
            vote: -1,
        });
    }
    if poke < prior_low && last > poke {
        return Some(SubSignal {
            score: ((last - poke) * 1000.0).min(100.0),
            vote: 1,
        });
    }
    Some(SubSignal::default())
}

/// Institutional order blocks: a dominant resting wall on one side.
pub fn order_blocks(book: &OrderBook) -> SubSignal {
    let walls = find_walls(book);
    let side_max = |is_bid: bool| {
        walls
            .iter()
            .filter(|w| w.is_bid == is_bid)
            .map(|w| w.size)
            .fold(0.0, f64::max)
    };
    let support = side_max(true);
    let resistance = side_max(false);

    if support > resistance * 1.5 && support > 0.0 {
        SubSignal {
            score: (support / 20_000.0 * 100.0).min(100.0),
            vote: 1,
        }
    } else if resistance > support * 1.5 && resistance > 0.0 {
        SubSignal {
            score: (resistance / 20_000.0 * 100.0).min(100.0),
            vote: -1,
        }
    } else {
        SubSignal::default()
    }
}

/// Price pushing one way on fading volume is a move running out of fuel.
pub fn volume_price_divergence(history: &[PricePoint]) -> SubSignal {
    if history.len() < 10 {
        return SubSignal::default();
    }
    let window = &history[history.len() - 10..];
    if window.iter().all(|p| p.volume <= 0.0) {
        return SubSignal::default();
    }

    let price_trend = window[9].price - window[0].price;
    let early_volume: f64 = window[..5].iter().map(|p| p.volume).sum::<f64>() / 5.0;
    let late_volume: f64 = window[5..].iter().map(|p| p.volume).sum::<f64>() / 5.0;
    let volume_fading = late_volume < early_volume * 0.7;

    if !volume_fading || price_trend.abs() < 0.005 {
        return SubSignal::default();
    }
    let score = (price_trend.abs() * 500.0 + 20.0).min(100.0);
    if price_trend > 0.0 {
        // Rally on fading volume.
        SubSignal { score, vote: -1 }
    } else {
        // Sell-off running dry.
        SubSignal { score, vote: 1 }
    }
}
