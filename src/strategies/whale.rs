//! Whale-flow strategy: outsized volume leaning one way.
//!
//! A volume spike on its own is noise; a spike whose volume-weighted price
//! deltas keep pointing the same way while volume builds reads as a large
//! participant working an entry.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::models::{
    ConfidenceTier, MarketSnapshot, Opportunity, OpportunitySignal, PricePoint, RiskTier, Side,
};
use crate::risk::{kelly_stake, net_ev, slippage};
use crate::strategies::{Strategy, StrategyCtx};

const MIN_VOLUME: f64 = 2_000.0;
const MIN_LIQUIDITY: f64 = 3_000.0;
/// Composite score needed to trade the flow.
const MIN_WHALE_SCORE: f64 = 40.0;
/// Direction weaker than this is neutral.
const MIN_DIRECTION: f64 = 0.2;
/// Points of tape (with volume) the read needs.
const MIN_POINTS: usize = 21;

#[derive(Debug, Clone, Copy)]
pub struct FlowRead {
    pub spike_ratio: f64,
    /// Volume-weighted direction in [-1, 1].
    pub direction: f64,
    pub accumulation: f64,
    pub price_impact: f64,
    pub score: f64,
}

pub fn read_flow(history: &[PricePoint]) -> Option<FlowRead> {
    if history.len() < MIN_POINTS {
        return None;
    }
    let volumes: Vec<f64> = history.iter().map(|p| p.volume).collect();
    if !volumes.iter().any(|&v| v > 0.0) {
        return None;
    }

    let last_volume = *volumes.last().expect("non-empty");
    let baseline: f64 =
        volumes[volumes.len() - 21..volumes.len() - 1].iter().sum::<f64>() / 20.0;
    let spike_ratio = if baseline > 0.0 {
        last_volume / baseline
    } else {
        0.0
    };

    // Volume-weighted direction over the last ten deltas.
    let window = &history[history.len() - 10..];
    let mut weighted = 0.0;
    let mut total_volume = 0.0;
    let mut up_moves = 0i32;
    let mut down_moves = 0i32;
    for pair in window.windows(2) {
        let delta = pair[1].price - pair[0].price;
        let volume = pair[1].volume;
        if delta > 0.0 {
            weighted += volume;
            up_moves += 1;
        } else if delta < 0.0 {
            weighted -= volume;
            down_moves += 1;
        }
        total_volume += volume;
    }
    let direction = if total_volume > 0.0 {
        weighted / total_volume
    } else {
        0.0
    };

    // Directional consistency, with a bonus while volume builds.
    let moves = up_moves + down_moves;
    let consistency = if moves > 0 {
        (up_moves - down_moves).abs() as f64 / moves as f64
    } else {
        0.0
    };
    let early: f64 = window[..5].iter().map(|p| p.volume).sum::<f64>() / 5.0;
    let late: f64 = window[5..].iter().map(|p| p.volume).sum::<f64>() / 5.0;
    let building = late > early * 1.1;
    let accumulation = (consistency * if building { 1.2 } else { 1.0 }).min(1.0);

    // How much price the observed volume actually moved.
    let price_change = (window[window.len() - 1].price - window[0].price).abs();
    let price_impact = price_change / (total_volume / 1000.0 + 1.0);

    let score = (spike_ratio.min(6.0) * 10.0
        + direction.abs() * 30.0
        + accumulation * 25.0
        + (price_impact * 200.0).min(15.0))
    .min(100.0);

    Some(FlowRead {
        spike_ratio,
        direction,
        accumulation,
        price_impact,
        score,
    })
}

pub struct WhaleFlow;

#[async_trait]
impl Strategy for WhaleFlow {
    fn name(&self) -> &'static str {
        "WHALE"
    }

    async fn evaluate(
        &self,
        ctx: &StrategyCtx,
        markets: &[Arc<MarketSnapshot>],
        bankroll: f64,
    ) -> Result<Vec<Opportunity>> {
        let learned_gate = ctx.min_score(self.name());
        let mut opportunities = Vec::new();

        for market in markets {
            if !market.in_tradeable_band()
                || market.volume_24h < MIN_VOLUME
                || market.liquidity < MIN_LIQUIDITY
            {
                continue;
            }
            let Some(history) = ctx.history(&market.id) else {
                continue;
            };
            let Some(flow) = read_flow(history) else {
                continue;
            };
            if flow.score < MIN_WHALE_SCORE.max(learned_gate) || flow.direction.abs() < MIN_DIRECTION {
                continue;
            }

            let side = if flow.direction > 0.0 { Side::Yes } else { Side::No };
            let entry = match side {
                Side::Yes => market.yes_price,
                Side::No => market.no_price,
            };
            let slip = slippage(100.0, market.liquidity);
            let win_prob = (entry + (flow.score / 100.0) * 0.05).min(0.97);
            let ev = net_ev(win_prob, entry, slip);
            if ev <= 0.0 {
                continue;
            }
            let kelly = kelly_stake(win_prob, entry, market.liquidity, &ctx.kelly_for(bankroll));
            if kelly.stake_usd <= 0.0 {
                continue;
            }

            opportunities.push(Opportunity {
                strategy: self.name().to_string(),
                venue: market.venue,
                market_id: market.id.clone(),
                question: market.question.clone(),
                side,
                entry_price: entry,
                size_usd: kelly.stake_usd,
                raw_edge: win_prob - entry,
                net_ev: ev,
                score: flow.score,
                confidence: if flow.score >= 70.0 {
                    ConfidenceTier::High
                } else {
                    ConfidenceTier::Medium
                },
                risk_tier: RiskTier::Medium,
                risk_note: "Large flow may be hedging rather than information; worst case the whale is wrong with you".to_string(),
                signal: OpportunitySignal::WhaleFlow {
                    spike_ratio: flow.spike_ratio,
                    direction: flow.direction,
                    accumulation: flow.accumulation,
                    price_impact: flow.price_impact,
                },
                detected_at: Utc::now(),
            });
        }

        Ok(opportunities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(i: usize, price: f64, volume: f64) -> PricePoint {
        PricePoint {
            ts: i as i64 * 60,
            price,
            volume,
        }
    }

    #[test]
    fn steady_accumulation_reads_bullish() {
        // Quiet baseline, then rising prices on swelling volume.
        let mut history: Vec<PricePoint> =
            (0..14).map(|i| point(i, 0.50, 100.0)).collect();
        for i in 0..10 {
            history.push(point(14 + i, 0.50 + (i as f64 + 1.0) * 0.005, 400.0 + i as f64 * 150.0));
        }
        let flow = read_flow(&history).unwrap();
        assert!(flow.direction > 0.5);
        assert!(flow.spike_ratio > 1.5);
        assert!(flow.score >= MIN_WHALE_SCORE);
    }

    #[test]
    fn churn_reads_neutral() {
        // Balanced two-way flow: direction washes out.
        let history: Vec<PricePoint> = (0..24)
            .map(|i| {
                point(
                    i,
                    if i % 2 == 0 { 0.50 } else { 0.51 },
                    300.0,
                )
            })
            .collect();
        let flow = read_flow(&history).unwrap();
        assert!(flow.direction.abs() < 0.2);
    }

    #[test]
    fn no_volume_data_means_no_read() {
        let history: Vec<PricePoint> = (0..24).map(|i| point(i, 0.5, 0.0)).collect();
        assert!(read_flow(&history).is_none());
    }

    #[test]
    fn short_history_means_no_read() {
        let history: Vec<PricePoint> = (0..15).map(|i| point(i, 0.5, 100.0)).collect();
        assert!(read_flow(&history).is_none());
    }
}
