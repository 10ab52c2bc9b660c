//! Cross-venue value: bookmaker consensus vs venue price.
//!
//! When the devigged bookmaker consensus for a matched event diverges from
//! the venue's yes price by more than costs, the venue side priced against
//! the consensus is the value side.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::models::{
    ConfidenceTier, MarketSnapshot, Opportunity, OpportunitySignal, RiskTier, Side,
};
use crate::risk::{kelly_stake, net_ev, slippage, FEE_RATE};
use crate::strategies::{Strategy, StrategyCtx};

const MIN_VOLUME: f64 = 1_000.0;
const MIN_LIQUIDITY: f64 = 2_000.0;
/// Net divergence the consensus must clear after costs.
const MIN_NET_DIVERGENCE: f64 = 0.01;
/// Slippage reference size for gating.
const GATE_SIZE_USD: f64 = 100.0;

pub struct CrossVenueValue;

#[async_trait]
impl Strategy for CrossVenueValue {
    fn name(&self) -> &'static str {
        "CROSS_VENUE"
    }

    async fn evaluate(
        &self,
        ctx: &StrategyCtx,
        markets: &[Arc<MarketSnapshot>],
        bankroll: f64,
    ) -> Result<Vec<Opportunity>> {
        let Some(odds) = &ctx.odds else {
            return Ok(Vec::new());
        };
        let min_score = ctx.min_score(self.name());
        let mut opportunities = Vec::new();

        for market in markets {
            if !market.in_tradeable_band()
                || market.volume_24h < MIN_VOLUME
                || market.liquidity < MIN_LIQUIDITY
            {
                continue;
            }

            let Some(consensus) = odds.consensus_for_question(&market.question) else {
                continue;
            };

            let divergence = (consensus.prob - market.yes_price).abs();
            let slip = slippage(GATE_SIZE_USD, market.liquidity);
            let net_divergence = divergence - FEE_RATE * divergence - slip;
            if net_divergence <= MIN_NET_DIVERGENCE {
                continue;
            }

            let side = if consensus.prob > market.yes_price {
                Side::Yes
            } else {
                Side::No
            };
            let (entry, win_prob) = match side {
                Side::Yes => (market.yes_price, consensus.prob),
                Side::No => (market.no_price, 1.0 - consensus.prob),
            };

            let ev = net_ev(win_prob, entry, slip);
            if ev <= 0.0 {
                continue;
            }

            let pinnacle_agrees = consensus
                .pinnacle_prob
                .map(|p| (p > market.yes_price) == (consensus.prob > market.yes_price))
                .unwrap_or(false);

            let mut score = (net_divergence * 400.0).min(50.0);
            if consensus.bookmaker_count >= 20 {
                score += 15.0;
            } else if consensus.bookmaker_count >= 10 {
                score += 10.0;
            }
            if pinnacle_agrees {
                score += 10.0;
            }
            if market.liquidity >= 50_000.0 {
                score += 10.0;
            } else if market.liquidity >= 20_000.0 {
                score += 5.0;
            }
            if market.volume_24h >= 10_000.0 {
                score += 5.0;
            }
            let score = score.min(100.0);
            if score < min_score {
                debug!(market = %market.id, score, min_score, "value signal below gate");
                continue;
            }

            let size = kelly_stake(win_prob, entry, market.liquidity, &ctx.kelly_for(bankroll));

            let confidence = if consensus.bookmaker_count >= 10 && net_divergence >= 0.04 {
                ConfidenceTier::High
            } else if net_divergence >= 0.02 {
                ConfidenceTier::Medium
            } else {
                ConfidenceTier::Low
            };

            opportunities.push(Opportunity {
                strategy: self.name().to_string(),
                venue: market.venue,
                market_id: market.id.clone(),
                question: market.question.clone(),
                side,
                entry_price: entry,
                size_usd: size.stake_usd,
                raw_edge: divergence,
                net_ev: ev,
                score,
                confidence,
                risk_tier: if market.liquidity >= 50_000.0 {
                    RiskTier::Low
                } else {
                    RiskTier::Medium
                },
                risk_note: format!(
                    "Consensus from {} books may lag venue resolution terms; worst case the full ${:.2} stake is lost at resolution",
                    consensus.bookmaker_count, size.stake_usd
                ),
                signal: OpportunitySignal::CrossVenueValue {
                    consensus_prob: consensus.prob,
                    market_prob: market.yes_price,
                    bookmaker_count: consensus.bookmaker_count,
                    pinnacle_agrees,
                },
                detected_at: Utc::now(),
            });
        }

        Ok(opportunities)
    }
}
