//! Momentum strategy over the recent price tape.
//!
//! EMA crossover, rate-of-change, acceleration and a z-score breakout make
//! up the trend read; the volume ratio decides how much proof the composite
//! needs before it trades.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::models::{
    ConfidenceTier, MarketSnapshot, Opportunity, OpportunitySignal, PricePoint, RiskTier, Side,
};
use crate::risk::{kelly_stake, net_ev, slippage};
use crate::strategies::{Strategy, StrategyCtx};

const MIN_VOLUME: f64 = 1_500.0;
const MIN_LIQUIDITY: f64 = 3_000.0;
/// Tape length the composite needs.
const MIN_POINTS: usize = 20;
/// Gate with volume confirmation.
const GATE_CONFIRMED: f64 = 25.0;
/// Gate without it.
const GATE_UNCONFIRMED: f64 = 40.0;
/// Volume ratio that counts as confirmation.
const VOLUME_CONFIRM_RATIO: f64 = 1.2;

/// Final EMA value over `values`, seeded with the SMA of the first `period`.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    for &value in &values[period..] {
        current = value * multiplier + current * (1.0 - multiplier);
    }
    current.is_finite().then_some(current)
}

/// Percentage rate of change over `period` points.
pub fn rate_of_change(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() <= period {
        return None;
    }
    let previous = values[values.len() - 1 - period];
    if previous == 0.0 {
        return Some(0.0);
    }
    Some((values[values.len() - 1] - previous) / previous * 100.0)
}

fn zscore(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window {
        return None;
    }
    let slice = &values[values.len() - window..];
    let mean = slice.iter().sum::<f64>() / window as f64;
    let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
    let sd = var.sqrt();
    if sd <= 0.0 {
        return Some(0.0);
    }
    Some((values[values.len() - 1] - mean) / sd)
}

/// Trend composite: signed strength plus the inputs that built it.
#[derive(Debug, Clone, Copy)]
pub struct TrendRead {
    pub strength: f64,
    pub direction: i8,
    pub roc5: f64,
    pub acceleration: f64,
    pub volume_ratio: f64,
    pub zscore: f64,
    pub volume_confirmed: bool,
}

pub fn read_trend(history: &[PricePoint]) -> Option<TrendRead> {
    if history.len() < MIN_POINTS {
        return None;
    }
    let prices: Vec<f64> = history.iter().map(|p| p.price).collect();

    let ema_fast = ema(&prices, 5)?;
    let ema_slow = ema(&prices, 15)?;
    if ema_slow <= 0.0 {
        return None;
    }
    let ema_gap_pct = (ema_fast - ema_slow) / ema_slow * 100.0;

    let roc5 = rate_of_change(&prices, 5)?;
    let roc10 = rate_of_change(&prices, 10)?;
    let acceleration = roc5 - roc10;
    let z = zscore(&prices, 20)?;

    let volumes: Vec<f64> = history.iter().map(|p| p.volume).collect();
    let volume_ratio = if volumes.len() >= 21 && volumes.iter().any(|&v| v > 0.0) {
        let recent = volumes[volumes.len() - 1];
        let baseline = volumes[volumes.len() - 21..volumes.len() - 1]
            .iter()
            .sum::<f64>()
            / 20.0;
        if baseline > 0.0 {
            recent / baseline
        } else {
            0.0
        }
    } else {
        0.0
    };

    let signed = ema_gap_pct * 8.0 + roc5 * 1.5 + acceleration * 1.5 + z * 8.0;
    Some(TrendRead {
        strength: signed.abs().min(100.0),
        direction: if signed > 0.0 {
            1
        } else if signed < 0.0 {
            -1
        } else {
            0
        },
        roc5,
        acceleration,
        volume_ratio,
        zscore: z,
        volume_confirmed: volume_ratio >= VOLUME_CONFIRM_RATIO,
    })
}

pub struct MomentumStrategy;

#[async_trait]
impl Strategy for MomentumStrategy {
    fn name(&self) -> &'static str {
        "MOMENTUM"
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
            let Some(trend) = read_trend(history) else {
                continue;
            };
            if trend.direction == 0 {
                continue;
            }

            // An unconfirmed move has to be much stronger to trade.
            let gate = if trend.volume_confirmed {
                GATE_CONFIRMED
            } else {
                GATE_UNCONFIRMED
            };
            let score = trend.strength;
            if score < gate.max(learned_gate) {
                continue;
            }

            let side = if trend.direction > 0 { Side::Yes } else { Side::No };
            let entry = match side {
                Side::Yes => market.yes_price,
                Side::No => market.no_price,
            };
            let slip = slippage(100.0, market.liquidity);
            let win_prob = (entry + (score / 100.0) * 0.06).min(0.97);
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
                score,
                confidence: if score >= 60.0 && trend.volume_confirmed {
                    ConfidenceTier::High
                } else if score >= 40.0 {
                    ConfidenceTier::Medium
                } else {
                    ConfidenceTier::Low
                },
                risk_tier: RiskTier::Medium,
                risk_note: "Momentum reverses without warning; worst case the trend breaks immediately after entry".to_string(),
                signal: OpportunitySignal::Momentum {
                    trend_strength: trend.strength,
                    roc5: trend.roc5,
                    acceleration: trend.acceleration,
                    volume_ratio: trend.volume_ratio,
                    zscore: trend.zscore,
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

    fn tape(prices: &[f64], volume: f64) -> Vec<PricePoint> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                ts: i as i64 * 60,
                price,
                volume,
            })
            .collect()
    }

    #[test]
    fn ema_seeds_with_sma() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        // Seed SMA(1..3) = 2, then fold 4 and 5.
        let result = ema(&values, 3).unwrap();
        assert!(result > 2.0 && result < 5.0);
        assert!(ema(&values, 6).is_none());
        assert!(ema(&values, 0).is_none());
    }

    #[test]
    fn roc_measures_percentage_change() {
        let values = [0.40, 0.42, 0.44, 0.46, 0.48, 0.50];
        let roc = rate_of_change(&values, 5).unwrap();
        assert!((roc - 25.0).abs() < 1e-9);
        assert!(rate_of_change(&values, 6).is_none());
    }

    #[test]
    fn rising_tape_reads_bullish() {
        let prices: Vec<f64> = (0..24).map(|i| 0.40 + i as f64 * 0.01).collect();
        let trend = read_trend(&tape(&prices, 500.0)).unwrap();
        assert_eq!(trend.direction, 1);
        assert!(trend.strength > 0.0);
    }

    #[test]
    fn falling_tape_reads_bearish() {
        let prices: Vec<f64> = (0..24).map(|i| 0.80 - i as f64 * 0.01).collect();
        let trend = read_trend(&tape(&prices, 500.0)).unwrap();
        assert_eq!(trend.direction, -1);
    }

    #[test]
    fn short_tape_reads_nothing() {
        let prices: Vec<f64> = (0..10).map(|i| 0.40 + i as f64 * 0.01).collect();
        assert!(read_trend(&tape(&prices, 500.0)).is_none());
    }

    #[test]
    fn flat_constant_volume_is_unconfirmed() {
        let prices: Vec<f64> = (0..24).map(|i| 0.40 + i as f64 * 0.01).collect();
        let trend = read_trend(&tape(&prices, 500.0)).unwrap();
        // Flat volume: ratio ~1.0, below the confirmation bar.
        assert!(!trend.volume_confirmed);
    }

    #[test]
    fn volume_spike_confirms() {
        let prices: Vec<f64> = (0..24).map(|i| 0.40 + i as f64 * 0.01).collect();
        let mut history = tape(&prices, 500.0);
        history.last_mut().unwrap().volume = 2000.0;
        let trend = read_trend(&history).unwrap();
        assert!(trend.volume_confirmed);
    }
}
