//! Self-learning state: per-strategy score thresholds derived from resolved
//! paper trades.
//!
//! After enough resolutions a strategy stops using its static default gate
//! and starts gating on the cutoff its own PnL history supports.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Resolved trades needed before a strategy gets a learned threshold at all.
const MIN_TRADES_TO_LEARN: usize = 5;
/// Resolved trades needed before strategies trust the learned cutoff.
pub const MIN_SAMPLES_TO_APPLY: usize = 10;
/// Width of the score buckets used for the profit cutoff.
const SCORE_BUCKET_WIDTH: f64 = 25.0;
/// Samples a score bucket needs before its average PnL counts.
const MIN_BUCKET_SAMPLES: usize = 3;
/// Cutoff used when no score bucket qualifies.
const FALLBACK_CUTOFF: f64 = 50.0;

/// Learned gating parameters for one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedThreshold {
    pub optimal_min_score: f64,
    pub profit_cutoff: f64,
    pub sample_size: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
}

/// One resolved trade as the learner sees it.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub strategy: String,
    pub score: f64,
    pub pnl: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearningState {
    thresholds: HashMap<String, LearnedThreshold>,
    /// All-time (correct, total) per evidence signal, mirrored from the
    /// resolution path for reporting.
    signal_accuracy: HashMap<String, (u64, u64)>,
    saved_at: i64,
}

/// Shared, persisted threshold store. Strategies read; the learning cycle
/// writes.
pub struct ThresholdBook {
    state: RwLock<LearningState>,
    path: Option<PathBuf>,
}

impl ThresholdBook {
    pub fn new(path: Option<PathBuf>) -> Self {
        let state = path
            .as_ref()
            .and_then(|p| match Self::load(p) {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!(error = %e, "no usable learning state; starting fresh");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            state: RwLock::new(state),
            path,
        }
    }

    /// Gate for a strategy: the learned profit cutoff once it rests on
    /// enough samples, otherwise the caller's default.
    pub fn min_score(&self, strategy: &str, default: f64) -> f64 {
        let state = self.state.read();
        match state.thresholds.get(strategy) {
            Some(t) if t.sample_size >= MIN_SAMPLES_TO_APPLY => t.profit_cutoff,
            _ => default,
        }
    }

    pub fn threshold(&self, strategy: &str) -> Option<LearnedThreshold> {
        self.state.read().thresholds.get(strategy).cloned()
    }

    pub fn all_thresholds(&self) -> HashMap<String, LearnedThreshold> {
        self.state.read().thresholds.clone()
    }

    pub fn record_signal_outcome(&self, name: &str, was_correct: bool) {
        let mut state = self.state.write();
        let entry = state.signal_accuracy.entry(name.to_string()).or_insert((0, 0));
        entry.1 += 1;
        if was_correct {
            entry.0 += 1;
        }
    }

    pub fn signal_accuracy(&self) -> HashMap<String, (u64, u64)> {
        self.state.read().signal_accuracy.clone()
    }

    /// Run the learning cycle over resolved bot trades and persist the
    /// refreshed thresholds.
    pub fn relearn(&self, outcomes: &[TradeOutcome]) {
        let mut per_strategy: HashMap<&str, Vec<&TradeOutcome>> = HashMap::new();
        for outcome in outcomes {
            per_strategy.entry(&outcome.strategy).or_default().push(outcome);
        }

        let mut state = self.state.write();
        for (strategy, trades) in per_strategy {
            if trades.len() < MIN_TRADES_TO_LEARN {
                continue;
            }
            let threshold = learn_threshold(&trades);
            info!(
                strategy,
                optimal = threshold.optimal_min_score,
                cutoff = threshold.profit_cutoff,
                samples = threshold.sample_size,
                "strategy threshold relearned"
            );
            state.thresholds.insert(strategy.to_string(), threshold);
        }

        state.saved_at = chrono::Utc::now().timestamp();
        if let Some(path) = &self.path {
            if let Err(e) = Self::save(path, &state) {
                warn!(error = %e, "learning state save failed");
            }
        }
    }

    fn load(path: &PathBuf) -> Result<LearningState> {
        let raw = std::fs::read_to_string(path).context("read learning state")?;
        serde_json::from_str(&raw).context("parse learning state")
    }

    fn save(path: &PathBuf, state: &LearningState) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string(state).context("serialize learning state")?;
        std::fs::write(path, json).context("write learning state")?;
        Ok(())
    }
}

/// Derive a threshold from one strategy's resolved trades.
fn learn_threshold(trades: &[&TradeOutcome]) -> LearnedThreshold {
    let mut by_score: Vec<&TradeOutcome> = trades.to_vec();
    by_score.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // Walking down from the best-scored trades, the cumulative PnL peaks at
    // the score below which trades stop paying.
    let mut cumulative = 0.0;
    let mut best_cumulative = f64::MIN;
    let mut optimal_min_score = by_score.first().map(|t| t.score).unwrap_or(0.0);
    for trade in &by_score {
        cumulative += trade.pnl;
        if cumulative > best_cumulative {
            best_cumulative = cumulative;
            optimal_min_score = trade.score;
        }
    }

    // Lowest 25-wide score bucket that still averages positive PnL.
    let mut buckets: HashMap<i64, Vec<f64>> = HashMap::new();
    for trade in trades {
        let bucket = (trade.score / SCORE_BUCKET_WIDTH).floor() as i64;
        buckets.entry(bucket).or_default().push(trade.pnl);
    }
    let mut profit_cutoff = FALLBACK_CUTOFF;
    let mut bucket_ids: Vec<i64> = buckets.keys().copied().collect();
    bucket_ids.sort_unstable();
    for bucket in bucket_ids {
        let pnls = &buckets[&bucket];
        if pnls.len() >= MIN_BUCKET_SAMPLES {
            let avg = pnls.iter().sum::<f64>() / pnls.len() as f64;
            if avg > 0.0 {
                profit_cutoff = bucket as f64 * SCORE_BUCKET_WIDTH;
                break;
            }
        }
    }

    let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();

    LearnedThreshold {
        optimal_min_score,
        profit_cutoff,
        sample_size: trades.len(),
        win_rate: wins as f64 / trades.len() as f64,
        avg_pnl: total_pnl / trades.len() as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(strategy: &str, score: f64, pnl: f64) -> TradeOutcome {
        TradeOutcome {
            strategy: strategy.to_string(),
            score,
            pnl,
        }
    }

    #[test]
    fn optimal_score_sits_at_cumulative_pnl_peak() {
        // High scores pay, low scores bleed.
        let trades = vec![
            outcome("ICT", 90.0, 12.0),
            outcome("ICT", 80.0, 8.0),
            outcome("ICT", 70.0, 3.0),
            outcome("ICT", 50.0, -4.0),
            outcome("ICT", 30.0, -6.0),
        ];
        let refs: Vec<&TradeOutcome> = trades.iter().collect();
        let threshold = learn_threshold(&refs);
        assert_eq!(threshold.optimal_min_score, 70.0);
        assert_eq!(threshold.sample_size, 5);
        assert!((threshold.win_rate - 0.6).abs() < 1e-12);
    }

    #[test]
    fn profit_cutoff_picks_lowest_paying_bucket() {
        // Bucket 50-75 pays on 3+ samples; bucket 25-50 loses.
        let trades = vec![
            outcome("ICT", 60.0, 2.0),
            outcome("ICT", 65.0, 3.0),
            outcome("ICT", 70.0, 1.0),
            outcome("ICT", 30.0, -2.0),
            outcome("ICT", 35.0, -1.0),
            outcome("ICT", 40.0, -3.0),
        ];
        let refs: Vec<&TradeOutcome> = trades.iter().collect();
        let threshold = learn_threshold(&refs);
        assert_eq!(threshold.profit_cutoff, 50.0);
    }

    #[test]
    fn cutoff_defaults_when_no_bucket_qualifies() {
        let trades = vec![
            outcome("WHALE", 60.0, -2.0),
            outcome("WHALE", 65.0, -3.0),
            outcome("WHALE", 70.0, -1.0),
            outcome("WHALE", 30.0, 1.0),
            outcome("WHALE", 90.0, 0.5),
        ];
        let refs: Vec<&TradeOutcome> = trades.iter().collect();
        let threshold = learn_threshold(&refs);
        assert_eq!(threshold.profit_cutoff, FALLBACK_CUTOFF);
    }

    #[test]
    fn learned_cutoff_applies_only_with_enough_samples() {
        let book = ThresholdBook::new(None);
        let few: Vec<TradeOutcome> = (0..6).map(|i| outcome("VALUE", 60.0 + i as f64, 2.0)).collect();
        book.relearn(&few);
        // 6 samples: learned but not yet trusted.
        assert!(book.threshold("VALUE").is_some());
        assert_eq!(book.min_score("VALUE", 30.0), 30.0);

        let many: Vec<TradeOutcome> = (0..12).map(|i| outcome("VALUE", 60.0 + i as f64, 2.0)).collect();
        book.relearn(&many);
        assert_eq!(book.min_score("VALUE", 30.0), 50.0);
    }

    #[test]
    fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning-state.json");
        {
            let book = ThresholdBook::new(Some(path.clone()));
            let trades: Vec<TradeOutcome> =
                (0..12).map(|i| outcome("ICT", 55.0 + i as f64, 1.0)).collect();
            book.relearn(&trades);
        }
        let reloaded = ThresholdBook::new(Some(path));
        assert!(reloaded.threshold("ICT").is_some());
    }
}
