//! Posterior probability estimator.
//!
//! Fuses the evidence signals in log-odds space, dampened on markets whose
//! volume and category suggest the crowd already prices them efficiently,
//! and wraps the point estimate in a Beta-approximated credible interval.

use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::Value;
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::calibration::{CalibrationStore, CalibrationView, SignalPerformance};
use crate::engine::logodds::{logistic, logit};
use crate::engine::signals::{self, RawSignal};
use crate::models::{ConfidenceTier, MarketSnapshot, PricePoint};
use crate::scrapers::news::NewsSentiment;
use crate::scrapers::odds_api::Consensus;
use crate::scrapers::polymarket::OrderBook;

/// A weighted signal contribution as it entered the posterior.
#[derive(Debug, Clone, Serialize)]
pub struct SignalContribution {
    pub name: String,
    pub raw_llr: f64,
    pub weight: f64,
    pub scaled_llr: f64,
    pub data: Value,
}

/// Posterior estimate with its audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct PosteriorEstimate {
    pub posterior_prob: f64,
    pub market_prob: f64,
    pub edge: f64,
    pub confidence: ConfidenceTier,
    pub credible_low: f64,
    pub credible_high: f64,
    pub active_signal_count: usize,
    pub signals_agree: bool,
    pub damper: f64,
    pub contributions: Vec<SignalContribution>,
}

lazy_static! {
    /// Trust in market efficiency per detected question category. Sports
    /// books price sports tightly; crypto questions much less so.
    static ref CATEGORY_TRUST: Vec<(&'static str, &'static [&'static str], f64)> = vec![
        (
            "sports",
            &["nba", "nfl", "mlb", "nhl", "soccer", "football", "tennis", "ufc", "game", "match", "championship", "super bowl", "world cup"][..],
            0.88,
        ),
        (
            "politics",
            &["election", "president", "senate", "congress", "governor", "primary", "nominee", "vote"][..],
            0.78,
        ),
        (
            "finance",
            &["fed", "rate", "inflation", "gdp", "recession", "s&p", "stock"][..],
            0.72,
        ),
        (
            "crypto",
            &["bitcoin", "btc", "ethereum", "eth", "solana", "crypto", "token"][..],
            0.58,
        ),
    ];
}

const DEFAULT_CATEGORY_TRUST: f64 = 0.62;

/// Keyword category lookup over the question text.
pub fn category_trust(question: &str) -> (&'static str, f64) {
    let lower = question.to_lowercase();
    for (category, keywords, trust) in CATEGORY_TRUST.iter() {
        if keywords.iter().any(|k| lower.contains(k)) {
            return (category, *trust);
        }
    }
    ("other", DEFAULT_CATEGORY_TRUST)
}

/// Efficiency damper: high-volume, liquid markets in trusted categories get
/// their evidence discounted, clamped into [0.78, 1.0].
pub fn efficiency_damper(volume_24h: f64, liquidity: f64, trust: f64) -> f64 {
    let volume_term = (volume_24h.max(1.0).log10() / 6.0).min(1.0);
    let liquidity_term = (liquidity.max(1.0).log10() / 5.5).min(1.0);
    let efficiency = 0.55 * volume_term + 0.45 * liquidity_term;
    (1.0 - efficiency * trust * 0.25).clamp(0.78, 1.0)
}

/// Accuracy-adaptive weight for one signal.
///
/// Below 20 observed outcomes the default stands. Beyond that the weight
/// tracks twice the accuracy (floored at 0.3x), takes a haircut while the
/// signal is decaying, and earns a 15% bonus on a hot rolling streak.
pub fn adaptive_weight(base: f64, perf: Option<&SignalPerformance>) -> f64 {
    let Some(perf) = perf else {
        return base;
    };
    if perf.total < 20 {
        return base;
    }
    let mut weight = base * (2.0 * perf.accuracy()).max(0.3);
    if perf.decaying {
        weight *= perf.decay_factor.max(0.4);
    }
    if let Some(rolling) = perf.rolling_accuracy() {
        if rolling > 0.70 {
            weight *= 1.15;
        }
    }
    weight
}

/// Combine weighted contributions into the posterior. Pure so the arithmetic
/// is testable against hand-computed cases.
pub fn combine(
    market_prob: f64,
    contributions: Vec<SignalContribution>,
    damper: f64,
    total_resolutions: u64,
) -> PosteriorEstimate {
    let active: Vec<&SignalContribution> =
        contributions.iter().filter(|c| c.raw_llr != 0.0).collect();
    let active_signal_count = active.len();
    let signals_agree = active_signal_count > 0
        && (active.iter().all(|c| c.raw_llr > 0.0) || active.iter().all(|c| c.raw_llr < 0.0));

    let llr_sum: f64 = active.iter().map(|c| c.scaled_llr).sum();
    let posterior_prob = logistic(logit(market_prob) + damper * llr_sum).clamp(0.01, 0.99);
    let edge = posterior_prob - market_prob;

    let (credible_low, credible_high) = credible_interval(
        posterior_prob,
        active_signal_count,
        signals_agree,
        total_resolutions,
    );

    let confidence = if edge.abs() >= 0.015 && active_signal_count >= 3 && signals_agree {
        ConfidenceTier::High
    } else if edge.abs() >= 0.008 && active_signal_count >= 2 {
        ConfidenceTier::Medium
    } else {
        ConfidenceTier::Low
    };

    PosteriorEstimate {
        posterior_prob,
        market_prob,
        edge,
        confidence,
        credible_low: credible_low.min(posterior_prob),
        credible_high: credible_high.max(posterior_prob),
        active_signal_count,
        signals_agree,
        damper,
        contributions,
    }
}

/// 95% interval from a Beta pseudo-posterior via its normal approximation.
fn credible_interval(
    posterior: f64,
    active_signals: usize,
    agree: bool,
    total_resolutions: u64,
) -> (f64, f64) {
    let per_signal = if agree { 15.0 } else { 8.0 };
    let effective_n =
        5.0 + active_signals as f64 * per_signal + 0.1 * total_resolutions as f64;

    let alpha = (posterior * effective_n).max(0.5);
    let beta = ((1.0 - posterior) * effective_n).max(0.5);
    let mean = alpha / (alpha + beta);
    let variance = alpha * beta / ((alpha + beta).powi(2) * (alpha + beta + 1.0));
    let sd = variance.sqrt();

    let z = Normal::new(0.0, 1.0)
        .expect("standard normal")
        .inverse_cdf(0.975);

    (
        (mean - z * sd).clamp(0.01, 0.99),
        (mean + z * sd).clamp(0.01, 0.99),
    )
}

/// Everything the estimator can read about one market at estimation time.
#[derive(Default)]
pub struct EvidenceBundle<'a> {
    pub clean_book: Option<&'a OrderBook>,
    pub history: &'a [PricePoint],
    pub news: Option<&'a NewsSentiment>,
    pub consensus: Option<&'a Consensus>,
}

pub struct ProbabilityEngine {
    calibration: Arc<CalibrationStore>,
}

impl ProbabilityEngine {
    pub fn new(calibration: Arc<CalibrationStore>) -> Self {
        Self { calibration }
    }

    pub fn estimate(&self, snapshot: &MarketSnapshot, evidence: &EvidenceBundle<'_>) -> PosteriorEstimate {
        let view = self.calibration.view();
        let market_prob = snapshot.yes_price;

        let mut raw: Vec<RawSignal> = Vec::with_capacity(7);
        if let Some(book) = evidence.clean_book {
            raw.extend(signals::orderbook_imbalance(book, market_prob));
            raw.extend(signals::depth_walls(book));
        }
        raw.extend(signals::price_stability(evidence.history));
        if let Some(hours) = snapshot.hours_to_expiry() {
            raw.extend(signals::time_decay(hours / 24.0, market_prob));
        }
        raw.extend(signals::historical_calibration(&view, market_prob));
        if let Some(news) = evidence.news {
            raw.extend(signals::news_sentiment(news));
        }
        if let Some(consensus) = evidence.consensus {
            raw.extend(signals::bookmaker_consensus(consensus, market_prob));
        }

        let contributions = weigh(raw, &view);
        let (_category, trust) = category_trust(&snapshot.question);
        let damper = efficiency_damper(snapshot.volume_24h, snapshot.liquidity, trust);

        combine(market_prob, contributions, damper, view.total_resolutions)
    }
}

fn weigh(raw: Vec<RawSignal>, view: &CalibrationView) -> Vec<SignalContribution> {
    raw.into_iter()
        .map(|signal| {
            let weight = adaptive_weight(signal.base_weight, view.signals.get(signal.name));
            SignalContribution {
                name: signal.name.to_string(),
                raw_llr: signal.raw_llr,
                weight,
                scaled_llr: signal.raw_llr * weight,
                data: signal.data,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    fn contribution(name: &str, raw_llr: f64, weight: f64) -> SignalContribution {
        SignalContribution {
            name: name.to_string(),
            raw_llr,
            weight,
            scaled_llr: raw_llr * weight,
            data: json!({}),
        }
    }

    #[test]
    fn posterior_matches_hand_computation() {
        // market 0.55, orderbook +0.12 @ 0.30, calibration +0.08 @ 0.35,
        // damper 0.90: posterior ~ 0.5642, edge ~ +0.0142, MEDIUM.
        let estimate = combine(
            0.55,
            vec![
                contribution("orderbook_imbalance", 0.12, 0.30),
                contribution("historical_calibration", 0.08, 0.35),
            ],
            0.90,
            0,
        );
        assert!((estimate.posterior_prob - 0.5642).abs() < 5e-4);
        assert!((estimate.edge - 0.0142).abs() < 5e-4);
        assert_eq!(estimate.active_signal_count, 2);
        assert!(estimate.signals_agree);
        assert_eq!(estimate.confidence, ConfidenceTier::Medium);
    }

    #[test]
    fn interval_brackets_posterior() {
        for &(p, signals, agree) in &[(0.5, 2, true), (0.9, 4, false), (0.05, 1, true)] {
            let contributions = (0..signals)
                .map(|i| contribution("s", if agree { 0.1 } else { 0.1 * (-1f64).powi(i) }, 0.3))
                .collect();
            let estimate = combine(p, contributions, 1.0, 100);
            assert!(estimate.credible_low <= estimate.posterior_prob);
            assert!(estimate.posterior_prob <= estimate.credible_high);
            assert!(estimate.credible_low >= 0.01);
            assert!(estimate.credible_high <= 0.99);
        }
    }

    #[test]
    fn more_evidence_tightens_interval() {
        let wide = combine(0.6, vec![contribution("a", 0.1, 0.3)], 1.0, 0);
        let narrow = combine(
            0.6,
            vec![
                contribution("a", 0.1, 0.3),
                contribution("b", 0.1, 0.3),
                contribution("c", 0.1, 0.3),
                contribution("d", 0.1, 0.3),
            ],
            1.0,
            500,
        );
        let wide_span = wide.credible_high - wide.credible_low;
        let narrow_span = narrow.credible_high - narrow.credible_low;
        assert!(narrow_span < wide_span);
    }

    #[test]
    fn disagreement_blocks_high_confidence() {
        let estimate = combine(
            0.5,
            vec![
                contribution("a", 0.4, 0.4),
                contribution("b", 0.4, 0.4),
                contribution("c", -0.05, 0.4),
            ],
            1.0,
            0,
        );
        assert!(!estimate.signals_agree);
        assert_ne!(estimate.confidence, ConfidenceTier::High);
    }

    #[test]
    fn damper_shrinks_with_volume_and_trust() {
        let quiet = efficiency_damper(1_000.0, 1_000.0, 0.62);
        let busy = efficiency_damper(5_000_000.0, 2_000_000.0, 0.88);
        assert!(busy < quiet);
        assert!(busy >= 0.78);
        assert!(quiet <= 1.0);
    }

    #[test]
    fn category_detection_is_keyword_based() {
        assert_eq!(category_trust("Will the Lakers win the NBA title?").0, "sports");
        assert_eq!(category_trust("Will Bitcoin close above 100k?").0, "crypto");
        assert_eq!(category_trust("Will the incumbent win the election?").0, "politics");
        assert_eq!(category_trust("Will it rain in Paris tomorrow?").0, "other");
    }

    fn perf(correct: u64, total: u64, rolling_hits: usize, rolling_len: usize, decaying: bool, factor: f64) -> SignalPerformance {
        let mut rolling = VecDeque::new();
        for i in 0..rolling_len {
            rolling.push_back(i < rolling_hits);
        }
        SignalPerformance {
            correct,
            total,
            sum_edge_contribution: 0.0,
            rolling,
            decaying,
            decay_factor: factor,
        }
    }

    #[test]
    fn adaptive_weight_needs_twenty_samples() {
        let p = perf(9, 10, 9, 10, false, 1.0);
        assert_eq!(adaptive_weight(0.3, Some(&p)), 0.3);
    }

    #[test]
    fn adaptive_weight_tracks_accuracy() {
        // 70% accurate, hot rolling streak: 0.3 * 1.4 * 1.15.
        let p = perf(21, 30, 25, 30, false, 1.0);
        let w = adaptive_weight(0.3, Some(&p));
        assert!((w - 0.3 * 1.4 * 1.15).abs() < 1e-9);

        // Terrible signal floors at 0.3x.
        let bad = perf(2, 30, 2, 30, false, 1.0);
        let w = adaptive_weight(0.3, Some(&bad));
        assert!((w - 0.09).abs() < 1e-9);
    }

    #[test]
    fn decay_haircut_applies() {
        let p = perf(15, 30, 5, 30, true, 0.5);
        let w = adaptive_weight(0.3, Some(&p));
        // 0.3 * max(0.3, 1.0) * 0.5
        assert!((w - 0.15).abs() < 1e-9);
    }
}
