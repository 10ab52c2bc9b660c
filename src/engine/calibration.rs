//! Historical calibration store.
//!
//! Resolutions land in 2.5% price buckets; once enough buckets have depth an
//! isotonic (PAVA) map turns market price into an empirically calibrated
//! probability. Per-signal accuracy is tracked with a rolling window so a
//! signal whose recent performance decays loses weight in the estimator.
//!
//! Only the resolution path writes. Readers take an immutable `Arc` view,
//! so a probability estimate never observes a half-applied resolution.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 2.5% slices over [0, 1].
pub const BUCKET_COUNT: usize = 40;
/// PAVA retrains after this many resolutions.
const ISOTONIC_RETRAIN_EVERY: u64 = 25;
/// Decay flags refresh after this many resolutions.
const DECAY_CHECK_EVERY: u64 = 10;
/// Rolling outcome window per signal.
pub const ROLLING_WINDOW: usize = 30;
/// Buckets need this many samples to join the isotonic fit.
const MIN_BUCKET_SAMPLES: u64 = 5;
/// The fit needs at least this many eligible buckets.
const MIN_ISOTONIC_BUCKETS: usize = 3;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub samples: u64,
    pub resolved_yes: u64,
}

impl CalibrationBucket {
    pub fn rate(&self) -> Option<f64> {
        if self.samples == 0 {
            None
        } else {
            Some(self.resolved_yes as f64 / self.samples as f64)
        }
    }
}

/// One step of the isotonic map; rates are non-decreasing across segments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IsotonicSegment {
    pub midpoint: f64,
    pub rate: f64,
}

/// All-time and rolling accuracy for one evidence signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPerformance {
    pub correct: u64,
    pub total: u64,
    pub sum_edge_contribution: f64,
    pub rolling: VecDeque<bool>,
    pub decaying: bool,
    pub decay_factor: f64,
}

impl Default for SignalPerformance {
    fn default() -> Self {
        Self {
            correct: 0,
            total: 0,
            sum_edge_contribution: 0.0,
            rolling: VecDeque::with_capacity(ROLLING_WINDOW),
            decaying: false,
            decay_factor: 1.0,
        }
    }
}

impl SignalPerformance {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn rolling_accuracy(&self) -> Option<f64> {
        if self.rolling.len() < 10 {
            return None;
        }
        let hits = self.rolling.iter().filter(|&&c| c).count();
        Some(hits as f64 / self.rolling.len() as f64)
    }

    fn record(&mut self, was_correct: bool, edge_contribution: f64) {
        self.total += 1;
        if was_correct {
            self.correct += 1;
        }
        self.sum_edge_contribution += edge_contribution;
        if self.rolling.len() >= ROLLING_WINDOW {
            self.rolling.pop_front();
        }
        self.rolling.push_back(was_correct);
    }
}

/// One signal's verdict attached to a resolution.
#[derive(Debug, Clone)]
pub struct SignalOutcome {
    pub name: String,
    pub was_correct: bool,
    pub edge_contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalibrationState {
    buckets: Vec<CalibrationBucket>,
    total_resolutions: u64,
    isotonic: Option<Vec<IsotonicSegment>>,
    signals: HashMap<String, SignalPerformance>,
    saved_at: i64,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            buckets: vec![CalibrationBucket::default(); BUCKET_COUNT],
            total_resolutions: 0,
            isotonic: None,
            signals: HashMap::new(),
            saved_at: 0,
        }
    }
}

/// Immutable read view handed to the estimator.
#[derive(Debug, Clone, Default)]
pub struct CalibrationView {
    pub buckets: Vec<CalibrationBucket>,
    pub total_resolutions: u64,
    pub isotonic: Option<Vec<IsotonicSegment>>,
    pub signals: HashMap<String, SignalPerformance>,
}

pub struct CalibrationStore {
    state: Mutex<CalibrationState>,
    view: ArcSwap<CalibrationView>,
    path: Option<PathBuf>,
}

impl CalibrationStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        let state = path
            .as_ref()
            .and_then(|p| match Self::load_state(p) {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!(error = %e, "no usable calibration file; starting fresh");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            view: ArcSwap::from_pointee(Self::build_view(&state)),
            state: Mutex::new(state),
            path,
        }
    }

    pub fn bucket_index(market_prob: f64) -> usize {
        ((market_prob.clamp(0.0, 1.0) * BUCKET_COUNT as f64).floor() as usize)
            .min(BUCKET_COUNT - 1)
    }

    pub fn bucket_midpoint(index: usize) -> f64 {
        (index as f64 + 0.5) / BUCKET_COUNT as f64
    }

    /// Record one resolved market. Bucket counters, per-signal performance,
    /// the isotonic map and decay flags all update behind a single lock; the
    /// read view swaps atomically at the end.
    pub fn record_resolution(
        &self,
        market_prob: f64,
        outcome_yes: bool,
        signal_outcomes: &[SignalOutcome],
    ) {
        let mut state = self.state.lock();

        let index = Self::bucket_index(market_prob);
        state.buckets[index].samples += 1;
        if outcome_yes {
            state.buckets[index].resolved_yes += 1;
        }
        state.total_resolutions += 1;

        for outcome in signal_outcomes {
            state
                .signals
                .entry(outcome.name.clone())
                .or_default()
                .record(outcome.was_correct, outcome.edge_contribution);
        }

        if state.total_resolutions % ISOTONIC_RETRAIN_EVERY == 0 {
            match train_isotonic(&state.buckets) {
                Some(map) => {
                    info!(segments = map.len(), "isotonic calibration retrained");
                    state.isotonic = Some(map);
                }
                // Not enough depth yet; keep whatever map was active.
                None => debug!("isotonic retrain skipped; insufficient bucket depth"),
            }
        }

        if state.total_resolutions % DECAY_CHECK_EVERY == 0 {
            refresh_decay_flags(&mut state.signals);
        }

        self.view.store(Arc::new(Self::build_view(&state)));

        if let Some(path) = &self.path {
            state.saved_at = chrono::Utc::now().timestamp();
            if let Err(e) = Self::save_state(path, &state) {
                warn!(error = %e, "calibration save failed; continuing in memory");
            }
        }
    }

    /// Consistent snapshot for estimation reads.
    pub fn view(&self) -> Arc<CalibrationView> {
        self.view.load_full()
    }

    fn build_view(state: &CalibrationState) -> CalibrationView {
        CalibrationView {
            buckets: state.buckets.clone(),
            total_resolutions: state.total_resolutions,
            isotonic: state.isotonic.clone(),
            signals: state.signals.clone(),
        }
    }

    fn load_state(path: &PathBuf) -> Result<CalibrationState> {
        let raw = std::fs::read_to_string(path).context("read calibration file")?;
        let state: CalibrationState =
            serde_json::from_str(&raw).context("parse calibration file")?;
        if state.buckets.len() != BUCKET_COUNT {
            anyhow::bail!("calibration file has {} buckets", state.buckets.len());
        }
        Ok(state)
    }

    fn save_state(path: &PathBuf, state: &CalibrationState) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string(state).context("serialize calibration")?;
        std::fs::write(path, json).context("write calibration file")?;
        Ok(())
    }
}

/// Interpolated calibrated probability for `market_prob`, with the sample
/// weight the estimator should give it. Falls back to the raw bucket rate
/// when no isotonic map exists yet.
pub fn calibrated_probability(view: &CalibrationView, market_prob: f64) -> Option<(f64, f64)> {
    if let Some(map) = &view.isotonic {
        if let Some(rate) = interpolate(map, market_prob) {
            let weight = (view.total_resolutions as f64 / 200.0).min(1.0);
            return Some((rate, weight));
        }
    }

    let bucket = view.buckets[CalibrationStore::bucket_index(market_prob)];
    let rate = bucket.rate()?;
    let weight = (bucket.samples as f64 / 80.0).min(1.0);
    Some((rate, weight))
}

fn interpolate(map: &[IsotonicSegment], p: f64) -> Option<f64> {
    if map.is_empty() {
        return None;
    }
    if p <= map[0].midpoint {
        return Some(map[0].rate);
    }
    if p >= map[map.len() - 1].midpoint {
        return Some(map[map.len() - 1].rate);
    }
    for pair in map.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if p >= lo.midpoint && p <= hi.midpoint {
            let span = hi.midpoint - lo.midpoint;
            if span <= 0.0 {
                return Some(lo.rate);
            }
            let t = (p - lo.midpoint) / span;
            return Some(lo.rate + t * (hi.rate - lo.rate));
        }
    }
    None
}

fn train_isotonic(buckets: &[CalibrationBucket]) -> Option<Vec<IsotonicSegment>> {
    let points: Vec<(f64, f64, f64)> = buckets
        .iter()
        .enumerate()
        .filter(|(_, b)| b.samples >= MIN_BUCKET_SAMPLES)
        .map(|(i, b)| {
            (
                CalibrationStore::bucket_midpoint(i),
                b.rate().unwrap_or(0.0),
                b.samples as f64,
            )
        })
        .collect();

    if points.len() < MIN_ISOTONIC_BUCKETS {
        return None;
    }
    Some(pool_adjacent_violators(&points))
}

/// Pool-Adjacent-Violators over `(midpoint, rate, weight)` points sorted by
/// midpoint. Adjacent blocks whose averages violate monotonicity merge until
/// the sequence of rates is non-decreasing.
pub fn pool_adjacent_violators(points: &[(f64, f64, f64)]) -> Vec<IsotonicSegment> {
    #[derive(Clone, Copy)]
    struct Block {
        midpoint_weighted: f64,
        rate_weighted: f64,
        weight: f64,
    }

    let mut blocks: Vec<Block> = Vec::with_capacity(points.len());
    for &(midpoint, rate, weight) in points {
        blocks.push(Block {
            midpoint_weighted: midpoint * weight,
            rate_weighted: rate * weight,
            weight,
        });
        // Merge backwards while the previous block's mean exceeds ours.
        while blocks.len() >= 2 {
            let n = blocks.len();
            let prev_rate = blocks[n - 2].rate_weighted / blocks[n - 2].weight;
            let cur_rate = blocks[n - 1].rate_weighted / blocks[n - 1].weight;
            if prev_rate <= cur_rate {
                break;
            }
            let merged = Block {
                midpoint_weighted: blocks[n - 2].midpoint_weighted + blocks[n - 1].midpoint_weighted,
                rate_weighted: blocks[n - 2].rate_weighted + blocks[n - 1].rate_weighted,
                weight: blocks[n - 2].weight + blocks[n - 1].weight,
            };
            blocks.truncate(n - 2);
            blocks.push(merged);
        }
    }

    blocks
        .iter()
        .map(|b| IsotonicSegment {
            midpoint: b.midpoint_weighted / b.weight,
            rate: b.rate_weighted / b.weight,
        })
        .collect()
}

fn refresh_decay_flags(signals: &mut HashMap<String, SignalPerformance>) {
    for (name, perf) in signals.iter_mut() {
        let Some(rolling) = perf.rolling_accuracy() else {
            perf.decaying = false;
            perf.decay_factor = 1.0;
            continue;
        };
        let all_time = perf.accuracy();
        if all_time > 0.0 && rolling < 0.85 * all_time {
            perf.decaying = true;
            perf.decay_factor = rolling / all_time.max(0.01);
            debug!(signal = %name, rolling, all_time, "signal accuracy decaying");
        } else {
            perf.decaying = false;
            perf.decay_factor = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pava_merges_violating_pair() {
        let points = vec![
            (0.1, 0.05, 10.0),
            (0.2, 0.18, 10.0),
            (0.3, 0.15, 10.0),
            (0.4, 0.40, 10.0),
        ];
        let map = pool_adjacent_violators(&points);
        assert_eq!(map.len(), 3);
        assert!((map[0].midpoint - 0.1).abs() < 1e-12);
        assert!((map[0].rate - 0.05).abs() < 1e-12);
        assert!((map[1].midpoint - 0.25).abs() < 1e-12);
        assert!((map[1].rate - 0.165).abs() < 1e-12);
        assert!((map[2].rate - 0.40).abs() < 1e-12);
    }

    #[test]
    fn pava_output_is_non_decreasing() {
        let points = vec![
            (0.1, 0.9, 5.0),
            (0.2, 0.1, 20.0),
            (0.3, 0.5, 10.0),
            (0.4, 0.2, 15.0),
            (0.5, 0.8, 5.0),
        ];
        let map = pool_adjacent_violators(&points);
        for pair in map.windows(2) {
            assert!(pair[0].rate <= pair[1].rate + 1e-12);
        }
    }

    #[test]
    fn bucket_totals_match_resolution_count() {
        let store = CalibrationStore::new(None);
        for i in 0..37 {
            let p = (i as f64 % 10.0) / 10.0 + 0.05;
            store.record_resolution(p, i % 3 == 0, &[]);
        }
        let view = store.view();
        let total: u64 = view.buckets.iter().map(|b| b.samples).sum();
        assert_eq!(total, 37);
        assert_eq!(view.total_resolutions, 37);
    }

    #[test]
    fn isotonic_trains_after_25_with_enough_buckets() {
        let store = CalibrationStore::new(None);
        // Three buckets with >= 5 samples each plus filler elsewhere.
        for _ in 0..8 {
            store.record_resolution(0.22, false, &[]);
        }
        for _ in 0..8 {
            store.record_resolution(0.52, true, &[]);
        }
        for i in 0..9 {
            store.record_resolution(0.82, i % 4 != 0, &[]);
        }
        let view = store.view();
        assert_eq!(view.total_resolutions, 25);
        let map = view.isotonic.as_ref().expect("map after 25 resolutions");
        for pair in map.windows(2) {
            assert!(pair[0].rate <= pair[1].rate + 1e-12);
        }
    }

    #[test]
    fn rolling_window_is_bounded() {
        let store = CalibrationStore::new(None);
        for i in 0..60 {
            store.record_resolution(
                0.5,
                true,
                &[SignalOutcome {
                    name: "orderbook_imbalance".to_string(),
                    was_correct: i % 2 == 0,
                    edge_contribution: 0.1,
                }],
            );
        }
        let view = store.view();
        let perf = &view.signals["orderbook_imbalance"];
        assert_eq!(perf.total, 60);
        assert!(perf.correct <= perf.total);
        assert_eq!(perf.rolling.len(), ROLLING_WINDOW);
    }

    #[test]
    fn decay_flag_set_when_recent_accuracy_drops() {
        let store = CalibrationStore::new(None);
        // 30 correct outcomes, then 30 misses: rolling accuracy collapses
        // while all-time sits near 0.5.
        for _ in 0..30 {
            store.record_resolution(
                0.5,
                true,
                &[SignalOutcome {
                    name: "momentum".to_string(),
                    was_correct: true,
                    edge_contribution: 0.05,
                }],
            );
        }
        for _ in 0..30 {
            store.record_resolution(
                0.5,
                true,
                &[SignalOutcome {
                    name: "momentum".to_string(),
                    was_correct: false,
                    edge_contribution: 0.05,
                }],
            );
        }
        let view = store.view();
        let perf = &view.signals["momentum"];
        assert!(perf.decaying);
        assert!(perf.decay_factor < 1.0);
    }

    #[test]
    fn calibrated_probability_falls_back_to_bucket_rate() {
        let store = CalibrationStore::new(None);
        for i in 0..10 {
            store.record_resolution(0.51, i < 7, &[]);
        }
        let view = store.view();
        assert!(view.isotonic.is_none());
        let (rate, weight) = calibrated_probability(&view, 0.51).unwrap();
        assert!((rate - 0.7).abs() < 1e-12);
        assert!((weight - 10.0 / 80.0).abs() < 1e-12);
    }

    #[test]
    fn interpolation_between_segments() {
        let map = vec![
            IsotonicSegment { midpoint: 0.2, rate: 0.1 },
            IsotonicSegment { midpoint: 0.4, rate: 0.3 },
        ];
        assert!((interpolate(&map, 0.3).unwrap() - 0.2).abs() < 1e-12);
        assert!((interpolate(&map, 0.1).unwrap() - 0.1).abs() < 1e-12);
        assert!((interpolate(&map, 0.9).unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        {
            let store = CalibrationStore::new(Some(path.clone()));
            for i in 0..12 {
                store.record_resolution(0.33, i % 2 == 0, &[]);
            }
        }
        let reloaded = CalibrationStore::new(Some(path));
        assert_eq!(reloaded.view().total_resolutions, 12);
    }
}
