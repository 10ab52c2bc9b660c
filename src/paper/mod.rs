//! Paper-trading account with closed-loop learning.
//!
//! Opportunities become simulated fills with slippage; resolutions feed PnL
//! back into the bankroll, per-strategy aggregates, the calibration store
//! and the learned score thresholds. All state mutations go through one
//! lock: a trade can never be resolved twice and a busted bankroll blocks
//! new records until an explicit reset.

pub mod learning;
pub mod resolver;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::calibration::{CalibrationStore, SignalOutcome};
use crate::models::{ConfidenceTier, EngineError, EngineEvent, MarketSnapshot, Opportunity, Side};
use crate::paper::learning::{ThresholdBook, TradeOutcome};
use crate::risk::{slippage, FEE_RATE};
use crate::storage::SqliteStore;

/// Opportunities below this score are not worth a simulated fill.
pub const MIN_RECORD_SCORE: f64 = 25.0;
/// A repeated (market, strategy, side) within this window is a duplicate.
pub const DEDUP_WINDOW_MS: i64 = 180_000;
/// Learning cycle cadence, in resolutions.
const LEARN_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSource {
    Bot,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTrade {
    pub id: String,
    pub dedup_key: String,
    pub market_id: String,
    pub strategy: String,
    pub side: Side,
    /// Entry after slippage, capped at 0.99.
    pub entry_price: f64,
    pub raw_entry_price: f64,
    pub applied_slippage: f64,
    pub size_usd: f64,
    pub shares: f64,
    pub score: f64,
    pub confidence: ConfidenceTier,
    pub source: TradeSource,
    pub recorded_at: DateTime<Utc>,
    pub resolved: bool,
    pub outcome: Option<Side>,
    pub pnl: Option<f64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// One archived evidence signal for a market, kept so resolutions can score
/// signal accuracy after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSignal {
    pub name: String,
    pub raw_llr: f64,
    /// Side the signal leaned toward at recording time.
    pub direction: Side,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub bankroll: f64,
    pub starting_bankroll: f64,
    pub busted: bool,
    pub total_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub peak_bankroll: f64,
    pub max_drawdown: f64,
}

impl AccountState {
    fn new(bankroll: f64) -> Self {
        Self {
            bankroll,
            starting_bankroll: bankroll,
            busted: false,
            total_pnl: 0.0,
            wins: 0,
            losses: 0,
            win_streak: 0,
            loss_streak: 0,
            peak_bankroll: bankroll,
            max_drawdown: 0.0,
        }
    }
}

/// Per-strategy aggregates bucketed by score band and confidence tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyAggregate {
    pub trades: u32,
    pub wins: u32,
    pub total_pnl: f64,
    /// Keyed by 25-wide score band lower bound.
    pub by_score_band: HashMap<String, (u32, f64)>,
    /// Keyed by confidence tier.
    pub by_confidence: HashMap<String, (u32, f64)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PaperState {
    open: Vec<PaperTrade>,
    resolved: Vec<PaperTrade>,
    account: AccountState,
    #[serde(default)]
    strategy_stats: HashMap<String, StrategyAggregate>,
    #[serde(default)]
    recent_keys: HashMap<String, i64>,
    #[serde(default)]
    signal_snapshots: HashMap<String, Vec<ArchivedSignal>>,
    #[serde(default)]
    resolutions_since_learning: u32,
    saved_at: i64,
}

/// Reporting view of the account and book.
#[derive(Debug, Clone, Serialize)]
pub struct PaperSummary {
    pub account: AccountState,
    pub open_trades: usize,
    pub resolved_trades: usize,
    pub strategy_stats: HashMap<String, StrategyAggregate>,
}

pub struct PaperTrader {
    state: Mutex<PaperState>,
    calibration: Arc<CalibrationStore>,
    thresholds: Arc<ThresholdBook>,
    events: broadcast::Sender<EngineEvent>,
    path: Option<PathBuf>,
    storage: Option<Arc<SqliteStore>>,
}

impl PaperTrader {
    pub fn new(
        starting_bankroll: f64,
        calibration: Arc<CalibrationStore>,
        thresholds: Arc<ThresholdBook>,
        events: broadcast::Sender<EngineEvent>,
        path: Option<PathBuf>,
    ) -> Self {
        Self::with_storage(starting_bankroll, calibration, thresholds, events, path, None)
    }

    /// Trader that mirrors trades and calibration buckets into SQLite.
    pub fn with_storage(
        starting_bankroll: f64,
        calibration: Arc<CalibrationStore>,
        thresholds: Arc<ThresholdBook>,
        events: broadcast::Sender<EngineEvent>,
        path: Option<PathBuf>,
        storage: Option<Arc<SqliteStore>>,
    ) -> Self {
        let state = path
            .as_ref()
            .and_then(|p| match Self::load(p) {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!(error = %e, "no usable paper-trade state; starting fresh");
                    None
                }
            })
            .unwrap_or_else(|| PaperState {
                open: Vec::new(),
                resolved: Vec::new(),
                account: AccountState::new(starting_bankroll),
                strategy_stats: HashMap::new(),
                recent_keys: HashMap::new(),
                signal_snapshots: HashMap::new(),
                resolutions_since_learning: 0,
                saved_at: 0,
            });

        Self {
            state: Mutex::new(state),
            calibration,
            thresholds,
            events,
            path,
            storage,
        }
    }

    /// Record a scan's opportunities as simulated fills. A busted bankroll
    /// makes this a no-op until `reset`.
    pub fn record_scan_results(
        &self,
        opportunities: &[Opportunity],
        markets: &HashMap<String, Arc<MarketSnapshot>>,
        signal_snapshots: &HashMap<String, Vec<ArchivedSignal>>,
    ) -> Vec<String> {
        let mut state = self.state.lock();
        if state.account.busted {
            debug!("bankroll busted; scan results dropped");
            return Vec::new();
        }

        let now_ms = Utc::now().timestamp_millis();
        state.recent_keys.retain(|_, at| now_ms - *at <= DEDUP_WINDOW_MS);

        let mut recorded = Vec::new();
        for opp in opportunities {
            if opp.score < MIN_RECORD_SCORE {
                continue;
            }
            let key = opp.dedup_key();
            if state.recent_keys.contains_key(&key) {
                continue;
            }

            let liquidity = markets.get(&opp.market_id).map(|m| m.liquidity).unwrap_or(0.0);
            let bankroll = state.account.bankroll;
            let slip = slippage(opp.size_usd, liquidity);
            let entry_price = (opp.entry_price * (1.0 + slip)).min(0.99);

            // Kelly size capped at 5% of bankroll, floored at a token stake.
            let floor = 10f64.min(0.02 * bankroll);
            let size_usd = opp.size_usd.min(0.05 * bankroll).max(floor);
            if entry_price <= 0.0 || size_usd <= 0.0 {
                continue;
            }

            let trade = PaperTrade {
                id: Uuid::new_v4().to_string(),
                dedup_key: key.clone(),
                market_id: opp.market_id.clone(),
                strategy: opp.strategy.clone(),
                side: opp.side,
                entry_price,
                raw_entry_price: opp.entry_price,
                applied_slippage: slip,
                size_usd,
                shares: size_usd / entry_price,
                score: opp.score,
                confidence: opp.confidence,
                source: TradeSource::Bot,
                recorded_at: Utc::now(),
                resolved: false,
                outcome: None,
                pnl: None,
                resolved_at: None,
            };

            let _ = self.events.send(EngineEvent::TradeNew {
                trade_id: trade.id.clone(),
                market_id: trade.market_id.clone(),
                strategy: trade.strategy.clone(),
                side: trade.side,
                entry_price: trade.entry_price,
                size_usd: trade.size_usd,
            });

            state.recent_keys.insert(key, now_ms);
            recorded.push(trade.id.clone());
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.insert_trade(&trade) {
                    warn!(error = %e, "trade persist failed");
                }
            }
            state.open.push(trade);
        }

        for (market_id, signals) in signal_snapshots {
            if !signals.is_empty() {
                state.signal_snapshots.insert(market_id.clone(), signals.clone());
            }
        }

        if !recorded.is_empty() {
            info!(count = recorded.len(), "paper trades recorded");
            self.save(&mut state);
        }
        recorded
    }

    /// Record a user-entered trade. Manual trades resolve like bot trades
    /// but stay out of the learning state.
    pub fn record_manual(
        &self,
        market_id: &str,
        side: Side,
        entry_price: f64,
        size_usd: f64,
    ) -> Result<String, EngineError> {
        if !(entry_price > 0.0 && entry_price < 1.0) || size_usd <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "manual trade needs entry in (0,1) and positive size, got {entry_price}/{size_usd}"
            )));
        }
        let mut state = self.state.lock();
        if state.account.busted {
            return Err(EngineError::BankrollBusted);
        }

        let trade = PaperTrade {
            id: Uuid::new_v4().to_string(),
            dedup_key: format!("{market_id}|MANUAL|{}", side.as_str()),
            market_id: market_id.to_string(),
            strategy: "MANUAL".to_string(),
            side,
            entry_price,
            raw_entry_price: entry_price,
            applied_slippage: 0.0,
            size_usd,
            shares: size_usd / entry_price,
            score: 0.0,
            confidence: ConfidenceTier::Low,
            source: TradeSource::Manual,
            recorded_at: Utc::now(),
            resolved: false,
            outcome: None,
            pnl: None,
            resolved_at: None,
        };
        let id = trade.id.clone();
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.insert_trade(&trade) {
                warn!(error = %e, "trade persist failed");
            }
        }
        state.open.push(trade);
        self.save(&mut state);
        Ok(id)
    }

    /// Market ids with at least one open trade, oldest first.
    pub fn open_market_ids(&self, limit: usize) -> Vec<String> {
        let state = self.state.lock();
        let mut seen = Vec::new();
        for trade in &state.open {
            if !seen.contains(&trade.market_id) {
                seen.push(trade.market_id.clone());
                if seen.len() >= limit {
                    break;
                }
            }
        }
        seen
    }

    /// Resolve every open trade on a market against the ground-truth
    /// outcome. Returns the number of trades closed.
    pub fn resolve_market(&self, market_id: &str, outcome: Side) -> Result<usize, EngineError> {
        let mut state = self.state.lock();

        let indices: Vec<usize> = state
            .open
            .iter()
            .enumerate()
            .filter(|(_, t)| t.market_id == market_id)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            if state.resolved.iter().any(|t| t.market_id == market_id) {
                return Err(EngineError::AlreadyResolved(market_id.to_string()));
            }
            return Err(EngineError::NotFound(format!("no open trades for market {market_id}")));
        }

        let mut closed = 0usize;
        // Remove back-to-front so indices stay valid.
        for &index in indices.iter().rev() {
            let mut trade = state.open.remove(index);
            self.settle(&mut state, &mut trade, outcome);
            closed += 1;
        }

        // Score the archived evidence signals against the outcome and feed
        // the calibration store.
        if let Some(signals) = state.signal_snapshots.remove(market_id) {
            let market_prob = state
                .resolved
                .iter()
                .rev()
                .find(|t| t.market_id == market_id)
                .map(|t| match t.side {
                    Side::Yes => t.raw_entry_price,
                    Side::No => 1.0 - t.raw_entry_price,
                })
                .unwrap_or(0.5);

            let outcomes: Vec<SignalOutcome> = signals
                .iter()
                .map(|s| SignalOutcome {
                    name: s.name.clone(),
                    was_correct: s.direction == outcome,
                    edge_contribution: s.raw_llr.abs(),
                })
                .collect();
            for o in &outcomes {
                self.thresholds.record_signal_outcome(&o.name, o.was_correct);
            }
            self.calibration
                .record_resolution(market_prob, outcome == Side::Yes, &outcomes);

            // Mirror the touched bucket into the relational store.
            if let Some(storage) = &self.storage {
                let view = self.calibration.view();
                let index = CalibrationStore::bucket_index(market_prob);
                let bucket = view.buckets[index];
                if let Err(e) =
                    storage.upsert_calibration_bucket(index, bucket.samples, bucket.resolved_yes)
                {
                    warn!(error = %e, "calibration persist failed");
                }
            }
        }

        state.resolutions_since_learning += closed as u32;
        if state.resolutions_since_learning >= LEARN_EVERY {
            state.resolutions_since_learning = 0;
            let outcomes: Vec<TradeOutcome> = state
                .resolved
                .iter()
                .filter(|t| t.source == TradeSource::Bot)
                .map(|t| TradeOutcome {
                    strategy: t.strategy.clone(),
                    score: t.score,
                    pnl: t.pnl.unwrap_or(0.0),
                })
                .collect();
            self.thresholds.relearn(&outcomes);
        }

        self.save(&mut state);
        Ok(closed)
    }

    /// Per-trade resolution accounting: binary payout, fee only on positive
    /// gross, streaks and drawdown updated in resolution order.
    fn settle(&self, state: &mut PaperState, trade: &mut PaperTrade, outcome: Side) {
        let payout = if trade.side == outcome { 1.0 } else { 0.0 };
        let gross = (payout - trade.entry_price) * trade.shares;
        let fee = (FEE_RATE * gross).max(0.0);
        let net = gross - fee;

        trade.resolved = true;
        trade.outcome = Some(outcome);
        trade.pnl = Some(net);
        trade.resolved_at = Some(Utc::now());

        let account = &mut state.account;
        account.bankroll += net;
        account.total_pnl += net;
        if net > 0.0 {
            account.wins += 1;
            account.win_streak += 1;
            account.loss_streak = 0;
        } else {
            account.losses += 1;
            account.loss_streak += 1;
            account.win_streak = 0;
        }
        account.peak_bankroll = account.peak_bankroll.max(account.bankroll);
        if account.peak_bankroll > 0.0 {
            let drawdown = (account.peak_bankroll - account.bankroll) / account.peak_bankroll;
            account.max_drawdown = account.max_drawdown.max(drawdown);
        }
        if account.bankroll <= 0.0 && !account.busted {
            account.busted = true;
            warn!("paper bankroll exhausted; recording blocked until reset");
            let _ = self.events.send(EngineEvent::RiskWarning {
                message: "paper bankroll exhausted; recording blocked until reset".to_string(),
            });
        }

        if trade.source == TradeSource::Bot {
            let aggregate = state.strategy_stats.entry(trade.strategy.clone()).or_default();
            aggregate.trades += 1;
            if net > 0.0 {
                aggregate.wins += 1;
            }
            aggregate.total_pnl += net;
            let band = format!("{}", (trade.score / 25.0).floor() as i64 * 25);
            let band_entry = aggregate.by_score_band.entry(band).or_insert((0, 0.0));
            band_entry.0 += 1;
            band_entry.1 += net;
            let conf_entry = aggregate
                .by_confidence
                .entry(trade.confidence.as_str().to_string())
                .or_insert((0, 0.0));
            conf_entry.0 += 1;
            conf_entry.1 += net;
        }

        let _ = self.events.send(EngineEvent::TradeClosed {
            trade_id: trade.id.clone(),
            market_id: trade.market_id.clone(),
            outcome,
            pnl: net,
            bankroll: state.account.bankroll,
        });

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.mark_trade_resolved(trade) {
                warn!(error = %e, "trade resolution persist failed");
            }
        }
        state.resolved.push(trade.clone());
    }

    /// Close every outstanding trade as a loss. Used when a session ends
    /// with markets still open: marking them NO is the conservative call,
    /// matching the resolver's explicit-outcome-first rule.
    pub fn force_resolve_open(&self) -> usize {
        let mut state = self.state.lock();
        let mut closed = 0usize;
        while let Some(mut trade) = state.open.pop() {
            self.settle(&mut state, &mut trade, Side::No);
            closed += 1;
        }
        if closed > 0 {
            warn!(closed, "outstanding trades force-resolved NO");
            self.save(&mut state);
        }
        closed
    }

    /// Explicit reset out of the busted state. Open trades are cancelled;
    /// resolved history survives for reporting.
    pub fn reset(&self, bankroll: f64) {
        let mut state = self.state.lock();
        info!(bankroll, "paper account reset");
        state.account = AccountState::new(bankroll);
        state.open.clear();
        state.recent_keys.clear();
        state.signal_snapshots.clear();
        self.save(&mut state);
    }

    pub fn summary(&self) -> PaperSummary {
        let state = self.state.lock();
        PaperSummary {
            account: state.account.clone(),
            open_trades: state.open.len(),
            resolved_trades: state.resolved.len(),
            strategy_stats: state.strategy_stats.clone(),
        }
    }

    pub fn open_trades(&self) -> Vec<PaperTrade> {
        self.state.lock().open.clone()
    }

    pub fn resolved_trades(&self) -> Vec<PaperTrade> {
        self.state.lock().resolved.clone()
    }

    fn load(path: &PathBuf) -> Result<PaperState> {
        let raw = std::fs::read_to_string(path).context("read paper-trade state")?;
        serde_json::from_str(&raw).context("parse paper-trade state")
    }

    fn save(&self, state: &mut PaperState) {
        let Some(path) = &self.path else {
            return;
        };
        state.saved_at = Utc::now().timestamp();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match serde_json::to_string(&*state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(error = %e, "paper-trade state save failed");
                }
            }
            Err(e) => warn!(error = %e, "paper-trade state serialize failed"),
        }
    }
}
