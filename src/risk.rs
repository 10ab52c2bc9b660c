//! Fees, slippage and fractional-Kelly position sizing.
//!
//! Every strategy prices its entries through this module so a trade that
//! looks profitable on paper stays profitable after costs.

use serde::{Deserialize, Serialize};

/// Winning-payout fee taken by the venue.
pub const FEE_RATE: f64 = 0.02;

/// Base slippage applied to every simulated fill.
pub const SLIPPAGE_BASE: f64 = 0.003;

/// Slippage fallback when the book reports no resting liquidity.
pub const SLIPPAGE_NO_LIQUIDITY: f64 = 0.009;

/// Expected slippage for a `size_usd` order against `liquidity_usd` of
/// resting depth.
pub fn slippage(size_usd: f64, liquidity_usd: f64) -> f64 {
    if liquidity_usd <= 0.0 {
        return SLIPPAGE_NO_LIQUIDITY;
    }
    SLIPPAGE_BASE + 0.5 * (size_usd / liquidity_usd)
}

/// Net expected value per unit stake of buying at `entry_price` with true
/// win probability `win_prob`. The fee applies only to the winning payout.
pub fn net_ev(win_prob: f64, entry_price: f64, slip: f64) -> f64 {
    let q = win_prob;
    let p = entry_price;
    q * (1.0 - p) * (1.0 - FEE_RATE) - (1.0 - q) * p - slip
}

/// Win probability at which the trade breaks even after fee and slippage.
pub fn break_even_prob(entry_price: f64, slip: f64) -> f64 {
    let p = entry_price;
    (p + slip) / ((1.0 - p) * (1.0 - FEE_RATE) + p)
}

/// Parameters for fee-adjusted Kelly sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyParams {
    pub bankroll: f64,
    /// Fractional Kelly multiplier (0.25 = quarter Kelly).
    pub kelly_fraction: f64,
    /// Maximum single position as a fraction of bankroll.
    pub max_exposure_pct: f64,
}

impl Default for KellyParams {
    fn default() -> Self {
        Self {
            bankroll: 1000.0,
            kelly_fraction: 0.25,
            max_exposure_pct: 0.05,
        }
    }
}

/// Result of the fee-adjusted Kelly calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellySize {
    pub stake_usd: f64,
    /// Full Kelly fraction before the fractional multiplier.
    pub full_fraction: f64,
    pub capped_by_liquidity: bool,
}

/// Fee-adjusted fractional Kelly stake.
///
/// Odds are net of the winning-payout fee: `b = (1/price - 1) * (1 - FEE)`.
/// The stake is additionally capped by exposure and by 5% of book liquidity;
/// a non-positive computed fraction sizes to zero.
pub fn kelly_stake(
    win_prob: f64,
    entry_price: f64,
    liquidity_usd: f64,
    params: &KellyParams,
) -> KellySize {
    if !(entry_price > 0.0 && entry_price < 1.0) || !(0.0..=1.0).contains(&win_prob) {
        return KellySize {
            stake_usd: 0.0,
            full_fraction: 0.0,
            capped_by_liquidity: false,
        };
    }

    let b = (1.0 / entry_price - 1.0) * (1.0 - FEE_RATE);
    if b <= 0.0 {
        return KellySize {
            stake_usd: 0.0,
            full_fraction: 0.0,
            capped_by_liquidity: false,
        };
    }

    let q = win_prob;
    let full = (b * q - (1.0 - q)) / b;
    if full <= 0.0 {
        return KellySize {
            stake_usd: 0.0,
            full_fraction: full,
            capped_by_liquidity: false,
        };
    }

    let fractional = full * params.kelly_fraction * params.bankroll;
    let exposure_cap = params.max_exposure_pct * params.bankroll;
    let liquidity_cap = 0.05 * liquidity_usd.max(0.0);

    let stake = fractional.min(exposure_cap).min(liquidity_cap).max(0.0);
    KellySize {
        stake_usd: stake,
        full_fraction: full,
        capped_by_liquidity: stake < fractional.min(exposure_cap) + f64::EPSILON
            && liquidity_cap < fractional.min(exposure_cap),
    }
}
