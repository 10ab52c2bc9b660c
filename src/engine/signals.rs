//! Evidence signal builders.
//!
//! Each builder inspects one evidence source and yields a raw log-likelihood
//! ratio plus structured data for the audit trail. A builder that has nothing
//! to say returns `None`; the estimator never sees zero-LLR contributions.

use serde_json::{json, Value};

use crate::engine::calibration::{calibrated_probability, CalibrationView};
use crate::engine::logodds::logit;
use crate::models::PricePoint;
use crate::scrapers::book_store::{find_walls, Wall, WALL_MIN_SIZE};
use crate::scrapers::news::NewsSentiment;
use crate::scrapers::odds_api::Consensus;
use crate::scrapers::polymarket::OrderBook;

pub const SIG_ORDERBOOK_IMBALANCE: &str = "orderbook_imbalance";
pub const SIG_PRICE_STABILITY: &str = "price_stability";
pub const SIG_TIME_DECAY: &str = "time_decay";
pub const SIG_CALIBRATION: &str = "historical_calibration";
pub const SIG_DEPTH_WALLS: &str = "depth_walls";
pub const SIG_NEWS: &str = "news_sentiment";
pub const SIG_BOOKMAKER: &str = "bookmaker_consensus";

/// Raw output of one builder before adaptive weighting.
#[derive(Debug, Clone)]
pub struct RawSignal {
    pub name: &'static str,
    pub raw_llr: f64,
    /// Base weight before the accuracy multiplier.
    pub base_weight: f64,
    pub data: Value,
}

/// Concentric bands around the market price: (half-width, band weight).
const IMBALANCE_BANDS: [(f64, f64); 3] = [(0.03, 0.50), (0.08, 0.35), (0.15, 0.15)];
/// Bands with less distance-weighted volume than this are skipped.
const BAND_MIN_VOLUME: f64 = 200.0;

/// Distance-weighted bid/ask imbalance across three concentric price bands.
pub fn orderbook_imbalance(book: &OrderBook, market_price: f64) -> Option<RawSignal> {
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    let mut band_details = Vec::new();

    for (range, band_weight) in IMBALANCE_BANDS {
        let weigh = |orders: &[crate::scrapers::polymarket::Order]| {
            orders
                .iter()
                .filter(|o| (o.price - market_price).abs() <= range)
                .map(|o| o.size * (1.0 - (o.price - market_price).abs() / range))
                .sum::<f64>()
        };
        let bid_weighted = weigh(&book.bids);
        let ask_weighted = weigh(&book.asks);

        if bid_weighted + ask_weighted < BAND_MIN_VOLUME {
            continue;
        }

        let band_llr = if ask_weighted <= 0.0 {
            0.5
        } else if bid_weighted <= 0.0 {
            -0.5
        } else {
            ((bid_weighted / ask_weighted).ln() * 0.15).clamp(-0.5, 0.5)
        };

        weighted_sum += band_llr * band_weight;
        weight_sum += band_weight;
        band_details.push(json!({
            "range": range,
            "bid_weighted": bid_weighted,
            "ask_weighted": ask_weighted,
            "llr": band_llr,
        }));
    }

    if weight_sum <= 0.0 {
        return None;
    }
    let llr = weighted_sum / weight_sum;
    if llr == 0.0 {
        return None;
    }
    Some(RawSignal {
        name: SIG_ORDERBOOK_IMBALANCE,
        raw_llr: llr,
        base_weight: 0.30,
        data: json!({ "bands": band_details }),
    })
}

fn std_dev(prices: &[f64]) -> f64 {
    if prices.len() < 2 {
        return 0.0;
    }
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    let var = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / prices.len() as f64;
    var.sqrt()
}

/// Multi-timeframe stability: tight recent volatility on a high-probability
/// market pushes the posterior up; a volatile tape pushes it down.
pub fn price_stability(history: &[PricePoint]) -> Option<RawSignal> {
    if history.len() < 12 {
        return None;
    }
    let prices: Vec<f64> = history.iter().map(|p| p.price).collect();
    let window = |n: usize| &prices[prices.len().saturating_sub(n)..];

    let sigma_short = std_dev(window(5));
    let sigma_primary = std_dev(window(12));
    let mean_primary = window(12).iter().sum::<f64>() / window(12).len().max(1) as f64;

    let converging = if prices.len() >= 24 {
        let sigma_long = std_dev(window(24));
        sigma_long > 0.0 && (sigma_short - sigma_long) / sigma_long < -0.20
    } else {
        false
    };

    let mut llr = if sigma_primary < 0.01 && mean_primary >= 0.70 {
        0.15
    } else if sigma_primary < 0.02 && mean_primary >= 0.60 {
        0.08
    } else if sigma_primary > 0.05 {
        -(2.0 * sigma_primary).min(0.4)
    } else {
        0.0
    };
    if converging && llr > 0.0 {
        llr *= 1.3;
    }

    if llr == 0.0 {
        return None;
    }
    Some(RawSignal {
        name: SIG_PRICE_STABILITY,
        raw_llr: llr,
        base_weight: 0.25,
        data: json!({
            "sigma_short": sigma_short,
            "sigma_primary": sigma_primary,
            "mean_primary": mean_primary,
            "converging": converging,
        }),
    })
}

/// Time-to-expiry decay constant (days).
const TIME_DECAY_TAU: f64 = 3.0;

/// A favourite near expiry tends to stay a favourite; the push only applies
/// once the market already leans that way.
pub fn time_decay(days_left: f64, market_price: f64) -> Option<RawSignal> {
    if days_left <= 0.0 || market_price < 0.65 {
        return None;
    }
    let factor = (-days_left / TIME_DECAY_TAU).exp();
    let llr = 0.25 * factor;
    if llr == 0.0 {
        return None;
    }
    Some(RawSignal {
        name: SIG_TIME_DECAY,
        raw_llr: llr,
        base_weight: 0.15,
        data: json!({ "days_left": days_left, "factor": factor }),
    })
}

/// Where similar-priced markets historically resolved. The sample weight
/// comes from the calibration data itself.
pub fn historical_calibration(view: &CalibrationView, market_price: f64) -> Option<RawSignal> {
    let (calibrated, weight) = calibrated_probability(view, market_price)?;
    if weight <= 0.0 {
        return None;
    }
    let llr = logit(calibrated) - logit(market_price);
    if llr == 0.0 {
        return None;
    }
    Some(RawSignal {
        name: SIG_CALIBRATION,
        raw_llr: llr,
        base_weight: weight,
        data: json!({
            "calibrated": calibrated,
            "market": market_price,
            "sample_weight": weight,
            "isotonic": view.isotonic.is_some(),
        }),
    })
}

/// Unopposed near-price wall. A resting bid wall with no matching ask wall is
/// mildly bullish; the mirror case is mildly bearish.
pub fn depth_walls(book: &OrderBook) -> Option<RawSignal> {
    let walls = find_walls(book);
    let biggest = |is_bid: bool| -> Option<Wall> {
        walls
            .iter()
            .filter(|w| w.is_bid == is_bid && w.size >= WALL_MIN_SIZE)
            .copied()
            .max_by(|a, b| a.size.partial_cmp(&b.size).unwrap_or(std::cmp::Ordering::Equal))
    };

    let bid_wall = biggest(true);
    let ask_wall = biggest(false);

    let (wall, direction) = match (bid_wall, ask_wall) {
        (Some(b), None) => (b, 1.0),
        (None, Some(a)) => (a, -1.0),
        // Walls on both sides cancel; nothing unopposed to read.
        _ => return None,
    };

    let llr = direction * 0.2 * (wall.size / 20_000.0).min(1.0);
    Some(RawSignal {
        name: SIG_DEPTH_WALLS,
        raw_llr: llr,
        base_weight: 0.20,
        data: json!({
            "price": wall.price,
            "size": wall.size,
            "is_bid": wall.is_bid,
        }),
    })
}

/// Sentiment gate: weak or empty coverage contributes nothing.
pub fn news_sentiment(sentiment: &NewsSentiment) -> Option<RawSignal> {
    if sentiment.headline_count == 0 || sentiment.avg_sentiment.abs() <= 0.5 {
        return None;
    }
    if sentiment.llr == 0.0 {
        return None;
    }
    Some(RawSignal {
        name: SIG_NEWS,
        raw_llr: sentiment.llr,
        base_weight: 0.20,
        data: json!({
            "avg_sentiment": sentiment.avg_sentiment,
            "headline_count": sentiment.headline_count,
            "confidence": sentiment.confidence,
        }),
    })
}

/// Bookmaker consensus expressed as the log-odds gap to the market. Weight
/// scales with how many books price the event.
pub fn bookmaker_consensus(consensus: &Consensus, market_price: f64) -> Option<RawSignal> {
    if consensus.bookmaker_count < 2 {
        return None;
    }
    let llr = logit(consensus.prob) - logit(market_price);
    if llr == 0.0 {
        return None;
    }
    let weight = (consensus.bookmaker_count as f64 / 8.0).min(1.0) * 0.40;
    Some(RawSignal {
        name: SIG_BOOKMAKER,
        raw_llr: llr,
        base_weight: weight,
        data: json!({
            "consensus": consensus.prob,
            "bookmakers": consensus.bookmaker_count,
            "pinnacle": consensus.pinnacle_prob,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::polymarket::Order;

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        let mut b = OrderBook {
            bids: bids.iter().map(|&(price, size)| Order { price, size }).collect(),
            asks: asks.iter().map(|&(price, size)| Order { price, size }).collect(),
        };
        b.sort();
        b
    }

    fn history(prices: &[f64]) -> Vec<PricePoint> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                ts: i as i64 * 60,
                price,
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn imbalance_favours_heavier_bids() {
        let b = book(
            &[(0.49, 4000.0), (0.48, 3000.0)],
            &[(0.51, 500.0), (0.52, 400.0)],
        );
        let signal = orderbook_imbalance(&b, 0.50).unwrap();
        assert!(signal.raw_llr > 0.0);
        assert!(signal.raw_llr <= 0.5);
    }

    #[test]
    fn imbalance_skips_empty_bands() {
        let b = book(&[(0.10, 50.0)], &[(0.90, 50.0)]);
        // Everything is outside every band around 0.50 or below the volume
        // floor, so no signal.
        assert!(orderbook_imbalance(&b, 0.50).is_none());
    }

    #[test]
    fn stability_pushes_up_calm_favourites() {
        let signal = price_stability(&history(&[0.78; 12])).unwrap();
        assert!(signal.raw_llr > 0.0);
    }

    #[test]
    fn stability_penalises_volatile_tape() {
        let prices: Vec<f64> = (0..12)
            .map(|i| if i % 2 == 0 { 0.35 } else { 0.65 })
            .collect();
        let signal = price_stability(&history(&prices)).unwrap();
        assert!(signal.raw_llr < 0.0);
    }

    #[test]
    fn stability_requires_twelve_points() {
        assert!(price_stability(&history(&[0.5; 11])).is_none());
    }

    #[test]
    fn convergence_bonus_applies() {
        // Long window noisy, recent window flat at a high price.
        let mut prices = vec![0.55, 0.85, 0.60, 0.82, 0.58, 0.80, 0.62, 0.78, 0.65, 0.75, 0.68, 0.74];
        prices.extend_from_slice(&[0.72; 12]);
        let with_bonus = price_stability(&history(&prices)).unwrap();
        let flat_only = price_stability(&history(&[0.72; 12])).unwrap();
        assert!(with_bonus.raw_llr >= flat_only.raw_llr);
    }

    #[test]
    fn time_decay_only_for_favourites() {
        assert!(time_decay(1.0, 0.55).is_none());
        let signal = time_decay(1.0, 0.70).unwrap();
        assert!(signal.raw_llr > 0.0);
        // Further out means weaker push.
        let far = time_decay(10.0, 0.70).unwrap();
        assert!(far.raw_llr < signal.raw_llr);
    }

    #[test]
    fn lone_bid_wall_is_bullish_and_matched_walls_cancel() {
        let bullish = book(&[(0.48, 12_000.0)], &[(0.52, 300.0)]);
        let signal = depth_walls(&bullish).unwrap();
        assert!(signal.raw_llr > 0.0);

        let matched = book(&[(0.48, 12_000.0)], &[(0.52, 11_000.0)]);
        assert!(depth_walls(&matched).is_none());
    }

    #[test]
    fn weak_sentiment_is_gated() {
        let weak = NewsSentiment {
            avg_sentiment: 0.3,
            headline_count: 10,
            confidence: 0.5,
            llr: 0.09,
            headlines: Vec::new(),
        };
        assert!(news_sentiment(&weak).is_none());

        let strong = NewsSentiment {
            avg_sentiment: 0.8,
            headline_count: 10,
            confidence: 0.5,
            llr: 0.12,
            headlines: Vec::new(),
        };
        assert_eq!(news_sentiment(&strong).unwrap().raw_llr, 0.12);
    }

    #[test]
    fn single_bookmaker_contributes_nothing() {
        let consensus = Consensus {
            prob: 0.60,
            bookmaker_count: 1,
            pinnacle_prob: None,
        };
        assert!(bookmaker_consensus(&consensus, 0.50).is_none());
    }

    #[test]
    fn bookmaker_weight_scales_with_count() {
        let few = Consensus {
            prob: 0.60,
            bookmaker_count: 4,
            pinnacle_prob: None,
        };
        let many = Consensus {
            prob: 0.60,
            bookmaker_count: 20,
            pinnacle_prob: None,
        };
        let few_signal = bookmaker_consensus(&few, 0.50).unwrap();
        let many_signal = bookmaker_consensus(&many, 0.50).unwrap();
        assert!((few_signal.base_weight - 0.20).abs() < 1e-12);
        assert!((many_signal.base_weight - 0.40).abs() < 1e-12);
        // The LLR is the logit gap, independent of book count.
        assert!((few_signal.raw_llr - many_signal.raw_llr).abs() < 1e-12);
    }
}
