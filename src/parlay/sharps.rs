//! Sharp-book probability and best-odds selection.
//!
//! Sharps (low-margin books that take informed action) anchor the true
//! probability; recreational books supply the price. The best-odds pick is
//! guarded against stale-quote outliers.

use crate::parlay::devig::devig;
use crate::scrapers::odds_api::{Bookmaker, OddsEvent};
use serde::Serialize;

/// Books treated as sharp, in preference order.
pub const SHARP_BOOKS: [&str; 4] = ["pinnacle", "matchbook", "betonlineag", "betfair_ex_uk"];

/// Sharps must agree within this spread for HIGH confidence.
const SHARP_AGREEMENT_SPREAD: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharpConfidence {
    High,
    Med,
    Low,
}

#[derive(Debug, Clone)]
pub struct SharpProbability {
    pub prob: f64,
    pub source: String,
    pub confidence: SharpConfidence,
}

/// Devigged probability for `outcome` in one book's market.
fn book_probability(book: &Bookmaker, market_key: &str, outcome: &str, point: Option<f64>) -> Option<f64> {
    let market = book.markets.iter().find(|m| m.key == market_key)?;
    let matching = |name: &str, p: Option<f64>| {
        name.eq_ignore_ascii_case(outcome) && (point.is_none() || p == point)
    };
    let index = market
        .outcomes
        .iter()
        .position(|o| matching(&o.name, o.point))?;
    let odds: Vec<f64> = market.outcomes.iter().map(|o| o.price).collect();
    let probs = devig(&odds);
    probs.get(index).copied()
}

/// True probability for an outcome: sharp average when sharps price it,
/// median across all books as the weak fallback.
pub fn sharp_probability(
    event: &OddsEvent,
    market_key: &str,
    outcome: &str,
    point: Option<f64>,
) -> Option<SharpProbability> {
    let mut sharp_probs: Vec<(String, f64)> = Vec::new();
    for sharp_key in SHARP_BOOKS {
        if let Some(book) = event.bookmakers.iter().find(|b| b.key == sharp_key) {
            if let Some(prob) = book_probability(book, market_key, outcome, point) {
                sharp_probs.push((sharp_key.to_string(), prob));
            }
        }
    }

    if !sharp_probs.is_empty() {
        let prob = sharp_probs.iter().map(|(_, p)| p).sum::<f64>() / sharp_probs.len() as f64;
        let max = sharp_probs.iter().map(|(_, p)| *p).fold(f64::MIN, f64::max);
        let min = sharp_probs.iter().map(|(_, p)| *p).fold(f64::MAX, f64::min);
        let confidence = if sharp_probs.len() >= 2 && (max - min) < SHARP_AGREEMENT_SPREAD {
            SharpConfidence::High
        } else {
            SharpConfidence::Med
        };
        return Some(SharpProbability {
            prob,
            source: sharp_probs[0].0.clone(),
            confidence,
        });
    }

    // Median over every book that prices the outcome.
    let mut all: Vec<f64> = event
        .bookmakers
        .iter()
        .filter_map(|b| book_probability(b, market_key, outcome, point))
        .collect();
    if all.len() < 3 {
        return None;
    }
    all.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if all.len() % 2 == 1 {
        all[all.len() / 2]
    } else {
        (all[all.len() / 2 - 1] + all[all.len() / 2]) / 2.0
    };
    Some(SharpProbability {
        prob: median,
        source: "median".to_string(),
        confidence: SharpConfidence::Low,
    })
}

#[derive(Debug, Clone)]
pub struct BestOdds {
    pub odds: f64,
    pub book: String,
    pub is_sharp: bool,
}

/// Best available decimal odds with an outlier guard: a quote far above the
/// field is more likely stale than generous.
pub fn best_odds(
    event: &OddsEvent,
    market_key: &str,
    outcome: &str,
    point: Option<f64>,
) -> Option<BestOdds> {
    let mut quotes: Vec<(String, f64)> = Vec::new();
    for book in &event.bookmakers {
        // Exchange lay prices are not backable quotes.
        if book.key.ends_with("_lay") {
            continue;
        }
        let Some(market) = book.markets.iter().find(|m| m.key == market_key) else {
            continue;
        };
        if let Some(o) = market.outcomes.iter().find(|o| {
            o.name.eq_ignore_ascii_case(outcome) && (point.is_none() || o.point == point)
        }) {
            if o.price > 1.0 {
                quotes.push((book.key.clone(), o.price));
            }
        }
    }
    if quotes.is_empty() {
        return None;
    }
    quotes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (mut book, mut odds) = quotes[0].clone();
    if quotes.len() >= 2 {
        let second = &quotes[1];
        let near_best = quotes.iter().filter(|(_, o)| *o >= odds / 1.15).count();
        if odds > second.1 * 1.15 || near_best < 2 {
            book = second.0.clone();
            odds = second.1;
        }
    }

    Some(BestOdds {
        is_sharp: SHARP_BOOKS.contains(&book.as_str()),
        book,
        odds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::odds_api::{BookmakerMarket, OddsOutcome};
    use chrono::Utc;

    fn h2h_book(key: &str, home: f64, away: f64) -> Bookmaker {
        Bookmaker {
            key: key.to_string(),
            title: key.to_string(),
            markets: vec![BookmakerMarket {
                key: "h2h".to_string(),
                outcomes: vec![
                    OddsOutcome { name: "Home".to_string(), price: home, point: None },
                    OddsOutcome { name: "Away".to_string(), price: away, point: None },
                ],
            }],
        }
    }

    fn event(books: Vec<Bookmaker>) -> OddsEvent {
        OddsEvent {
            id: "e1".to_string(),
            sport_key: "basketball_nba".to_string(),
            sport_title: "NBA".to_string(),
            commence_time: Utc::now() + chrono::Duration::hours(6),
            home_team: Some("Home".to_string()),
            away_team: Some("Away".to_string()),
            bookmakers: books,
        }
    }

    #[test]
    fn agreeing_sharps_give_high_confidence() {
        let e = event(vec![
            h2h_book("pinnacle", 1.85, 2.00),
            h2h_book("matchbook", 1.87, 1.98),
            h2h_book("draftkings", 1.80, 2.05),
        ]);
        let sharp = sharp_probability(&e, "h2h", "Home", None).unwrap();
        assert_eq!(sharp.confidence, SharpConfidence::High);
        assert!(sharp.prob > 0.5 && sharp.prob < 0.56);
    }

    #[test]
    fn lone_sharp_is_medium() {
        let e = event(vec![
            h2h_book("pinnacle", 1.85, 2.00),
            h2h_book("draftkings", 1.80, 2.05),
        ]);
        let sharp = sharp_probability(&e, "h2h", "Home", None).unwrap();
        assert_eq!(sharp.confidence, SharpConfidence::Med);
    }

    #[test]
    fn median_fallback_needs_three_books() {
        let two = event(vec![
            h2h_book("draftkings", 1.85, 2.00),
            h2h_book("fanduel", 1.87, 1.98),
        ]);
        assert!(sharp_probability(&two, "h2h", "Home", None).is_none());

        let three = event(vec![
            h2h_book("draftkings", 1.85, 2.00),
            h2h_book("fanduel", 1.87, 1.98),
            h2h_book("caesars", 1.83, 2.02),
        ]);
        let sharp = sharp_probability(&three, "h2h", "Home", None).unwrap();
        assert_eq!(sharp.confidence, SharpConfidence::Low);
        assert_eq!(sharp.source, "median");
    }

    #[test]
    fn outlier_quote_is_discarded() {
        let e = event(vec![
            h2h_book("draftkings", 2.60, 1.55),
            h2h_book("fanduel", 1.90, 1.95),
            h2h_book("caesars", 1.92, 1.93),
        ]);
        // 2.60 is >15% above the 1.92 second-best; the guard takes 1.92.
        let best = best_odds(&e, "h2h", "Home", None).unwrap();
        assert!((best.odds - 1.92).abs() < 1e-12);
    }

    #[test]
    fn tight_field_keeps_the_best() {
        let e = event(vec![
            h2h_book("draftkings", 1.95, 1.90),
            h2h_book("fanduel", 1.92, 1.93),
            h2h_book("pinnacle", 1.90, 1.95),
        ]);
        let best = best_odds(&e, "h2h", "Home", None).unwrap();
        assert!((best.odds - 1.95).abs() < 1e-12);
        assert_eq!(best.book, "draftkings");
        assert!(!best.is_sharp);
    }
}
