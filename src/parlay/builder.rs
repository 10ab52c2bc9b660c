//! Accumulator assembly: hygiene, leg selection, combination, grading.

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::parlay::correlation::{combined_probability, correlation, pairwise_iter};
use crate::parlay::sharps::{best_odds, sharp_probability, SharpConfidence};
use crate::scrapers::odds_api::OddsEvent;

/// Events need at least this many books to be priced honestly.
const MIN_BOOKMAKERS: usize = 3;
/// A quote at or below this means the outcome is effectively settled.
const SETTLED_ODDS: f64 = 1.10;

/// Per-market odds bands for a usable leg.
const ODDS_BAND_H2H: (f64, f64) = (1.20, 4.50);
const ODDS_BAND_SPREADS: (f64, f64) = (1.40, 3.50);
const ODDS_BAND_TOTALS: (f64, f64) = (1.40, 3.00);
/// True-probability bands (moneyline, then the looser line-market band).
const PROB_BAND_H2H: (f64, f64) = (0.15, 0.85);
const PROB_BAND_LINES: (f64, f64) = (0.10, 0.90);
/// Individual leg EV band.
const LEG_EV_BAND: (f64, f64) = (0.02, 0.10);

/// Acca validity bands.
const COMBINED_ODDS_BAND: (f64, f64) = (3.0, 50.0);
const ACCA_EV_BAND: (f64, f64) = (0.015, 0.35);
const MAX_AVG_CORRELATION: f64 = 0.15;

/// Candidate legs considered for combination.
const MAX_CANDIDATE_LEGS: usize = 12;
/// Kept-acca overlap ceiling.
const MAX_LEG_OVERLAP: f64 = 0.40;
/// Times one leg may appear across kept accas.
const MAX_LEG_REUSE: usize = 3;

const KELLY_DIVISOR: f64 = 4.0;
const KELLY_CAP: f64 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataQuality {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParlayLeg {
    pub event_id: String,
    pub sport: String,
    pub league: String,
    pub market_key: String,
    pub outcome: String,
    pub point: Option<f64>,
    pub true_prob: f64,
    pub sharp_source: String,
    pub sharp_confidence: SharpConfidence,
    pub best_odds: f64,
    pub book: String,
    pub book_is_sharp: bool,
    pub leg_ev: f64,
    pub data_quality: DataQuality,
}

impl ParlayLeg {
    fn key(&self) -> String {
        format!("{}|{}|{}|{:?}", self.event_id, self.market_key, self.outcome, self.point)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    S,
    A,
    B,
    C,
}

#[derive(Debug, Clone, Serialize)]
pub struct Parlay {
    pub legs: Vec<ParlayLeg>,
    pub combined_odds: f64,
    pub true_combined_prob: f64,
    pub book_implied_prob: f64,
    pub ev: f64,
    pub avg_correlation: f64,
    pub grade: Grade,
    pub grade_score: f64,
    pub kelly_stake: f64,
}

/// Data hygiene: started events, thin coverage and settled outcomes are out.
pub fn filter_events(events: &[OddsEvent]) -> Vec<&OddsEvent> {
    let now = Utc::now();
    events
        .iter()
        .filter(|e| e.commence_time > now)
        .filter(|e| e.bookmakers.len() >= MIN_BOOKMAKERS)
        .filter(|e| {
            !e.bookmakers.iter().any(|b| {
                b.markets
                    .iter()
                    .any(|m| m.outcomes.iter().any(|o| o.price <= SETTLED_ODDS))
            })
        })
        .collect()
}

fn odds_band(market_key: &str) -> (f64, f64) {
    match market_key {
        "spreads" => ODDS_BAND_SPREADS,
        "totals" => ODDS_BAND_TOTALS,
        _ => ODDS_BAND_H2H,
    }
}

fn prob_band(market_key: &str) -> (f64, f64) {
    if market_key == "h2h" {
        PROB_BAND_H2H
    } else {
        PROB_BAND_LINES
    }
}

/// Build the candidate leg, if the outcome passes every filter.
pub fn build_leg(
    event: &OddsEvent,
    market_key: &str,
    outcome: &str,
    point: Option<f64>,
) -> Option<ParlayLeg> {
    let sharp = sharp_probability(event, market_key, outcome, point)?;
    let best = best_odds(event, market_key, outcome, point)?;

    let (odds_lo, odds_hi) = odds_band(market_key);
    if !(odds_lo..=odds_hi).contains(&best.odds) {
        return None;
    }
    let (prob_lo, prob_hi) = prob_band(market_key);
    if !(prob_lo..=prob_hi).contains(&sharp.prob) {
        return None;
    }
    let leg_ev = sharp.prob * best.odds - 1.0;
    if !(LEG_EV_BAND.0..=LEG_EV_BAND.1).contains(&leg_ev) {
        return None;
    }

    Some(ParlayLeg {
        event_id: event.id.clone(),
        sport: event.sport().to_string(),
        league: event.league().to_string(),
        market_key: market_key.to_string(),
        outcome: outcome.to_string(),
        point,
        true_prob: sharp.prob,
        sharp_source: sharp.source,
        sharp_confidence: sharp.confidence,
        best_odds: best.odds,
        book: best.book,
        book_is_sharp: best.is_sharp,
        leg_ev,
        data_quality: match sharp.confidence {
            SharpConfidence::High => DataQuality::A,
            SharpConfidence::Med => DataQuality::B,
            SharpConfidence::Low => DataQuality::C,
        },
    })
}

/// All candidate legs across the filtered events, best EV first.
pub fn candidate_legs(events: &[&OddsEvent]) -> Vec<ParlayLeg> {
    let mut legs = Vec::new();
    for event in events {
        let mut outcomes: Vec<(String, String, Option<f64>)> = Vec::new();
        for book in &event.bookmakers {
            for market in &book.markets {
                if !matches!(market.key.as_str(), "h2h" | "spreads" | "totals") {
                    continue;
                }
                for outcome in &market.outcomes {
                    let entry = (market.key.clone(), outcome.name.clone(), outcome.point);
                    if !outcomes.contains(&entry) {
                        outcomes.push(entry);
                    }
                }
            }
        }
        for (market_key, outcome, point) in outcomes {
            if let Some(leg) = build_leg(event, &market_key, &outcome, point) {
                legs.push(leg);
            }
        }
    }
    legs.sort_by(|a, b| b.leg_ev.partial_cmp(&a.leg_ev).unwrap_or(std::cmp::Ordering::Equal));
    legs.truncate(MAX_CANDIDATE_LEGS);
    legs
}

/// Assemble, validate and grade a specific leg set.
pub fn assemble(legs: Vec<ParlayLeg>, sports_available: usize) -> Option<Parlay> {
    if legs.len() < 2 {
        return None;
    }
    // No two legs may share an event.
    for (i, j) in pairwise_iter(legs.len()) {
        if legs[i].event_id == legs[j].event_id {
            return None;
        }
    }

    let combined_odds: f64 = legs.iter().map(|l| l.best_odds).product();
    if !(COMBINED_ODDS_BAND.0..=COMBINED_ODDS_BAND.1).contains(&combined_odds) {
        return None;
    }

    let probs: Vec<f64> = legs.iter().map(|l| l.true_prob).collect();
    let rhos: Vec<f64> = pairwise_iter(legs.len())
        .map(|(i, j)| {
            correlation(
                &legs[i].event_id,
                &legs[i].sport,
                &legs[i].league,
                &legs[j].event_id,
                &legs[j].sport,
                &legs[j].league,
            )
        })
        .collect();
    let avg_correlation = rhos.iter().sum::<f64>() / rhos.len() as f64;
    if avg_correlation > MAX_AVG_CORRELATION {
        return None;
    }

    let true_combined_prob = combined_probability(&probs, &rhos);
    let ev = true_combined_prob * combined_odds - 1.0;
    if !(ACCA_EV_BAND.0..=ACCA_EV_BAND.1).contains(&ev) {
        debug!(ev, "acca outside the EV band; rejected");
        return None;
    }

    let sports: Vec<&str> = {
        let mut s: Vec<&str> = legs.iter().map(|l| l.sport.as_str()).collect();
        s.sort_unstable();
        s.dedup();
        s
    };
    // With three or more sports on the board, a 3+ leg acca must span two.
    if legs.len() >= 3 && sports_available >= 3 && sports.len() < 2 {
        return None;
    }

    let grade_score = grade_score(&legs, ev, avg_correlation, sports.len());
    let grade = if grade_score >= 80.0 {
        Grade::S
    } else if grade_score >= 60.0 {
        Grade::A
    } else if grade_score >= 40.0 {
        Grade::B
    } else {
        Grade::C
    };

    // Quarter-Kelly on the combined line, capped.
    let b = combined_odds - 1.0;
    let kelly_raw = (b * true_combined_prob - (1.0 - true_combined_prob)) / b / KELLY_DIVISOR;
    let kelly_stake = kelly_raw.clamp(0.0, KELLY_CAP);

    Some(Parlay {
        book_implied_prob: 1.0 / combined_odds,
        combined_odds,
        true_combined_prob,
        ev,
        avg_correlation,
        grade,
        grade_score,
        kelly_stake,
        legs,
    })
}

/// Bounded grade contributions, clamped into [0, 100].
fn grade_score(legs: &[ParlayLeg], ev: f64, avg_rho: f64, sports: usize) -> f64 {
    // EV: rewarded up to 0.10; beyond that the price is too good to trust.
    let ev_points = if ev <= 0.10 {
        35.0 * (ev / 0.10)
    } else {
        (35.0 - (ev - 0.10) / 0.15 * 65.0).max(-30.0)
    };

    let quality_points = legs
        .iter()
        .map(|l| match l.data_quality {
            DataQuality::A => 20.0,
            DataQuality::B => 12.0,
            DataQuality::C => 5.0,
        })
        .sum::<f64>()
        / legs.len() as f64;

    let correlation_points = 15.0 * (1.0 - (avg_rho / MAX_AVG_CORRELATION).min(1.0));

    let leg_points = match legs.len() {
        3 => 10.0,
        2 => 6.0,
        _ => 4.0,
    };

    let sport_points = match sports {
        s if s >= 3 => 10.0,
        2 => 6.0,
        _ => 0.0,
    };

    let high_sharps = legs
        .iter()
        .filter(|l| l.sharp_confidence == SharpConfidence::High)
        .count();
    let sharp_points = match high_sharps {
        h if h >= 2 => 10.0,
        1 => 6.0,
        _ => 2.0,
    };

    let market_kinds = {
        let mut kinds: Vec<&str> = legs.iter().map(|l| l.market_key.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds.len()
    };
    let diversity_points = if market_kinds >= 2 { 5.0 } else { 2.0 };

    (ev_points
        + quality_points
        + correlation_points
        + leg_points
        + sport_points
        + sharp_points
        + diversity_points)
        .clamp(0.0, 100.0)
}

/// Full pipeline: hygiene, legs, 2- and 3-leg enumeration, grade ranking,
/// overlap dedup and per-leg reuse caps.
pub fn build_accas(events: &[OddsEvent]) -> Vec<Parlay> {
    let filtered = filter_events(events);
    let legs = candidate_legs(&filtered);
    if legs.len() < 2 {
        return Vec::new();
    }

    let sports_available = {
        let mut s: Vec<&str> = filtered.iter().map(|e| e.sport()).collect();
        s.sort_unstable();
        s.dedup();
        s.len()
    };

    let mut candidates: Vec<Parlay> = Vec::new();
    let n = legs.len();
    for i in 0..n {
        for j in (i + 1)..n {
            if let Some(parlay) =
                assemble(vec![legs[i].clone(), legs[j].clone()], sports_available)
            {
                candidates.push(parlay);
            }
            for k in (j + 1)..n {
                if let Some(parlay) = assemble(
                    vec![legs[i].clone(), legs[j].clone(), legs[k].clone()],
                    sports_available,
                ) {
                    candidates.push(parlay);
                }
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.grade_score
            .partial_cmp(&a.grade_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Parlay> = Vec::new();
    let mut reuse: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    'candidates: for candidate in candidates {
        let keys: Vec<String> = candidate.legs.iter().map(|l| l.key()).collect();
        for leg_key in &keys {
            if reuse.get(leg_key).copied().unwrap_or(0) >= MAX_LEG_REUSE {
                continue 'candidates;
            }
        }
        for existing in &kept {
            let shared = existing
                .legs
                .iter()
                .filter(|l| keys.contains(&l.key()))
                .count();
            if shared as f64 / keys.len() as f64 > MAX_LEG_OVERLAP {
                continue 'candidates;
            }
        }
        for leg_key in keys {
            *reuse.entry(leg_key).or_insert(0) += 1;
        }
        kept.push(candidate);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn leg(event_id: &str, sport: &str, league: &str, odds: f64, prob: f64) -> ParlayLeg {
        ParlayLeg {
            event_id: event_id.to_string(),
            sport: sport.to_string(),
            league: league.to_string(),
            market_key: "h2h".to_string(),
            outcome: "Home".to_string(),
            point: None,
            true_prob: prob,
            sharp_source: "pinnacle".to_string(),
            sharp_confidence: SharpConfidence::High,
            best_odds: odds,
            book: "draftkings".to_string(),
            book_is_sharp: false,
            leg_ev: prob * odds - 1.0,
            data_quality: DataQuality::A,
        }
    }

    #[test]
    fn correlated_same_league_triple_is_rejected_on_ev() {
        // Scenario: 1.90/1.95/2.10 at 0.56/0.55/0.50, same league. The
        // correlation penalty pushes combined EV deeply negative.
        let legs = vec![
            leg("e1", "basketball", "nba", 1.90, 0.56),
            leg("e2", "basketball", "nba", 1.95, 0.55),
            leg("e3", "basketball", "nba", 2.10, 0.50),
        ];
        assert!(assemble(legs, 1).is_none());
    }

    #[test]
    fn shared_event_is_rejected() {
        let legs = vec![
            leg("e1", "basketball", "nba", 2.0, 0.55),
            leg("e1", "basketball", "nba", 2.0, 0.55),
        ];
        assert!(assemble(legs, 1).is_none());
    }

    #[test]
    fn independent_value_legs_assemble() {
        // Cross-sport legs with positive EV after the small penalty.
        let legs = vec![
            leg("e1", "basketball", "nba", 2.10, 0.52),
            leg("e2", "icehockey", "nhl", 2.05, 0.525),
        ];
        let parlay = assemble(legs, 2).unwrap();
        assert!(parlay.ev > 0.0);
        assert!(parlay.combined_odds >= 3.0);
        assert!(parlay.true_combined_prob > parlay.book_implied_prob);
        assert!(parlay.kelly_stake > 0.0 && parlay.kelly_stake <= KELLY_CAP);
        assert!((parlay.avg_correlation - 0.01).abs() < 1e-12);
    }

    #[test]
    fn combined_odds_band_enforced() {
        // Two short legs multiply below 3.0.
        let legs = vec![
            leg("e1", "basketball", "nba", 1.30, 0.80),
            leg("e2", "icehockey", "nhl", 1.30, 0.80),
        ];
        assert!(assemble(legs, 2).is_none());
    }

    #[test]
    fn single_sport_triple_blocked_when_board_is_wide() {
        let legs = vec![
            leg("e1", "basketball", "nba", 1.55, 0.68),
            leg("e2", "basketball", "weird1", 1.55, 0.68),
            leg("e3", "basketball", "weird2", 1.55, 0.68),
        ];
        // Same legs pass on a narrow board and fail on a wide one.
        assert!(assemble(legs.clone(), 2).is_some());
        assert!(assemble(legs, 3).is_none());
    }

    #[test]
    fn too_good_ev_grades_poorly() {
        let modest = grade_score(
            &[
                leg("e1", "basketball", "nba", 2.0, 0.53),
                leg("e2", "icehockey", "nhl", 2.0, 0.53),
            ],
            0.08,
            0.01,
            2,
        );
        let suspicious = grade_score(
            &[
                leg("e1", "basketball", "nba", 2.0, 0.53),
                leg("e2", "icehockey", "nhl", 2.0, 0.53),
            ],
            0.30,
            0.01,
            2,
        );
        assert!(modest > suspicious);
    }

    #[test]
    fn dedup_blocks_heavy_overlap() {
        use crate::scrapers::odds_api::{Bookmaker, BookmakerMarket, OddsOutcome};

        // Sharps price the game fair at evens; soft books shade the home
        // side generously, so the home leg carries ~9% EV at best odds.
        let mk_event = |id: &str, sport_key: &str| OddsEvent {
            id: id.to_string(),
            sport_key: sport_key.to_string(),
            sport_title: String::new(),
            commence_time: Utc::now() + Duration::hours(5),
            home_team: Some(format!("{id} Home")),
            away_team: Some(format!("{id} Away")),
            bookmakers: [("pinnacle", 1.95, 1.95), ("matchbook", 1.95, 1.95), ("draftkings", 2.18, 1.70), ("fanduel", 2.18, 1.70)]
                .iter()
                .map(|(key, home_odds, away_odds)| Bookmaker {
                    key: key.to_string(),
                    title: key.to_string(),
                    markets: vec![BookmakerMarket {
                        key: "h2h".to_string(),
                        outcomes: vec![
                            OddsOutcome {
                                name: format!("{id} Home"),
                                price: *home_odds,
                                point: None,
                            },
                            OddsOutcome {
                                name: format!("{id} Away"),
                                price: *away_odds,
                                point: None,
                            },
                        ],
                    }],
                })
                .collect(),
        };

        let events = vec![
            mk_event("e1", "basketball_nba"),
            mk_event("e2", "icehockey_nhl"),
            mk_event("e3", "baseball_mlb"),
        ];
        let accas = build_accas(&events);
        for parlay in &accas {
            // No kept pair may overlap beyond 40% of legs.
            for other in &accas {
                if std::ptr::eq(parlay, other) {
                    continue;
                }
                let shared = parlay
                    .legs
                    .iter()
                    .filter(|l| other.legs.iter().any(|o| o.key() == l.key()))
                    .count();
                assert!(shared as f64 / parlay.legs.len() as f64 <= MAX_LEG_OVERLAP);
            }
        }
    }

    #[test]
    fn hygiene_drops_started_thin_and_settled() {
        use crate::scrapers::odds_api::{Bookmaker, BookmakerMarket, OddsOutcome};
        let book = |key: &str, price: f64| Bookmaker {
            key: key.to_string(),
            title: key.to_string(),
            markets: vec![BookmakerMarket {
                key: "h2h".to_string(),
                outcomes: vec![
                    OddsOutcome { name: "Home".to_string(), price, point: None },
                    OddsOutcome { name: "Away".to_string(), price: 2.0, point: None },
                ],
            }],
        };
        let base = OddsEvent {
            id: "e".to_string(),
            sport_key: "basketball_nba".to_string(),
            sport_title: String::new(),
            commence_time: Utc::now() + Duration::hours(2),
            home_team: None,
            away_team: None,
            bookmakers: vec![book("a", 1.9), book("b", 1.9), book("c", 1.9)],
        };

        let started = OddsEvent {
            commence_time: Utc::now() - Duration::hours(1),
            ..base.clone()
        };
        let thin = OddsEvent {
            bookmakers: vec![book("a", 1.9)],
            ..base.clone()
        };
        let settled = OddsEvent {
            bookmakers: vec![book("a", 1.05), book("b", 1.9), book("c", 1.9)],
            ..base.clone()
        };

        let events = vec![base, started, thin, settled];
        assert_eq!(filter_events(&events).len(), 1);
    }
}
