//! Logic arbitrage inside a single venue.
//!
//! Three detectors share the strategy: complement mispricing inside one
//! market, mutually-exclusive group mispricing across an event's sub-markets
//! (exchange-confirmed exclusivity only), and real crossed-book arbitrage
//! from the live orderbooks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{
    ConfidenceTier, MarketSnapshot, Opportunity, OpportunitySignal, RiskTier, Side,
};
use crate::risk::{slippage, FEE_RATE};
use crate::scrapers::clob_ws::WS_STALE_MS;
use crate::scrapers::polymarket::{self, OrderBook};
use crate::strategies::{Strategy, StrategyCtx};

/// Complement deviation must clear costs by this much.
const COMPLEMENT_MIN_NET: f64 = 0.003;
/// Group net edge floor.
const GROUP_MIN_NET: f64 = 0.005;
/// Crossed-book thresholds before costs.
const SELL_SELL_THRESHOLD: f64 = 1.005;
const BUY_BUY_THRESHOLD: f64 = 0.995;
/// Price distance from the best level that still counts as fillable.
const FILLABLE_BAND: f64 = 0.02;
/// Slippage reference size.
const GATE_SIZE_USD: f64 = 100.0;
/// Event lookups allowed per scan, to stay polite with the venue.
const MAX_EVENT_LOOKUPS: usize = 5;

/// Sub-markets on lines or props are not mutually exclusive with the
/// outright outcomes and must not join a group.
const GROUP_EXCLUDE_KEYWORDS: &[&str] = &["spread", "total", "o/u", "over/under", "prop", "margin"];

pub struct LogicArbitrage;

#[async_trait]
impl Strategy for LogicArbitrage {
    fn name(&self) -> &'static str {
        "ARBITRAGE"
    }

    async fn evaluate(
        &self,
        ctx: &StrategyCtx,
        markets: &[Arc<MarketSnapshot>],
        bankroll: f64,
    ) -> Result<Vec<Opportunity>> {
        let mut opportunities = Vec::new();
        let max_size = ctx.kelly.max_exposure_pct * bankroll;

        // Extreme-priced markets are outside every detector's remit.
        let markets: Vec<&Arc<MarketSnapshot>> =
            markets.iter().filter(|m| m.in_tradeable_band()).collect();

        // Complement mispricing inside single markets.
        for market in &markets {
            if let Some(opp) = complement_opportunity(market, max_size) {
                opportunities.push(opp);
            }
        }

        // Crossed books from the live feed.
        for market in &markets {
            let yes = ctx.book_store.clean_book(&market.yes_token, WS_STALE_MS);
            let no = ctx.book_store.clean_book(&market.no_token, WS_STALE_MS);
            if let (Some((yes_book, _)), Some((no_book, _))) = (yes, no) {
                if let Some(opp) = book_arbitrage(market, &yes_book, &no_book, max_size) {
                    opportunities.push(opp);
                }
            }
        }

        // Mutually-exclusive groups.
        let mut groups: HashMap<&str, Vec<&Arc<MarketSnapshot>>> = HashMap::new();
        for market in markets {
            let Some(slug) = market.group_slug.as_deref() else {
                continue;
            };
            if !market.neg_risk || is_excluded_sub_market(&market.question) {
                continue;
            }
            groups.entry(slug).or_default().push(market);
        }

        let mut lookups = 0usize;
        for (slug, group) in groups {
            if group.len() < 2 {
                continue;
            }

            // Auto-fill sub-outcomes the scan snapshot is missing.
            let mut legs: Vec<GroupLeg> = group
                .iter()
                .map(|m| GroupLeg {
                    market_id: m.id.clone(),
                    yes_price: m.yes_price,
                    liquidity: m.liquidity,
                })
                .collect();
            let mut total_in_event = None;

            if lookups < MAX_EVENT_LOOKUPS {
                lookups += 1;
                match ctx.polymarket.event_by_slug(slug).await {
                    Ok(Some(event)) => {
                        let event_markets: Vec<MarketSnapshot> = event
                            .markets
                            .iter()
                            .filter_map(polymarket::normalize_market)
                            .filter(|m| !is_excluded_sub_market(&m.question))
                            .collect();
                        total_in_event = Some(event_markets.len());
                        for filled in event_markets {
                            if !legs.iter().any(|l| l.market_id == filled.id) {
                                legs.push(GroupLeg {
                                    market_id: filled.id.clone(),
                                    yes_price: filled.yes_price,
                                    liquidity: filled.liquidity,
                                });
                            }
                        }
                    }
                    Ok(None) => debug!(slug, "event lookup empty"),
                    Err(e) => warn!(slug, error = %e, "event lookup failed; grading group as partial"),
                }
            }

            if let Some(opp) = group_opportunity(slug, group[0], &legs, total_in_event, max_size) {
                opportunities.push(opp);
            }
        }

        Ok(opportunities)
    }
}

fn is_excluded_sub_market(question: &str) -> bool {
    let lower = question.to_lowercase();
    GROUP_EXCLUDE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Yes and no must price to one; a persistent gap beyond fees and two-sided
/// slippage is free money inside one market.
pub fn complement_opportunity(market: &MarketSnapshot, max_size: f64) -> Option<Opportunity> {
    if market.yes_price <= 0.0 || market.no_price <= 0.0 {
        return None;
    }

    let sum = market.yes_price + market.no_price;
    let deviation = (sum - 1.0).abs();
    let fees = FEE_RATE * deviation;
    let slip = slippage(GATE_SIZE_USD, market.liquidity);
    let net = deviation - fees - 2.0 * slip;
    if net <= COMPLEMENT_MIN_NET {
        return None;
    }

    let score = (net * 2000.0).min(100.0).round();
    // sum < 1: buy both legs; sum > 1: the short side is the value side.
    let side = if sum < 1.0 { Side::Yes } else { Side::No };

    Some(Opportunity {
        strategy: "ARBITRAGE".to_string(),
        venue: market.venue,
        market_id: market.id.clone(),
        question: market.question.clone(),
        side,
        entry_price: market.yes_price,
        size_usd: max_size.min(0.05 * market.liquidity).max(0.0),
        raw_edge: deviation,
        net_ev: net,
        score,
        confidence: if net >= 0.01 {
            ConfidenceTier::High
        } else {
            ConfidenceTier::Medium
        },
        risk_tier: RiskTier::Low,
        risk_note: "Both legs must fill before the gap closes; worst case is one-sided exposure at the quoted deviation".to_string(),
        signal: OpportunitySignal::Complement {
            price_sum: sum,
            net_deviation: net,
        },
        detected_at: Utc::now(),
    })
}

pub struct GroupLeg {
    pub market_id: String,
    pub yes_price: f64,
    pub liquidity: f64,
}

/// Mutually-exclusive group: the yes prices of a complete outcome set must
/// sum to one. Incomplete coverage downgrades confidence and scales the
/// score instead of discarding the finding.
pub fn group_opportunity(
    slug: &str,
    leader: &MarketSnapshot,
    legs: &[GroupLeg],
    total_in_event: Option<usize>,
    max_size: f64,
) -> Option<Opportunity> {
    if legs.len() < 2 {
        return None;
    }

    let sum: f64 = legs.iter().map(|l| l.yes_price).sum();
    let raw = (sum - 1.0).abs();
    let fee_on_profit = FEE_RATE * raw;
    let avg_slippage = legs
        .iter()
        .map(|l| slippage(GATE_SIZE_USD, l.liquidity))
        .sum::<f64>()
        / legs.len() as f64;
    let net = raw - fee_on_profit - avg_slippage;
    if net < GROUP_MIN_NET {
        return None;
    }

    let (complete, coverage) = match total_in_event {
        Some(total) if total > 0 => (legs.len() >= total, (legs.len() as f64 / total as f64).min(1.0)),
        // Event lookup unavailable: grade conservatively.
        _ => (false, 0.5),
    };

    let mut score = (net * 2000.0).min(100.0);
    let confidence = if complete {
        ConfidenceTier::High
    } else {
        score *= (coverage * 0.6).max(0.1);
        ConfidenceTier::Low
    };
    let score = score.round();

    let min_liquidity = legs
        .iter()
        .map(|l| l.liquidity)
        .fold(f64::INFINITY, f64::min);

    Some(Opportunity {
        strategy: "ARBITRAGE".to_string(),
        venue: leader.venue,
        market_id: leader.id.clone(),
        question: leader.question.clone(),
        side: if sum > 1.0 { Side::No } else { Side::Yes },
        entry_price: leader.yes_price,
        size_usd: max_size.min(0.05 * min_liquidity).max(0.0),
        raw_edge: raw,
        net_ev: net,
        score,
        confidence,
        risk_tier: if complete { RiskTier::Low } else { RiskTier::High },
        risk_note: format!(
            "Requires filling {} legs; an unfilled leg leaves directional exposure on the group",
            legs.len()
        ),
        signal: OpportunitySignal::GroupArbitrage {
            group_slug: slug.to_string(),
            leg_count: legs.len(),
            price_sum: sum,
            coverage,
            complete,
        },
        detected_at: Utc::now(),
    })
}

/// Real crossed books: selling both sides above one (or buying both below
/// one) locks the gap regardless of outcome.
pub fn book_arbitrage(
    market: &MarketSnapshot,
    yes_book: &OrderBook,
    no_book: &OrderBook,
    max_size: f64,
) -> Option<Opportunity> {
    let slip = slippage(GATE_SIZE_USD, market.liquidity);

    let sell_sell = match (yes_book.best_bid(), no_book.best_bid()) {
        (Some(yes_bid), Some(no_bid)) if yes_bid + no_bid > SELL_SELL_THRESHOLD => {
            let margin = yes_bid + no_bid - 1.0 - 2.0 * slip;
            (margin > 0.0).then(|| {
                let fillable =
                    fillable_usd(&yes_book.bids, yes_bid).min(fillable_usd(&no_book.bids, no_bid));
                ("sell_sell", yes_bid, no_bid, margin, fillable)
            })
        }
        _ => None,
    };

    let buy_buy = match (yes_book.best_ask(), no_book.best_ask()) {
        (Some(yes_ask), Some(no_ask)) if yes_ask + no_ask < BUY_BUY_THRESHOLD => {
            let margin = 1.0 - yes_ask - no_ask - 2.0 * slip;
            (margin > 0.0).then(|| {
                let fillable =
                    fillable_usd(&yes_book.asks, yes_ask).min(fillable_usd(&no_book.asks, no_ask));
                ("buy_buy", yes_ask, no_ask, margin, fillable)
            })
        }
        _ => None,
    };

    let (mode, yes_price, no_price, margin, fillable) = sell_sell.or(buy_buy)?;

    Some(Opportunity {
        strategy: "ARBITRAGE".to_string(),
        venue: market.venue,
        market_id: market.id.clone(),
        question: market.question.clone(),
        side: if mode == "buy_buy" { Side::Yes } else { Side::No },
        entry_price: yes_price,
        size_usd: max_size.min(fillable).max(0.0),
        raw_edge: margin + 2.0 * slip,
        net_ev: margin,
        score: (60.0 + margin * 2000.0).min(100.0).round(),
        confidence: ConfidenceTier::High,
        risk_tier: RiskTier::Low,
        risk_note: "Locked only once both legs fill; a one-sided fill leaves plain directional exposure".to_string(),
        signal: OpportunitySignal::BookArbitrage {
            mode: mode.to_string(),
            yes_price,
            no_price,
            fillable_usd: fillable,
        },
        detected_at: Utc::now(),
    })
}

/// Notional resting within the fillable band of the best level.
fn fillable_usd(levels: &[polymarket::Order], best: f64) -> f64 {
    levels
        .iter()
        .filter(|o| (o.price - best).abs() <= FILLABLE_BAND)
        .map(|o| o.price * o.size)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;
    use crate::scrapers::polymarket::Order;

    fn market(yes: f64, no: f64, liquidity: f64, volume: f64) -> MarketSnapshot {
        MarketSnapshot {
            id: "m1".to_string(),
            question: "Will the outcome happen?".to_string(),
            venue: Venue::Polymarket,
            yes_price: yes,
            no_price: no,
            yes_token: "yt".to_string(),
            no_token: "nt".to_string(),
            volume_24h: volume,
            liquidity,
            spread: 0.01,
            group_slug: None,
            neg_risk: true,
            end_date: None,
            resolution: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn complement_gap_scores_as_expected() {
        // 0.48 + 0.50 with 50k liquidity: slip 0.004/side, fee 0.0004,
        // net 0.0116, score 23.
        let m = market(0.48, 0.50, 50_000.0, 10_000.0);
        let opp = complement_opportunity(&m, 100.0).unwrap();
        assert!((opp.net_ev - 0.0116).abs() < 1e-9);
        assert_eq!(opp.score, 23.0);
        assert_eq!(opp.side, Side::Yes);
    }

    #[test]
    fn fair_complement_is_silent() {
        let m = market(0.49, 0.51, 50_000.0, 10_000.0);
        assert!(complement_opportunity(&m, 100.0).is_none());
    }

    #[test]
    fn group_requires_exchange_confirmed_exclusivity() {
        // Handled at group-forming time: a non-negRisk market never reaches
        // group_opportunity. The helper itself still needs two legs.
        let legs = vec![GroupLeg {
            market_id: "a".to_string(),
            yes_price: 0.4,
            liquidity: 10_000.0,
        }];
        assert!(group_opportunity("slug", &market(0.4, 0.6, 10_000.0, 0.0), &legs, Some(3), 100.0).is_none());
    }

    #[test]
    fn underpriced_group_is_flagged_and_incomplete_downgrades() {
        let leader = market(0.30, 0.70, 20_000.0, 0.0);
        let legs = vec![
            GroupLeg { market_id: "a".to_string(), yes_price: 0.30, liquidity: 20_000.0 },
            GroupLeg { market_id: "b".to_string(), yes_price: 0.28, liquidity: 20_000.0 },
            GroupLeg { market_id: "c".to_string(), yes_price: 0.30, liquidity: 20_000.0 },
        ];

        let complete = group_opportunity("slug", &leader, &legs, Some(3), 100.0).unwrap();
        assert_eq!(complete.confidence, ConfidenceTier::High);
        assert_eq!(complete.side, Side::Yes);

        let partial = group_opportunity("slug", &leader, &legs, Some(4), 100.0).unwrap();
        assert_eq!(partial.confidence, ConfidenceTier::Low);
        assert!(partial.score < complete.score);
        match partial.signal {
            OpportunitySignal::GroupArbitrage { complete, coverage, .. } => {
                assert!(!complete);
                assert!((coverage - 0.75).abs() < 1e-12);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn unconfirmed_exclusivity_never_groups() {
        use crate::paper::learning::ThresholdBook;
        use crate::risk::KellyParams;
        use crate::scrapers::book_store::BookStore;
        use crate::scrapers::market_cache::MarketDataCache;
        use crate::scrapers::polymarket::PolymarketClient;
        use crate::strategies::StrategyCtx;

        // Two sibling markets whose yes prices sum well below one, but the
        // exchange has not confirmed exclusivity.
        let mut a = market(0.30, 0.70, 20_000.0, 5_000.0);
        a.id = "a".to_string();
        a.group_slug = Some("race".to_string());
        a.neg_risk = false;
        let mut b = market(0.30, 0.70, 20_000.0, 5_000.0);
        b.id = "b".to_string();
        b.group_slug = Some("race".to_string());
        b.neg_risk = false;

        let ctx = StrategyCtx {
            book_store: Arc::new(BookStore::new()),
            market_cache: Arc::new(MarketDataCache::new(Arc::new(PolymarketClient::new()), None)),
            polymarket: Arc::new(PolymarketClient::new()),
            odds: None,
            thresholds: Arc::new(ThresholdBook::new(None)),
            histories: std::collections::HashMap::new(),
            kelly: KellyParams::default(),
        };
        let markets = vec![Arc::new(a), Arc::new(b)];
        let found = LogicArbitrage
            .evaluate(&ctx, &markets, 1_000.0)
            .await
            .unwrap();
        assert!(!found
            .iter()
            .any(|o| matches!(o.signal, OpportunitySignal::GroupArbitrage { .. })));
    }

    #[test]
    fn line_sub_markets_are_excluded() {
        assert!(is_excluded_sub_market("Team A to win by spread of 3.5"));
        assert!(is_excluded_sub_market("Total points Over/Under 45"));
        assert!(!is_excluded_sub_market("Team A to win the championship"));
    }

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        let mut b = OrderBook {
            bids: bids.iter().map(|&(price, size)| Order { price, size }).collect(),
            asks: asks.iter().map(|&(price, size)| Order { price, size }).collect(),
        };
        b.sort();
        b
    }

    #[test]
    fn crossed_bids_make_sell_sell() {
        let m = market(0.52, 0.50, 100_000.0, 0.0);
        let yes = book(&[(0.54, 2000.0)], &[(0.56, 1000.0)]);
        let no = book(&[(0.49, 2000.0)], &[(0.51, 1000.0)]);
        // 0.54 + 0.49 = 1.03 > 1.005; slip = 0.0035 each side.
        let opp = book_arbitrage(&m, &yes, &no, 500.0).unwrap();
        assert!(opp.net_ev > 0.0);
        match opp.signal {
            OpportunitySignal::BookArbitrage { ref mode, .. } => assert_eq!(mode, "sell_sell"),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn cheap_asks_make_buy_buy() {
        let m = market(0.48, 0.50, 100_000.0, 0.0);
        let yes = book(&[(0.45, 1000.0)], &[(0.47, 3000.0)]);
        let no = book(&[(0.49, 1000.0)], &[(0.51, 3000.0)]);
        // 0.47 + 0.51 = 0.98 < 0.995.
        let opp = book_arbitrage(&m, &yes, &no, 500.0).unwrap();
        assert_eq!(opp.side, Side::Yes);
        assert!(opp.net_ev > 0.0);
    }

    #[test]
    fn uncrossed_books_are_silent() {
        let m = market(0.50, 0.50, 100_000.0, 0.0);
        let yes = book(&[(0.49, 1000.0)], &[(0.51, 1000.0)]);
        let no = book(&[(0.49, 1000.0)], &[(0.51, 1000.0)]);
        assert!(book_arbitrage(&m, &yes, &no, 500.0).is_none());
    }

    #[test]
    fn fillable_is_bounded_by_band() {
        let levels = vec![
            Order { price: 0.50, size: 1000.0 },
            Order { price: 0.49, size: 1000.0 },
            Order { price: 0.40, size: 50_000.0 },
        ];
        let usd = fillable_usd(&levels, 0.50);
        // The 0.40 level sits outside the 2% band.
        assert!((usd - (0.50 * 1000.0 + 0.49 * 1000.0)).abs() < 1e-9);
    }
}
