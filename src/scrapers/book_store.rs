//! Short-horizon orderbook snapshot store with spoof detection.
//!
//! Keeps a small ring of simplified books per token and flags large resting
//! orders that do not persist across snapshots. Downstream consumers (ICT,
//! arbitrage) read the clean-book view with suspicious orders removed.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::scrapers::polymarket::{Order, OrderBook};

/// Ring retention window.
pub const SNAPSHOT_RETENTION_MS: i64 = 120_000;
/// Maximum simplified books kept per token.
pub const MAX_SNAPSHOTS_PER_TOKEN: usize = 10;
/// Levels kept per side in a simplified book.
pub const MAX_DEPTH_PER_SIDE: usize = 20;
/// Orders below this notional are never spoof candidates.
pub const SPOOF_MIN_SIZE: f64 = 5000.0;
/// Snapshots younger than this do not count as history for spoof checks.
const SPOOF_MIN_AGE_MS: i64 = 5000;
const SPOOF_PRICE_TOLERANCE: f64 = 0.005;
const SPOOF_SIZE_TOLERANCE: f64 = 0.2;

/// Near-price band used by the thin-market assessment and wall scan.
pub const NEAR_PRICE_BAND: f64 = 0.05;
/// Markets with less than this resting near-price volume are thin.
pub const THIN_MARKET_FLOOR: f64 = 3000.0;
/// Resting size that qualifies as a wall.
pub const WALL_MIN_SIZE: f64 = 5000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpoofConfidence {
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuspiciousOrder {
    pub is_bid: bool,
    pub price: f64,
    pub size: f64,
    pub confidence: SpoofConfidence,
    /// Older snapshots inspected.
    pub history: usize,
    /// Older snapshots containing a matching order.
    pub persisted_in: usize,
}

/// Result of scanning the latest book for non-persistent large orders.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpoofReport {
    pub suspicious: Vec<SuspiciousOrder>,
    /// 2 per HIGH-confidence flag, 1 per MEDIUM.
    pub score: u32,
}

/// Depth and diversity of resting liquidity near the current price.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DepthAssessment {
    pub near_volume: f64,
    pub order_count: usize,
    pub depth_score: f64,
    pub diversity_score: f64,
    pub confidence_factor: f64,
    pub is_thin: bool,
}

/// A 1-cent cluster of resting size on one side of the book.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Wall {
    pub price: f64,
    pub size: f64,
    pub is_bid: bool,
}

#[derive(Debug, Clone)]
struct TimedBook {
    book: OrderBook,
    recorded_at_ms: i64,
}

/// Per-token ring of recent simplified books.
#[derive(Default)]
pub struct BookStore {
    rings: RwLock<HashMap<String, VecDeque<TimedBook>>>,
}

impl BookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a simplified copy of `book` for `token_id`, evicting entries
    /// past the retention window or the ring capacity.
    pub fn record(&self, token_id: &str, book: &OrderBook) {
        self.record_at(token_id, book, Utc::now().timestamp_millis());
    }

    fn record_at(&self, token_id: &str, book: &OrderBook, now_ms: i64) {
        let mut simplified = OrderBook {
            bids: book.bids.iter().take(MAX_DEPTH_PER_SIDE).copied().collect(),
            asks: book.asks.iter().take(MAX_DEPTH_PER_SIDE).copied().collect(),
        };
        simplified.sort();

        let mut rings = self.rings.write();
        let ring = ring_entry(&mut rings, token_id);
        ring.push_back(TimedBook {
            book: simplified,
            recorded_at_ms: now_ms,
        });
        while ring.len() > MAX_SNAPSHOTS_PER_TOKEN {
            ring.pop_front();
        }
        while let Some(front) = ring.front() {
            if now_ms - front.recorded_at_ms > SNAPSHOT_RETENTION_MS {
                ring.pop_front();
            } else {
                break;
            }
        }
    }

    /// Latest recorded book, if fresh enough.
    pub fn latest(&self, token_id: &str, max_age_ms: i64) -> Option<OrderBook> {
        let now_ms = Utc::now().timestamp_millis();
        let rings = self.rings.read();
        let entry = rings.get(token_id)?.back()?;
        if max_age_ms > 0 && now_ms - entry.recorded_at_ms > max_age_ms {
            return None;
        }
        Some(entry.book.clone())
    }

    pub fn snapshot_count(&self, token_id: &str) -> usize {
        self.rings.read().get(token_id).map_or(0, |r| r.len())
    }

    /// Scan the latest book for large orders absent from older snapshots.
    pub fn detect_spoofs(&self, token_id: &str) -> SpoofReport {
        self.detect_spoofs_at(token_id, Utc::now().timestamp_millis())
    }

    fn detect_spoofs_at(&self, token_id: &str, now_ms: i64) -> SpoofReport {
        let rings = self.rings.read();
        let Some(ring) = rings.get(token_id) else {
            return SpoofReport::default();
        };
        let Some(latest) = ring.back() else {
            return SpoofReport::default();
        };

        let history: Vec<&TimedBook> = ring
            .iter()
            .filter(|tb| {
                now_ms - tb.recorded_at_ms > SPOOF_MIN_AGE_MS
                    && tb.recorded_at_ms < latest.recorded_at_ms
            })
            .collect();

        let mut report = SpoofReport::default();
        if history.len() < 2 {
            return report;
        }

        let candidates = latest
            .book
            .bids
            .iter()
            .map(|o| (*o, true))
            .chain(latest.book.asks.iter().map(|o| (*o, false)))
            .filter(|(o, _)| o.size >= SPOOF_MIN_SIZE);

        for (order, is_bid) in candidates {
            let persisted_in = history
                .iter()
                .filter(|tb| contains_match(&tb.book, &order, is_bid))
                .count();

            if (persisted_in as f64) < 0.3 * history.len() as f64 {
                let confidence = if persisted_in == 0 {
                    SpoofConfidence::High
                } else {
                    SpoofConfidence::Medium
                };
                report.score += match confidence {
                    SpoofConfidence::High => 2,
                    SpoofConfidence::Medium => 1,
                };
                report.suspicious.push(SuspiciousOrder {
                    is_bid,
                    price: order.price,
                    size: order.size,
                    confidence,
                    history: history.len(),
                    persisted_in,
                });
            }
        }

        report
    }

    /// Latest book with suspicious orders removed, plus the spoof report.
    /// This is the view every downstream consumer trades against.
    pub fn clean_book(&self, token_id: &str, max_age_ms: i64) -> Option<(OrderBook, SpoofReport)> {
        let book = self.latest(token_id, max_age_ms)?;
        let report = self.detect_spoofs(token_id);
        if report.suspicious.is_empty() {
            return Some((book, report));
        }

        let keep = |order: &Order, is_bid: bool| {
            !report.suspicious.iter().any(|s| {
                s.is_bid == is_bid
                    && (s.price - order.price).abs() < f64::EPSILON
                    && (s.size - order.size).abs() < f64::EPSILON
            })
        };
        let clean = OrderBook {
            bids: book.bids.iter().filter(|o| keep(o, true)).copied().collect(),
            asks: book.asks.iter().filter(|o| keep(o, false)).copied().collect(),
        };
        Some((clean, report))
    }
}

fn ring_entry<'a>(
    rings: &'a mut HashMap<String, VecDeque<TimedBook>>,
    token_id: &str,
) -> &'a mut VecDeque<TimedBook> {
    if !rings.contains_key(token_id) {
        rings.insert(
            token_id.to_string(),
            VecDeque::with_capacity(MAX_SNAPSHOTS_PER_TOKEN + 1),
        );
    }
    rings.get_mut(token_id).expect("just inserted")
}

fn contains_match(book: &OrderBook, order: &Order, is_bid: bool) -> bool {
    let side = if is_bid { &book.bids } else { &book.asks };
    side.iter().any(|o| {
        (o.price - order.price).abs() < SPOOF_PRICE_TOLERANCE
            && ((o.size - order.size).abs() / order.size) < SPOOF_SIZE_TOLERANCE
    })
}

/// Depth/diversity assessment of the near-price region of a (clean) book.
pub fn assess_depth(book: &OrderBook) -> DepthAssessment {
    let Some(mid) = book.mid_price() else {
        return DepthAssessment {
            near_volume: 0.0,
            order_count: 0,
            depth_score: 0.0,
            diversity_score: 0.0,
            confidence_factor: 0.0,
            is_thin: true,
        };
    };

    let near = |o: &&Order| (o.price - mid).abs() <= NEAR_PRICE_BAND;
    let near_orders: Vec<&Order> = book.bids.iter().filter(near).chain(book.asks.iter().filter(near)).collect();

    let near_volume: f64 = near_orders.iter().map(|o| o.size).sum();
    let order_count = near_orders.len();

    let depth_score = (near_volume / 50_000.0).min(1.0);
    let diversity_score = if order_count < 5 {
        (order_count as f64 / 10.0).min(1.0)
    } else {
        (order_count as f64 / 20.0).min(1.0)
    };

    DepthAssessment {
        near_volume,
        order_count,
        depth_score,
        diversity_score,
        confidence_factor: 0.6 * depth_score + 0.4 * diversity_score,
        is_thin: near_volume < THIN_MARKET_FLOOR,
    }
}

/// Cluster resting orders into 1-cent levels and keep the near-price walls.
pub fn find_walls(book: &OrderBook) -> Vec<Wall> {
    let Some(mid) = book.mid_price() else {
        return Vec::new();
    };

    let mut walls = Vec::new();
    for (orders, is_bid) in [(&book.bids, true), (&book.asks, false)] {
        let mut clusters: HashMap<i64, f64> = HashMap::new();
        for o in orders.iter() {
            if (o.price - mid).abs() <= NEAR_PRICE_BAND {
                *clusters.entry((o.price * 100.0).round() as i64).or_default() += o.size;
            }
        }
        for (cents, size) in clusters {
            if size >= WALL_MIN_SIZE {
                walls.push(Wall {
                    price: cents as f64 / 100.0,
                    size,
                    is_bid,
                });
            }
        }
    }
    walls.sort_by(|a, b| b.size.partial_cmp(&a.size).unwrap_or(std::cmp::Ordering::Equal));
    walls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        let mut b = OrderBook {
            bids: bids.iter().map(|&(price, size)| Order { price, size }).collect(),
            asks: asks.iter().map(|&(price, size)| Order { price, size }).collect(),
        };
        b.sort();
        b
    }

    #[test]
    fn large_vanishing_bid_is_flagged_high() {
        let store = BookStore::new();
        let now = 1_000_000_000;
        let steady = book(&[(0.41, 800.0)], &[(0.44, 900.0)]);

        // Three older snapshots without the large bid, then the current book
        // with a 15k bid at 0.42.
        store.record_at("tok", &steady, now - 40_000);
        store.record_at("tok", &steady, now - 25_000);
        store.record_at("tok", &steady, now - 10_000);
        let spoofed = book(&[(0.42, 15_000.0), (0.41, 800.0)], &[(0.44, 900.0)]);
        store.record_at("tok", &spoofed, now);

        let report = store.detect_spoofs_at("tok", now);
        assert_eq!(report.suspicious.len(), 1);
        assert_eq!(report.suspicious[0].confidence, SpoofConfidence::High);
        assert_eq!(report.suspicious[0].persisted_in, 0);
        assert_eq!(report.score, 2);
    }

    #[test]
    fn persistent_large_order_is_not_flagged() {
        let store = BookStore::new();
        let now = 1_000_000_000;
        let with_wall = book(&[(0.42, 15_000.0)], &[(0.44, 900.0)]);
        store.record_at("tok", &with_wall, now - 40_000);
        store.record_at("tok", &with_wall, now - 20_000);
        store.record_at("tok", &with_wall, now - 10_000);
        store.record_at("tok", &with_wall, now);

        let report = store.detect_spoofs_at("tok", now);
        assert!(report.suspicious.is_empty());
        assert_eq!(report.score, 0);
    }

    #[test]
    fn fewer_than_two_old_snapshots_yields_nothing() {
        let store = BookStore::new();
        let now = 1_000_000_000;
        let spoofed = book(&[(0.42, 15_000.0)], &[]);
        store.record_at("tok", &spoofed, now - 6_000);
        store.record_at("tok", &spoofed, now);
        assert_eq!(store.detect_spoofs_at("tok", now).score, 0);
    }

    #[test]
    fn ring_is_bounded() {
        let store = BookStore::new();
        let now = 1_000_000_000;
        let b = book(&[(0.5, 10.0)], &[(0.52, 10.0)]);
        for i in 0..25 {
            store.record_at("tok", &b, now + i * 1000);
        }
        assert!(store.snapshot_count("tok") <= MAX_SNAPSHOTS_PER_TOKEN);
    }

    #[test]
    fn old_snapshots_are_evicted() {
        let store = BookStore::new();
        let now = 1_000_000_000;
        let b = book(&[(0.5, 10.0)], &[(0.52, 10.0)]);
        store.record_at("tok", &b, now - SNAPSHOT_RETENTION_MS - 1000);
        store.record_at("tok", &b, now);
        assert_eq!(store.snapshot_count("tok"), 1);
    }

    #[test]
    fn clean_book_removes_suspicious_orders() {
        let store = BookStore::new();
        let now = Utc::now().timestamp_millis();
        let steady = book(&[(0.41, 800.0)], &[(0.44, 900.0)]);
        store.record_at("tok", &steady, now - 40_000);
        store.record_at("tok", &steady, now - 20_000);
        let spoofed = book(&[(0.42, 15_000.0), (0.41, 800.0)], &[(0.44, 900.0)]);
        store.record_at("tok", &spoofed, now);

        let (clean, report) = store.clean_book("tok", 0).unwrap();
        assert_eq!(report.score, 2);
        assert_eq!(clean.bids.len(), 1);
        assert!((clean.bids[0].price - 0.41).abs() < 1e-12);
    }

    #[test]
    fn thin_market_detected_from_near_volume() {
        let thin = book(&[(0.48, 500.0)], &[(0.52, 800.0)]);
        let assessment = assess_depth(&thin);
        assert!(assessment.is_thin);
        assert!(assessment.confidence_factor < 0.2);

        let deep = book(
            &[(0.48, 20_000.0), (0.47, 15_000.0), (0.46, 10_000.0)],
            &[(0.52, 20_000.0), (0.53, 15_000.0), (0.54, 10_000.0)],
        );
        let assessment = assess_depth(&deep);
        assert!(!assessment.is_thin);
        assert!(assessment.depth_score >= 1.0);
    }

    #[test]
    fn walls_cluster_by_cent() {
        let b = book(
            &[(0.481, 3000.0), (0.479, 2500.0)],
            &[(0.52, 100.0)],
        );
        // 0.481 and 0.479 round to 0.48 and cluster to a 5.5k wall.
        let walls = find_walls(&b);
        assert_eq!(walls.len(), 1);
        assert!(walls[0].is_bid);
        assert!((walls[0].size - 5500.0).abs() < 1e-9);
    }
}
