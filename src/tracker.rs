//! Signal persistence tracker.
//!
//! An edge that shows up scan after scan is more believable than one that
//! flashes once. Repeat sightings of the same (market, strategy, side) earn
//! a score boost; entries quiet for five minutes fall out.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::models::Opportunity;

/// Entries unseen for this long are evicted.
pub const PERSISTENCE_TTL_MS: i64 = 300_000;
/// Recent scores kept per entry.
const MAX_RECENT_SCORES: usize = 10;
/// Sightings for the +8% tier.
const BOOST_TIER_LOW: u32 = 3;
/// Sightings for the +15% tier.
const BOOST_TIER_HIGH: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistenceEntry {
    first_seen_ms: i64,
    last_seen_ms: i64,
    count: u32,
    recent_scores: VecDeque<f64>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntries {
    entries: HashMap<String, PersistenceEntry>,
    saved_at: i64,
}

/// Boost applied to one opportunity this scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistenceTag {
    pub dedup_key: String,
    /// "new", "+8%" or "+15%".
    pub tag: &'static str,
    pub sightings: u32,
}

#[derive(Default)]
pub struct PersistenceTracker {
    entries: Mutex<HashMap<String, PersistenceEntry>>,
    path: Option<std::path::PathBuf>,
}

impl PersistenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker backed by a JSON side file so boosts survive a restart.
    pub fn with_path(path: std::path::PathBuf) -> Self {
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PersistedEntries>(&raw).ok())
            .map(|file| file.entries)
            .unwrap_or_default();
        Self {
            entries: Mutex::new(entries),
            path: Some(path),
        }
    }

    fn save(&self, entries: &HashMap<String, PersistenceEntry>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = PersistedEntries {
            entries: entries.clone(),
            saved_at: Utc::now().timestamp(),
        };
        if let Ok(json) = serde_json::to_string(&file) {
            let _ = std::fs::write(path, json);
        }
    }

    /// Fold this scan's opportunities into the tracker, boosting scores for
    /// repeat sightings. Returns the tags worth surfacing.
    pub fn apply(&self, opportunities: &mut [Opportunity]) -> Vec<PersistenceTag> {
        self.apply_at(opportunities, Utc::now().timestamp_millis())
    }

    fn apply_at(&self, opportunities: &mut [Opportunity], now_ms: i64) -> Vec<PersistenceTag> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| now_ms - e.last_seen_ms <= PERSISTENCE_TTL_MS);

        let mut tags = Vec::new();
        for opp in opportunities.iter_mut() {
            let key = opp.dedup_key();
            let entry = entries.entry(key.clone()).or_insert(PersistenceEntry {
                first_seen_ms: now_ms,
                last_seen_ms: now_ms,
                count: 0,
                recent_scores: VecDeque::with_capacity(MAX_RECENT_SCORES),
            });
            entry.count += 1;
            entry.last_seen_ms = now_ms;
            if entry.recent_scores.len() >= MAX_RECENT_SCORES {
                entry.recent_scores.pop_front();
            }
            entry.recent_scores.push_back(opp.score);

            let tag = if entry.count >= BOOST_TIER_HIGH {
                opp.score = (opp.score * 1.15).min(100.0);
                "+15%"
            } else if entry.count >= BOOST_TIER_LOW {
                opp.score = (opp.score * 1.08).min(100.0);
                "+8%"
            } else if entry.count == 1 {
                "new"
            } else {
                continue;
            };
            tags.push(PersistenceTag {
                dedup_key: key,
                tag,
                sightings: entry.count,
            });
        }
        self.save(&entries);
        tags
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.lock().len()
    }
}
