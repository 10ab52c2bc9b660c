//! Bookmaker odds client (Odds-API).
//!
//! Keyed service with a request quota; the quota counters come back on every
//! response as `x-requests-remaining` / `x-requests-used`. Fetched events are
//! cached on disk between runs so the parlay builder can work offline.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const ODDS_API_BASE: &str = "https://api.the-odds-api.com/v4";
const REGIONS: &str = "us,uk";
const ODDS_FORMAT: &str = "decimal";

/// Markets the engine consumes.
pub const MARKET_KEYS: &str = "h2h,spreads,totals,outrights";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsOutcome {
    pub name: String,
    /// Decimal odds.
    pub price: f64,
    /// Spread / total line when applicable.
    #[serde(default)]
    pub point: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmakerMarket {
    /// "h2h", "spreads", "totals" or "outrights".
    pub key: String,
    #[serde(default)]
    pub outcomes: Vec<OddsOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub markets: Vec<BookmakerMarket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsEvent {
    pub id: String,
    pub sport_key: String,
    #[serde(default)]
    pub sport_title: String,
    pub commence_time: DateTime<Utc>,
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
    #[serde(default)]
    pub bookmakers: Vec<Bookmaker>,
}

impl OddsEvent {
    /// League portion of the sport key ("basketball_nba" -> "nba").
    pub fn league(&self) -> &str {
        self.sport_key
            .split_once('_')
            .map(|(_, league)| league)
            .unwrap_or(&self.sport_key)
    }

    /// Sport family ("basketball_nba" -> "basketball").
    pub fn sport(&self) -> &str {
        self.sport_key
            .split_once('_')
            .map(|(sport, _)| sport)
            .unwrap_or(&self.sport_key)
    }
}

/// Bookmaker consensus for one side of a matched event.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub prob: f64,
    pub bookmaker_count: usize,
    pub pinnacle_prob: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QuotaStatus {
    pub remaining: Option<f64>,
    pub used: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OddsCacheFile {
    events: Vec<OddsEvent>,
    saved_at: i64,
}

pub struct OddsClient {
    http: Client,
    api_key: String,
    cache_path: PathBuf,
    quota: Mutex<QuotaStatus>,
    events: Mutex<Vec<OddsEvent>>,
}

impl OddsClient {
    pub fn new(api_key: String, cache_path: PathBuf) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("edgebot/0.1")
            .build()
            .expect("reqwest client");
        let client = Self {
            http,
            api_key,
            cache_path,
            quota: Mutex::new(QuotaStatus::default()),
            events: Mutex::new(Vec::new()),
        };
        if let Err(e) = client.load_cache() {
            debug!(error = %e, "no usable odds cache on disk");
        }
        client
    }

    pub fn quota(&self) -> QuotaStatus {
        *self.quota.lock()
    }

    /// All cached events (from the last fetch or the disk cache).
    pub fn events(&self) -> Vec<OddsEvent> {
        self.events.lock().clone()
    }

    /// Fetch odds for one sport and fold them into the cache.
    pub async fn fetch_odds(&self, sport_key: &str) -> Result<usize> {
        let response = self
            .http
            .get(format!("{ODDS_API_BASE}/sports/{sport_key}/odds"))
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("regions", REGIONS),
                ("markets", MARKET_KEYS),
                ("oddsFormat", ODDS_FORMAT),
            ])
            .send()
            .await
            .context("odds request")?;

        self.record_quota(response.headers());
        let response = response.error_for_status().context("odds status")?;
        let fetched: Vec<OddsEvent> = response.json().await.context("odds json")?;
        let count = fetched.len();

        {
            let mut events = self.events.lock();
            events.retain(|e| e.sport_key != sport_key);
            events.extend(fetched);
            // Expired events never feed a parlay; drop them here.
            let now = Utc::now();
            events.retain(|e| e.commence_time > now);
        }
        if let Err(e) = self.save_cache() {
            warn!(error = %e, "failed to persist odds cache");
        }

        info!(sport = sport_key, count, "bookmaker odds refreshed");
        Ok(count)
    }

    fn record_quota(&self, headers: &reqwest::header::HeaderMap) {
        let parse = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
        };
        let mut quota = self.quota.lock();
        if let Some(remaining) = parse("x-requests-remaining") {
            quota.remaining = Some(remaining);
        }
        if let Some(used) = parse("x-requests-used") {
            quota.used = Some(used);
        }
    }

    fn load_cache(&self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.cache_path).context("read odds cache")?;
        let cache: OddsCacheFile = serde_json::from_str(&raw).context("parse odds cache")?;
        let now = Utc::now();
        let mut events = self.events.lock();
        *events = cache
            .events
            .into_iter()
            .filter(|e| e.commence_time > now)
            .collect();
        debug!(count = events.len(), "odds cache loaded");
        Ok(())
    }

    fn save_cache(&self) -> Result<()> {
        let cache = OddsCacheFile {
            events: self.events.lock().clone(),
            saved_at: Utc::now().timestamp(),
        };
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string(&cache).context("serialize odds cache")?;
        std::fs::write(&self.cache_path, json).context("write odds cache")?;
        Ok(())
    }

    /// Consensus probability for the side of a matched event named inside
    /// `question`. Returns `None` when no event team appears in the question
    /// or fewer than two books price it.
    pub fn consensus_for_question(&self, question: &str) -> Option<Consensus> {
        let question_lower = question.to_lowercase();
        let events = self.events.lock();

        for event in events.iter() {
            for team in [event.home_team.as_deref(), event.away_team.as_deref()]
                .into_iter()
                .flatten()
            {
                if team.len() >= 4 && question_lower.contains(&team.to_lowercase()) {
                    if let Some(consensus) = consensus_for_outcome(event, team) {
                        return Some(consensus);
                    }
                }
            }
        }
        None
    }
}

/// Average devigged h2h probability for `outcome` across an event's books.
pub fn consensus_for_outcome(event: &OddsEvent, outcome: &str) -> Option<Consensus> {
    let mut probs = Vec::new();
    let mut pinnacle_prob = None;

    for book in &event.bookmakers {
        let Some(h2h) = book.markets.iter().find(|m| m.key == "h2h") else {
            continue;
        };
        let inverse_sum: f64 = h2h
            .outcomes
            .iter()
            .filter(|o| o.price > 1.0)
            .map(|o| 1.0 / o.price)
            .sum();
        if inverse_sum <= 0.0 {
            continue;
        }
        let Some(target) = h2h
            .outcomes
            .iter()
            .find(|o| o.name.eq_ignore_ascii_case(outcome) && o.price > 1.0)
        else {
            continue;
        };
        let prob = (1.0 / target.price) / inverse_sum;
        if book.key == "pinnacle" {
            pinnacle_prob = Some(prob);
        }
        probs.push(prob);
    }

    // A single book is an opinion, not a consensus.
    if probs.len() < 2 {
        return None;
    }
    Some(Consensus {
        prob: probs.iter().sum::<f64>() / probs.len() as f64,
        bookmaker_count: probs.len(),
        pinnacle_prob,
    })
}
