//! Core data model shared across the engine.
//!
//! Snapshots are immutable per scan: the market cache owns them and every
//! downstream component reads through `Arc`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Venue a market lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    #[serde(rename = "POLY")]
    Polymarket,
    #[serde(rename = "KALSHI")]
    Kalshi,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Polymarket => "POLY",
            Venue::Kalshi => "KALSHI",
        }
    }
}

/// Which outcome token an opportunity or trade is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "HIGH",
            ConfidenceTier::Medium => "MEDIUM",
            ConfidenceTier::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// One point of venue price history. Volume is zero when the venue does not
/// report per-point volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: i64,
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Normalised, immutable view of one binary market at scan time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Stable identifier (condition id on Polymarket, ticker on Kalshi).
    pub id: String,
    pub question: String,
    pub venue: Venue,
    pub yes_price: f64,
    pub no_price: f64,
    /// Venue token id backing the YES outcome.
    pub yes_token: String,
    /// Venue token id backing the NO outcome.
    pub no_token: String,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub spread: f64,
    /// Event slug shared by mutually-exclusive sub-markets.
    pub group_slug: Option<String>,
    /// Exchange-confirmed exclusivity of the group.
    pub neg_risk: bool,
    pub end_date: Option<DateTime<Utc>>,
    /// Upper-cased terminal outcome when the venue has resolved the market.
    pub resolution: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Markets priced at the extremes carry no tradeable edge.
    pub fn in_tradeable_band(&self) -> bool {
        self.yes_price > 0.05 && self.yes_price < 0.95
    }

    pub fn hours_to_expiry(&self) -> Option<f64> {
        self.end_date
            .map(|end| (end.timestamp() - Utc::now().timestamp()) as f64 / 3600.0)
    }
}

/// Typed payload attached to an opportunity, keyed by the strategy that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpportunitySignal {
    CrossVenueValue {
        consensus_prob: f64,
        market_prob: f64,
        bookmaker_count: usize,
        pinnacle_agrees: bool,
    },
    Complement {
        price_sum: f64,
        net_deviation: f64,
    },
    GroupArbitrage {
        group_slug: String,
        leg_count: usize,
        price_sum: f64,
        coverage: f64,
        complete: bool,
    },
    BookArbitrage {
        /// "sell_sell" (bid legs) or "buy_buy" (ask legs).
        mode: String,
        yes_price: f64,
        no_price: f64,
        fillable_usd: f64,
    },
    Microstructure {
        imbalance: f64,
        sweep: f64,
        order_blocks: f64,
        divergence: f64,
        spoof_score: u32,
        book_confidence: f64,
    },
    Momentum {
        trend_strength: f64,
        roc5: f64,
        acceleration: f64,
        volume_ratio: f64,
        zscore: f64,
    },
    WhaleFlow {
        spike_ratio: f64,
        direction: f64,
        accumulation: f64,
        price_impact: f64,
    },
    Manual,
}

/// A ranked, fee-adjusted trading opportunity emitted by one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub strategy: String,
    pub venue: Venue,
    pub market_id: String,
    pub question: String,
    pub side: Side,
    pub entry_price: f64,
    pub size_usd: f64,
    pub raw_edge: f64,
    pub net_ev: f64,
    /// 0..=100 composite quality score.
    pub score: f64,
    pub confidence: ConfidenceTier,
    pub risk_tier: RiskTier,
    /// Worst-case description attached by the emitting strategy.
    pub risk_note: String,
    pub signal: OpportunitySignal,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    /// Dedup key space shared by the paper trader and the tracker.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.market_id, self.strategy, self.side.as_str())
    }

    /// Orchestrator-level dedup collapses sides, keeping the best instance
    /// per (market, strategy).
    pub fn rank_key(&self) -> String {
        format!("{}|{}", self.market_id, self.strategy)
    }
}

/// Typed events broadcast on the status channel. The HTTP/SSE surface
/// consuming these is an external collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "scan:complete")]
    ScanComplete {
        scan_id: i64,
        markets: usize,
        opportunities: usize,
        duration_ms: u64,
    },
    #[serde(rename = "trade:new")]
    TradeNew {
        trade_id: String,
        market_id: String,
        strategy: String,
        side: Side,
        entry_price: f64,
        size_usd: f64,
    },
    #[serde(rename = "trade:closed")]
    TradeClosed {
        trade_id: String,
        market_id: String,
        outcome: Side,
        pnl: f64,
        bankroll: f64,
    },
    #[serde(rename = "edge:detected")]
    EdgeDetected {
        market_id: String,
        strategy: String,
        side: Side,
        score: f64,
        net_ev: f64,
    },
    #[serde(rename = "alert:fired")]
    AlertFired { message: String },
    #[serde(rename = "price:move")]
    PriceMove {
        market_id: String,
        previous: f64,
        current: f64,
    },
    #[serde(rename = "risk:warning")]
    RiskWarning { message: String },
    #[serde(rename = "status:update")]
    StatusUpdate { component: String, status: String },
}

/// Machine-usable failure codes surfaced at request boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A trade was already resolved; resolving again is rejected.
    AlreadyResolved(String),
    /// The simulated bankroll is exhausted; recording is blocked until reset.
    BankrollBusted,
    /// An unknown trade or market id was referenced.
    NotFound(String),
    /// Bad configuration rejected at the entry point.
    InvalidConfig(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::AlreadyResolved(_) => "ALREADY_RESOLVED",
            EngineError::BankrollBusted => "BANKROLL_BUSTED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::AlreadyResolved(id) => {
                write!(f, "[ALREADY_RESOLVED] trade {id} is already resolved")
            }
            EngineError::BankrollBusted => {
                write!(f, "[BANKROLL_BUSTED] paper bankroll is exhausted; reset required")
            }
            EngineError::NotFound(what) => write!(f, "[NOT_FOUND] {what}"),
            EngineError::InvalidConfig(msg) => write!(f, "[INVALID_CONFIG] {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub data_dir: String,
    pub scan_interval_secs: u64,
    pub resolution_interval_secs: u64,
    pub starting_bankroll: f64,
    pub max_exposure_pct: f64,
    pub kelly_fraction: f64,
    pub top_n_per_scan: usize,
    pub odds_api_key: Option<String>,
    pub news_api_key: Option<String>,
    pub kalshi_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./edgebot.db".to_string());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let scan_interval_secs = std::env::var("SCAN_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let resolution_interval_secs = std::env::var("RESOLUTION_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let starting_bankroll = std::env::var("STARTING_BANKROLL")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000.0);
        if starting_bankroll <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "STARTING_BANKROLL must be positive, got {starting_bankroll}"
            ))
            .into());
        }

        let max_exposure_pct = std::env::var("MAX_EXPOSURE_PCT")
            .unwrap_or_else(|_| "0.05".to_string())
            .parse()
            .unwrap_or(0.05);

        let kelly_fraction = std::env::var("KELLY_FRACTION")
            .unwrap_or_else(|_| "0.25".to_string())
            .parse()
            .unwrap_or(0.25);
        if !(0.0..=1.0).contains(&kelly_fraction) {
            return Err(EngineError::InvalidConfig(format!(
                "KELLY_FRACTION must be in [0,1], got {kelly_fraction}"
            ))
            .into());
        }

        let top_n_per_scan = std::env::var("TOP_N_PER_SCAN")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        let odds_api_key = std::env::var("ODDS_API_KEY").ok().filter(|k| !k.is_empty());
        let news_api_key = std::env::var("NEWS_API_KEY").ok().filter(|k| !k.is_empty());

        let kalshi_enabled = std::env::var("KALSHI_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        Ok(Self {
            database_path,
            data_dir,
            scan_interval_secs,
            resolution_interval_secs,
            starting_bankroll,
            max_exposure_pct,
            kelly_fraction,
            top_n_per_scan,
            odds_api_key,
            news_api_key,
            kalshi_enabled,
        })
    }
}
