//! Kalshi REST adapter.
//!
//! Kalshi prices are integer cents and its orderbook lists resting YES and
//! NO bids separately. The adapter normalises both into the Polymarket
//! `{bids, asks}` shape so every downstream consumer sees one book format:
//! a resting NO bid at `p` is a YES ask at `1 - p`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::models::{MarketSnapshot, PricePoint, Venue};
use crate::scrapers::polymarket::{Order, OrderBook};

const KALSHI_API_BASE: &str = "https://api.elections.kalshi.com/trade-api/v2";

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<KalshiMarket>,
}

/// Kalshi market row (the fields this engine consumes).
#[derive(Debug, Clone, Deserialize)]
pub struct KalshiMarket {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: Option<String>,
    pub title: String,
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub volume_24h: Option<f64>,
    #[serde(default)]
    pub liquidity: Option<f64>,
    #[serde(default)]
    pub close_time: Option<String>,
    /// "yes" / "no" once settled, empty otherwise.
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: KalshiOrderbook,
}

/// Raw Kalshi book: `[price_cents, contracts]` pairs of resting bids.
#[derive(Debug, Default, Deserialize)]
pub struct KalshiOrderbook {
    #[serde(default)]
    pub yes: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    pub no: Option<Vec<[f64; 2]>>,
}

#[derive(Debug, Deserialize)]
struct TradesResponse {
    #[serde(default)]
    trades: Vec<KalshiTrade>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KalshiTrade {
    #[serde(default)]
    pub yes_price: Option<i64>,
    #[serde(default)]
    pub count: Option<f64>,
    #[serde(default)]
    pub created_time: Option<String>,
}

pub struct KalshiClient {
    http: Client,
}

impl KalshiClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("edgebot/0.1")
            .build()
            .expect("reqwest client");
        Self { http }
    }

    pub async fn list_markets(&self, limit: usize) -> Result<Vec<KalshiMarket>> {
        let response: MarketsResponse = self
            .http
            .get(format!("{KALSHI_API_BASE}/markets"))
            .query(&[("status", "open"), ("limit", &limit.to_string())])
            .send()
            .await
            .context("kalshi markets request")?
            .error_for_status()
            .context("kalshi markets status")?
            .json()
            .await
            .context("kalshi markets json")?;

        Ok(response.markets)
    }

    /// Orderbook for a ticker, mirrored into the Polymarket shape.
    pub async fn orderbook(&self, ticker: &str) -> Result<OrderBook> {
        let response: OrderbookResponse = self
            .http
            .get(format!("{KALSHI_API_BASE}/markets/{ticker}/orderbook"))
            .send()
            .await
            .context("kalshi orderbook request")?
            .error_for_status()
            .context("kalshi orderbook status")?
            .json()
            .await
            .context("kalshi orderbook json")?;

        Ok(mirror_orderbook(&response.orderbook))
    }

    /// Recent trades as price points (yes price, contract count as volume).
    pub async fn trades(&self, ticker: &str, limit: usize) -> Result<Vec<PricePoint>> {
        let response: TradesResponse = self
            .http
            .get(format!("{KALSHI_API_BASE}/markets/{ticker}/trades"))
            .query(&[("limit", &limit.to_string())])
            .send()
            .await
            .context("kalshi trades request")?
            .error_for_status()
            .context("kalshi trades status")?
            .json()
            .await
            .context("kalshi trades json")?;

        let mut points: Vec<PricePoint> = response
            .trades
            .into_iter()
            .filter_map(|t| {
                let price = t.yes_price? as f64 / 100.0;
                let ts = t
                    .created_time
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.timestamp())?;
                Some(PricePoint {
                    ts,
                    price,
                    volume: t.count.unwrap_or(0.0),
                })
            })
            .collect();
        points.sort_by_key(|p| p.ts);
        Ok(points)
    }
}

impl Default for KalshiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Kalshi lists resting YES bids and resting NO bids; a NO bid at `p` is a
/// YES ask at `1 - p`.
pub fn mirror_orderbook(raw: &KalshiOrderbook) -> OrderBook {
    let yes_bids = raw.yes.as_deref().unwrap_or(&[]);
    let no_bids = raw.no.as_deref().unwrap_or(&[]);

    let mut book = OrderBook {
        bids: yes_bids
            .iter()
            .map(|level| Order {
                price: level[0] / 100.0,
                size: level[1],
            })
            .collect(),
        asks: no_bids
            .iter()
            .map(|level| Order {
                price: 1.0 - level[0] / 100.0,
                size: level[1],
            })
            .collect(),
    };
    book.sort();
    book
}

/// Normalise a Kalshi row into the engine snapshot. Tickers double as token
/// ids; the NO side reuses the ticker with a suffix so the book store can
/// key the inverted view separately.
pub fn normalize_market(market: &KalshiMarket) -> Option<MarketSnapshot> {
    let yes_bid = market.yes_bid? as f64 / 100.0;
    let yes_ask = market.yes_ask? as f64 / 100.0;
    if yes_bid <= 0.0 && yes_ask <= 0.0 {
        debug!(ticker = %market.ticker, "dropping kalshi market without quotes");
        return None;
    }

    let yes_price = if yes_bid > 0.0 && yes_ask > 0.0 {
        (yes_bid + yes_ask) / 2.0
    } else {
        yes_bid.max(yes_ask)
    };

    let end_date = market
        .close_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));

    let resolution = market
        .result
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase);

    Some(MarketSnapshot {
        id: market.ticker.clone(),
        question: market.title.clone(),
        venue: Venue::Kalshi,
        yes_price,
        no_price: 1.0 - yes_price,
        yes_token: market.ticker.clone(),
        no_token: format!("{}:NO", market.ticker),
        volume_24h: market.volume_24h.unwrap_or(0.0),
        liquidity: market.liquidity.unwrap_or(0.0),
        spread: (yes_ask - yes_bid).max(0.0),
        group_slug: market.event_ticker.clone(),
        // Kalshi event exclusivity is not surfaced on the market row.
        neg_risk: false,
        end_date,
        resolution,
        fetched_at: Utc::now(),
    })
}
