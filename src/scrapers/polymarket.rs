//! Polymarket REST client (Gamma metadata + CLOB market data).
//!
//! Gamma fields arrive with inconsistent typing (numbers as strings, JSON
//! arrays encoded inside strings), so every numeric field goes through a
//! tolerant deserializer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::models::{MarketSnapshot, PricePoint, Venue};

const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// One price level of a venue orderbook.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

/// Venue orderbook: bids sorted descending, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<Order>,
    #[serde(default)]
    pub asks: Vec<Order>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|o| o.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|o| o.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn sort(&mut self) {
        self.bids.sort_by(|a, b| {
            b.price
                .partial_cmp(&a.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.asks.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// View of the book from the NO side: bids and asks swap and prices
    /// invert, so NO-side consumers see a normal book.
    pub fn inverted(&self) -> OrderBook {
        let flip = |orders: &[Order]| {
            orders
                .iter()
                .map(|o| Order {
                    price: 1.0 - o.price,
                    size: o.size,
                })
                .collect::<Vec<_>>()
        };
        let mut out = OrderBook {
            bids: flip(&self.asks),
            asks: flip(&self.bids),
        };
        out.sort();
        out
    }
}

/// Gamma market row as served by `/markets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GammaMarket {
    #[serde(rename = "conditionId", default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(rename = "groupItemTitle", default)]
    pub group_item_title: Option<String>,
    #[serde(rename = "negRisk", default)]
    pub neg_risk: bool,
    #[serde(rename = "endDateIso", default, alias = "end_date_iso")]
    pub end_date_iso: Option<String>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub volume24hr: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub liquidity: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub spread: Option<f64>,
    #[serde(rename = "outcomePrices", default, deserialize_with = "de_string_vec")]
    pub outcome_prices: Vec<String>,
    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(rename = "umaResolutionStatus", default)]
    pub resolution_status: Option<String>,
    /// Event slug this market belongs to (present on event-nested rows).
    #[serde(rename = "eventSlug", default)]
    pub event_slug: Option<String>,
}

/// Gamma event row: an event groups mutually-exclusive sub-markets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GammaEvent {
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "negRisk", default)]
    pub neg_risk: bool,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
struct PriceHistoryResponse {
    #[serde(default)]
    history: Vec<PriceHistoryPoint>,
}

#[derive(Debug, Deserialize)]
struct PriceHistoryPoint {
    t: i64,
    #[serde(deserialize_with = "de_f64")]
    p: f64,
}

pub struct PolymarketClient {
    http: Client,
}

impl PolymarketClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("edgebot/0.1")
            .build()
            .expect("reqwest client");
        Self { http }
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    /// Active markets, ordered by 24h volume.
    pub async fn list_markets(&self, limit: usize, offset: usize) -> Result<Vec<GammaMarket>> {
        let response = self
            .http
            .get(format!("{GAMMA_API_BASE}/markets"))
            .query(&[
                ("active", "true"),
                ("closed", "false"),
                ("order", "volume24hr"),
                ("ascending", "false"),
                ("limit", &limit.to_string()),
                ("offset", &offset.to_string()),
            ])
            .send()
            .await
            .context("gamma markets request")?
            .error_for_status()
            .context("gamma markets status")?;

        response.json().await.context("gamma markets json")
    }

    pub async fn market_by_id(&self, condition_id: &str) -> Result<Option<GammaMarket>> {
        let markets: Vec<GammaMarket> = self
            .http
            .get(format!("{GAMMA_API_BASE}/markets"))
            .query(&[("condition_ids", condition_id), ("limit", "1")])
            .send()
            .await
            .context("gamma market lookup request")?
            .error_for_status()
            .context("gamma market lookup status")?
            .json()
            .await
            .context("gamma market lookup json")?;

        Ok(markets.into_iter().next())
    }

    /// Event lookup used to auto-fill missing sub-outcomes of a group.
    pub async fn event_by_slug(&self, slug: &str) -> Result<Option<GammaEvent>> {
        let events: Vec<GammaEvent> = self
            .http
            .get(format!("{GAMMA_API_BASE}/events"))
            .query(&[("slug", slug), ("limit", "1")])
            .send()
            .await
            .context("gamma events request")?
            .error_for_status()
            .context("gamma events status")?
            .json()
            .await
            .context("gamma events json")?;

        Ok(events.into_iter().next())
    }

    pub async fn orderbook(&self, token_id: &str) -> Result<OrderBook> {
        let mut book: OrderBook = self
            .http
            .get(format!("{CLOB_API_BASE}/book"))
            .query(&[("token_id", token_id)])
            .send()
            .await
            .context("clob book request")?
            .error_for_status()
            .context("clob book status")?
            .json()
            .await
            .context("clob book json")?;

        book.sort();
        Ok(book)
    }

    /// Recent price history for a token at the given fidelity (minutes).
    pub async fn price_history(
        &self,
        token_id: &str,
        fidelity_minutes: u32,
        count: usize,
    ) -> Result<Vec<PricePoint>> {
        let response: PriceHistoryResponse = self
            .http
            .get(format!("{CLOB_API_BASE}/prices-history"))
            .query(&[
                ("market", token_id),
                ("fidelity", &fidelity_minutes.to_string()),
                ("interval", "1d"),
            ])
            .send()
            .await
            .context("price history request")?
            .error_for_status()
            .context("price history status")?
            .json()
            .await
            .context("price history json")?;

        let mut points: Vec<PricePoint> = response
            .history
            .into_iter()
            .map(|h| PricePoint {
                ts: h.t,
                price: h.p,
                volume: 0.0,
            })
            .collect();
        points.sort_by_key(|p| p.ts);
        if points.len() > count {
            points.drain(..points.len() - count);
        }
        Ok(points)
    }
}

impl Default for PolymarketClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalise a Gamma row into the engine snapshot. Returns `None` (and logs
/// at DEBUG) when required fields are missing; the caller drops the market.
pub fn normalize_market(market: &GammaMarket) -> Option<MarketSnapshot> {
    let id = market.condition_id.clone()?;
    let question = market.question.clone()?;

    if market.outcome_prices.len() < 2 || market.clob_token_ids.len() < 2 {
        debug!(market = %id, "dropping market without prices or token ids");
        return None;
    }

    let yes_price: f64 = market.outcome_prices[0].parse().ok()?;
    let no_price: f64 = market.outcome_prices[1].parse().ok()?;
    if !(0.0..=1.0).contains(&yes_price) || !(0.0..=1.0).contains(&no_price) {
        debug!(market = %id, yes_price, no_price, "dropping market with out-of-range prices");
        return None;
    }

    let end_date = market
        .end_date_iso
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));

    // UMA statuses look like "resolved: yes"; the engine stores the bare
    // outcome upper-cased.
    let resolution = market.resolution_status.as_deref().and_then(|s| {
        let s = s.trim().to_uppercase();
        if s.ends_with("YES") {
            Some("YES".to_string())
        } else if s.ends_with("NO") {
            Some("NO".to_string())
        } else {
            None
        }
    });

    Some(MarketSnapshot {
        id,
        question,
        venue: Venue::Polymarket,
        yes_price,
        no_price,
        yes_token: market.clob_token_ids[0].clone(),
        no_token: market.clob_token_ids[1].clone(),
        volume_24h: market.volume24hr.unwrap_or(0.0),
        liquidity: market.liquidity.unwrap_or(0.0),
        spread: market.spread.unwrap_or(0.0),
        group_slug: market.event_slug.clone().or_else(|| market.slug.clone()),
        neg_risk: market.neg_risk,
        end_date,
        resolution,
        fetched_at: Utc::now(),
    })
}

pub(crate) fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

pub(crate) fn de_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        _ => Ok(None),
    }
}

/// Some Gamma responses return JSON arrays as a string
/// (e.g. `"[\"Yes\",\"No\"]"`), so accept both shapes.
pub(crate) fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}
