//! Venue WebSocket feed for the market channel.
//!
//! Maintains one connection, a bounded LRU subscription set, and pushes every
//! full book (and incrementally patched book) into the snapshot store. The
//! REST refresh acts as fallback when a token has no live feed.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::scrapers::book_store::BookStore;
use crate::scrapers::polymarket::{Order, OrderBook};

const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Hard cap on concurrent token subscriptions; the least recently updated
/// token is evicted beyond this.
pub const MAX_SUBSCRIPTIONS: usize = 50;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(3);
const RECONNECT_FACTOR: f64 = 1.5;
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Book age beyond which a feed entry is not trusted.
pub const WS_STALE_MS: i64 = 120_000;

#[derive(Debug)]
enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Deserialize)]
struct WsBookMsg {
    #[serde(rename = "asset_id")]
    asset_id: String,
    #[serde(default)]
    bids: Vec<Order>,
    #[serde(default)]
    asks: Vec<Order>,
}

#[derive(Debug, Deserialize)]
struct WsPriceChangeMsg {
    #[serde(rename = "asset_id")]
    asset_id: String,
    #[serde(default)]
    changes: Vec<WsLevelChange>,
}

#[derive(Debug, Deserialize)]
struct WsLevelChange {
    #[serde(deserialize_with = "crate::scrapers::polymarket::de_f64")]
    price: f64,
    side: String,
    #[serde(deserialize_with = "crate::scrapers::polymarket::de_f64")]
    size: f64,
}

#[derive(Debug, Deserialize)]
struct WsLastTradeMsg {
    #[serde(rename = "asset_id")]
    asset_id: String,
    #[serde(deserialize_with = "crate::scrapers::polymarket::de_f64")]
    price: f64,
}

/// Live market feed handle. Clone-cheap; the worker task owns the socket.
pub struct MarketWsFeed {
    cmd_tx: mpsc::Sender<WsCommand>,
    book_store: Arc<BookStore>,
    last_trade: RwLock<HashMap<String, f64>>,
    url: String,
}

impl MarketWsFeed {
    /// Spawn the worker task and return the shared handle.
    pub fn spawn(book_store: Arc<BookStore>) -> Arc<Self> {
        Self::spawn_with_url(book_store, DEFAULT_WS_URL.to_string())
    }

    pub fn spawn_with_url(book_store: Arc<BookStore>, url: String) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(1024);
        let feed = Arc::new(Self {
            cmd_tx,
            book_store,
            last_trade: RwLock::new(HashMap::new()),
            url,
        });

        let worker = feed.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run(cmd_rx).await {
                warn!(error = %e, "market ws worker exited");
            }
        });

        feed
    }

    /// Non-blocking subscription request; the worker applies the LRU cap.
    pub fn request_subscribe(&self, token_id: &str) {
        if token_id.trim().is_empty() {
            return;
        }
        let _ = self
            .cmd_tx
            .try_send(WsCommand::Subscribe(token_id.trim().to_string()));
    }

    pub fn request_unsubscribe(&self, token_id: &str) {
        let _ = self
            .cmd_tx
            .try_send(WsCommand::Unsubscribe(token_id.to_string()));
    }

    pub fn last_trade_price(&self, token_id: &str) -> Option<f64> {
        self.last_trade.read().get(token_id).copied()
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<WsCommand>) -> Result<()> {
        // token -> last message instant, used for LRU eviction.
        let mut subscriptions: HashMap<String, Instant> = HashMap::new();
        let mut reconnect_delay = RECONNECT_BASE;

        loop {
            while subscriptions.is_empty() {
                match cmd_rx.recv().await {
                    Some(WsCommand::Subscribe(token)) => {
                        subscriptions.insert(token, Instant::now());
                    }
                    Some(WsCommand::Unsubscribe(_)) => {}
                    None => return Ok(()),
                }
            }

            match self.connect_and_stream(&mut cmd_rx, &mut subscriptions).await {
                Ok(()) => {
                    reconnect_delay = RECONNECT_BASE;
                }
                Err(e) => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    warn!(
                        error = %e,
                        delay_ms = (reconnect_delay + jitter).as_millis() as u64,
                        "market ws disconnected; reconnecting"
                    );
                    sleep(reconnect_delay + jitter).await;
                    reconnect_delay = Duration::from_secs_f64(
                        (reconnect_delay.as_secs_f64() * RECONNECT_FACTOR)
                            .min(RECONNECT_CAP.as_secs_f64()),
                    );
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<WsCommand>,
        subscriptions: &mut HashMap<String, Instant>,
    ) -> Result<()> {
        info!(url = %self.url, "connecting market ws");
        let (ws_stream, resp) = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .context("market ws connect timeout")?
            .context("market ws connect")?;
        info!(status = %resp.status(), "market ws connected");

        let (mut write, mut read) = ws_stream.split();

        let initial: Vec<String> = subscriptions.keys().cloned().collect();
        let sub_msg = serde_json::json!({
            "type": "subscribe",
            "channel": "market",
            "assets_ids": initial,
        });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .context("send initial market subscription")?;

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(());
                    };
                    match cmd {
                        WsCommand::Subscribe(token) => {
                            if subscriptions.contains_key(&token) {
                                continue;
                            }
                            if subscriptions.len() >= MAX_SUBSCRIPTIONS {
                                if let Some(evict) = subscriptions
                                    .iter()
                                    .min_by_key(|(_, at)| **at)
                                    .map(|(t, _)| t.clone())
                                {
                                    debug!(token = %evict, "evicting least recently updated subscription");
                                    subscriptions.remove(&evict);
                                    let msg = serde_json::json!({
                                        "type": "unsubscribe",
                                        "channel": "market",
                                        "assets_ids": [evict],
                                    });
                                    let _ = write.send(Message::Text(msg.to_string())).await;
                                }
                            }
                            subscriptions.insert(token.clone(), Instant::now());
                            let msg = serde_json::json!({
                                "type": "subscribe",
                                "channel": "market",
                                "assets_ids": [token],
                            });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        WsCommand::Unsubscribe(token) => {
                            if subscriptions.remove(&token).is_some() {
                                let msg = serde_json::json!({
                                    "type": "unsubscribe",
                                    "channel": "market",
                                    "assets_ids": [token],
                                });
                                let _ = write.send(Message::Text(msg.to_string())).await;
                            }
                        }
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow::anyhow!("market ws stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            if let Some(token) = self.handle_text_message(&text) {
                                subscriptions.insert(token, Instant::now());
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "market ws close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("market ws error: {e}"));
                        }
                    }
                }
            }
        }
    }

    /// Returns the touched token id so the caller can refresh its LRU slot.
    fn handle_text_message(&self, text: &str) -> Option<String> {
        if text.eq_ignore_ascii_case("PONG") {
            return None;
        }
        let json: serde_json::Value = serde_json::from_str(text).ok()?;

        // Frames may arrive as a single message or an array of messages.
        if let Some(array) = json.as_array() {
            let mut touched = None;
            for item in array {
                if let Some(token) = self.handle_event(item) {
                    touched = Some(token);
                }
            }
            return touched;
        }
        self.handle_event(&json)
    }

    fn handle_event(&self, json: &serde_json::Value) -> Option<String> {
        let event_type = json.get("event_type").and_then(|v| v.as_str())?;
        match event_type {
            "book" => {
                let msg: WsBookMsg = serde_json::from_value(json.clone()).ok()?;
                let mut book = OrderBook {
                    bids: msg.bids,
                    asks: msg.asks,
                };
                book.sort();
                self.book_store.record(&msg.asset_id, &book);
                Some(msg.asset_id)
            }
            "price_change" => {
                let msg: WsPriceChangeMsg = serde_json::from_value(json.clone()).ok()?;
                let mut book = self.book_store.latest(&msg.asset_id, WS_STALE_MS)?;
                for change in &msg.changes {
                    apply_level_change(&mut book, change);
                }
                book.sort();
                self.book_store.record(&msg.asset_id, &book);
                Some(msg.asset_id)
            }
            "last_trade_price" => {
                let msg: WsLastTradeMsg = serde_json::from_value(json.clone()).ok()?;
                self.last_trade
                    .write()
                    .insert(msg.asset_id.clone(), msg.price);
                Some(msg.asset_id)
            }
            "tick_size_change" => {
                debug!("tick size change frame");
                None
            }
            _ => None,
        }
    }
}

fn apply_level_change(book: &mut OrderBook, change: &WsLevelChange) {
    let side = if change.side.eq_ignore_ascii_case("BUY") {
        &mut book.bids
    } else {
        &mut book.asks
    };
    side.retain(|o| (o.price - change.price).abs() > f64::EPSILON);
    if change.size > 0.0 {
        side.push(Order {
            price: change.price,
            size: change.size,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_change_replaces_and_removes() {
        let mut book = OrderBook {
            bids: vec![Order { price: 0.40, size: 100.0 }],
            asks: vec![Order { price: 0.45, size: 50.0 }],
        };

        apply_level_change(
            &mut book,
            &WsLevelChange {
                price: 0.40,
                side: "BUY".to_string(),
                size: 250.0,
            },
        );
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].size, 250.0);

        apply_level_change(
            &mut book,
            &WsLevelChange {
                price: 0.45,
                side: "SELL".to_string(),
                size: 0.0,
            },
        );
        assert!(book.asks.is_empty());
    }
}
