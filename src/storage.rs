//! SQLite persistence layer.
//!
//! WAL journalling for concurrent reads during writes, idempotent schema
//! creation, and a one-transaction JSON migration path with `INSERT OR
//! IGNORE` so re-running an import never duplicates rows. When the database
//! path is unwritable the engine runs on an in-memory connection and says so
//! on the status channel.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use crate::models::Opportunity;
use crate::paper::PaperTrade;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    market_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    raw_entry_price REAL NOT NULL,
    applied_slippage REAL NOT NULL,
    size_usd REAL NOT NULL,
    shares REAL NOT NULL,
    score REAL NOT NULL,
    confidence TEXT NOT NULL,
    source TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    outcome TEXT,
    pnl REAL,
    resolved_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_open
    ON trades(resolved, recorded_at DESC);
CREATE INDEX IF NOT EXISTS idx_trades_market
    ON trades(market_id, recorded_at DESC);

CREATE TABLE IF NOT EXISTS edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER,
    market_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    raw_edge REAL NOT NULL,
    net_ev REAL NOT NULL,
    score REAL NOT NULL,
    confidence TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    UNIQUE(market_id, strategy, side, detected_at)
);

CREATE INDEX IF NOT EXISTS idx_edges_recent
    ON edges(detected_at DESC, score DESC);

CREATE TABLE IF NOT EXISTS calibration (
    bucket INTEGER PRIMARY KEY,
    samples INTEGER NOT NULL,
    resolved_yes INTEGER NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS positions (
    trade_id TEXT PRIMARY KEY REFERENCES trades(id),
    market_id TEXT NOT NULL,
    side TEXT NOT NULL,
    shares REAL NOT NULL,
    cost_usd REAL NOT NULL,
    opened_at TEXT NOT NULL,
    closed_at TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id TEXT NOT NULL,
    name TEXT NOT NULL,
    raw_llr REAL NOT NULL,
    weight REAL NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE(market_id, name, recorded_at)
);

CREATE TABLE IF NOT EXISTS scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    markets INTEGER NOT NULL,
    opportunities INTEGER NOT NULL,
    recorded_trades INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backtests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL UNIQUE,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    trades INTEGER NOT NULL DEFAULT 0,
    pnl REAL NOT NULL DEFAULT 0,
    params_json TEXT
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// False when running on the in-memory fallback.
    pub durable: bool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`; fall back to an in-memory
    /// connection when the path is unusable rather than crash the engine.
    pub fn open_or_memory(path: &str) -> Self {
        match Self::open(path) {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, path, "database unavailable; degrading to in-memory storage");
                Self::in_memory()
            }
        }
    }

    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path).context("open sqlite database")?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        info!(path, "sqlite storage ready");
        Ok(Self {
            conn: Mutex::new(conn),
            durable: true,
        })
    }

    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory sqlite");
        conn.execute_batch(SCHEMA_SQL).expect("schema");
        Self {
            conn: Mutex::new(conn),
            durable: false,
        }
    }

    pub fn insert_trade(&self, trade: &PaperTrade) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO trades
             (id, market_id, strategy, side, entry_price, raw_entry_price, applied_slippage,
              size_usd, shares, score, confidence, source, recorded_at, resolved, outcome, pnl, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                trade.id,
                trade.market_id,
                trade.strategy,
                trade.side.as_str(),
                trade.entry_price,
                trade.raw_entry_price,
                trade.applied_slippage,
                trade.size_usd,
                trade.shares,
                trade.score,
                trade.confidence.as_str(),
                format!("{:?}", trade.source).to_uppercase(),
                trade.recorded_at.to_rfc3339(),
                trade.resolved as i64,
                trade.outcome.map(|o| o.as_str()),
                trade.pnl,
                trade.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("insert trade")?;

        conn.execute(
            "INSERT OR IGNORE INTO positions (trade_id, market_id, side, shares, cost_usd, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                trade.id,
                trade.market_id,
                trade.side.as_str(),
                trade.shares,
                trade.size_usd,
                trade.recorded_at.to_rfc3339(),
            ],
        )
        .context("insert position")?;
        Ok(())
    }

    pub fn mark_trade_resolved(&self, trade: &PaperTrade) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET resolved = 1, outcome = ?2, pnl = ?3, resolved_at = ?4 WHERE id = ?1",
            params![
                trade.id,
                trade.outcome.map(|o| o.as_str()),
                trade.pnl,
                trade.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("update trade")?;
        conn.execute(
            "UPDATE positions SET closed_at = ?2 WHERE trade_id = ?1",
            params![trade.id, trade.resolved_at.map(|t| t.to_rfc3339())],
        )
        .context("close position")?;
        Ok(())
    }

    pub fn insert_scan(
        &self,
        markets: usize,
        opportunities: usize,
        recorded_trades: usize,
        duration_ms: u64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scans (started_at, markets, opportunities, recorded_trades, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chrono::Utc::now().to_rfc3339(),
                markets as i64,
                opportunities as i64,
                recorded_trades as i64,
                duration_ms as i64,
            ],
        )
        .context("insert scan")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_edges(&self, scan_id: i64, opportunities: &[Opportunity]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("edges transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO edges
                     (scan_id, market_id, strategy, side, entry_price, raw_edge, net_ev, score, confidence, payload_json, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("prepare edge insert")?;
            for opp in opportunities {
                stmt.execute(params![
                    scan_id,
                    opp.market_id,
                    opp.strategy,
                    opp.side.as_str(),
                    opp.entry_price,
                    opp.raw_edge,
                    opp.net_ev,
                    opp.score,
                    opp.confidence.as_str(),
                    serde_json::to_string(&opp.signal).unwrap_or_default(),
                    opp.detected_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit().context("commit edges")?;
        Ok(())
    }

    pub fn upsert_calibration_bucket(&self, bucket: usize, samples: u64, resolved_yes: u64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO calibration (bucket, samples, resolved_yes, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(bucket) DO UPDATE SET
                     samples = excluded.samples,
                     resolved_yes = excluded.resolved_yes,
                     updated_at = excluded.updated_at",
                params![
                    bucket as i64,
                    samples as i64,
                    resolved_yes as i64,
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .context("upsert calibration bucket")?;
        Ok(())
    }

    pub fn trade_count(&self) -> Result<i64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .context("count trades")
    }

    pub fn edge_count(&self) -> Result<i64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))
            .context("count edges")
    }

    /// Import legacy JSON blobs (paper trades + calibration buckets) in one
    /// transaction. `INSERT OR IGNORE` keys make the import idempotent.
    pub fn migrate_json(&self, paper_trades_path: &Path, calibration_path: &Path) -> Result<MigrationReport> {
        #[derive(Deserialize)]
        struct LegacyPaperFile {
            #[serde(default)]
            open: Vec<PaperTrade>,
            #[serde(default)]
            resolved: Vec<PaperTrade>,
        }
        #[derive(Deserialize)]
        struct LegacyCalibrationFile {
            #[serde(default)]
            buckets: Vec<crate::engine::calibration::CalibrationBucket>,
        }

        let mut report = MigrationReport::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("migration transaction")?;

        if let Ok(raw) = std::fs::read_to_string(paper_trades_path) {
            let file: LegacyPaperFile = serde_json::from_str(&raw).context("parse paper trades")?;
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO trades
                 (id, market_id, strategy, side, entry_price, raw_entry_price, applied_slippage,
                  size_usd, shares, score, confidence, source, recorded_at, resolved, outcome, pnl, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;
            for trade in file.open.iter().chain(file.resolved.iter()) {
                let inserted = stmt.execute(params![
                    trade.id,
                    trade.market_id,
                    trade.strategy,
                    trade.side.as_str(),
                    trade.entry_price,
                    trade.raw_entry_price,
                    trade.applied_slippage,
                    trade.size_usd,
                    trade.shares,
                    trade.score,
                    trade.confidence.as_str(),
                    format!("{:?}", trade.source).to_uppercase(),
                    trade.recorded_at.to_rfc3339(),
                    trade.resolved as i64,
                    trade.outcome.map(|o| o.as_str()),
                    trade.pnl,
                    trade.resolved_at.map(|t| t.to_rfc3339()),
                ])?;
                report.trades += inserted;
            }
        }

        if let Ok(raw) = std::fs::read_to_string(calibration_path) {
            let file: LegacyCalibrationFile = serde_json::from_str(&raw).context("parse calibration")?;
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO calibration (bucket, samples, resolved_yes, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (bucket, entry) in file.buckets.iter().enumerate() {
                if entry.samples == 0 {
                    continue;
                }
                report.calibration_buckets += stmt.execute(params![
                    bucket as i64,
                    entry.samples as i64,
                    entry.resolved_yes as i64,
                    chrono::Utc::now().to_rfc3339(),
                ])?;
            }
        }

        tx.commit().context("commit migration")?;
        info!(
            trades = report.trades,
            buckets = report.calibration_buckets,
            "json migration complete"
        );
        Ok(report)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub trades: usize,
    pub calibration_buckets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfidenceTier, Side};
    use crate::paper::TradeSource;
    use chrono::Utc;

    fn trade(id: &str) -> PaperTrade {
        PaperTrade {
            id: id.to_string(),
            dedup_key: "m1|ICT|YES".to_string(),
            market_id: "m1".to_string(),
            strategy: "ICT".to_string(),
            side: Side::Yes,
            entry_price: 0.5,
            raw_entry_price: 0.5,
            applied_slippage: 0.004,
            size_usd: 10.0,
            shares: 20.0,
            score: 55.0,
            confidence: ConfidenceTier::Medium,
            source: TradeSource::Bot,
            recorded_at: Utc::now(),
            resolved: false,
            outcome: None,
            pnl: None,
            resolved_at: None,
        }
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let path_str = path.to_str().unwrap();
        {
            let store = SqliteStore::open(path_str).unwrap();
            store.insert_trade(&trade("t1")).unwrap();
        }
        // Re-opening re-runs the schema without clobbering data.
        let store = SqliteStore::open(path_str).unwrap();
        assert_eq!(store.trade_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_trade_insert_is_ignored() {
        let store = SqliteStore::in_memory();
        store.insert_trade(&trade("t1")).unwrap();
        store.insert_trade(&trade("t1")).unwrap();
        assert_eq!(store.trade_count().unwrap(), 1);
    }

    #[test]
    fn unusable_path_degrades_to_memory() {
        let store = SqliteStore::open_or_memory("/dev/null/impossible/engine.db");
        assert!(!store.durable);
        store.insert_trade(&trade("t1")).unwrap();
        assert_eq!(store.trade_count().unwrap(), 1);
    }

    #[test]
    fn migration_is_idempotent_across_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let paper_path = dir.path().join("paper-trades.json");
        let calibration_path = dir.path().join("calibration.json");

        let paper = serde_json::json!({
            "open": [trade("t1")],
            "resolved": [trade("t2")],
            "saved_at": 0,
        });
        std::fs::write(&paper_path, paper.to_string()).unwrap();
        let calibration = serde_json::json!({
            "buckets": (0..40).map(|i| serde_json::json!({
                "samples": if i == 20 { 8 } else { 0 },
                "resolved_yes": if i == 20 { 5 } else { 0 },
            })).collect::<Vec<_>>(),
        });
        std::fs::write(&calibration_path, calibration.to_string()).unwrap();

        let store = SqliteStore::in_memory();
        let first = store.migrate_json(&paper_path, &calibration_path).unwrap();
        assert_eq!(first.trades, 2);
        assert_eq!(first.calibration_buckets, 1);

        let second = store.migrate_json(&paper_path, &calibration_path).unwrap();
        assert_eq!(second.trades, 0);
        assert_eq!(second.calibration_buckets, 0);
        assert_eq!(store.trade_count().unwrap(), 2);
    }
}
