//! Embedded SQLite store for the hash, header and stats datasets.
use async_trait::async_trait;
use bitcoin::BlockHash;
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio::task;
use tracing::debug;

use crate::{
    dataset::{DatasetKind, DatasetRecord, HashRecord, HeaderRecord, Height, HeightRange, StatsRecord},
    error::StoreError,
    store::{RecordStore, UpsertOutcome},
};

/// One table per dataset, `block_height` is the primary key everywhere.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS block_hashes (
    block_height INTEGER PRIMARY KEY,
    block_hash   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS block_headers (
    block_height        INTEGER PRIMARY KEY,
    block_hash          TEXT NOT NULL,
    confirmations       INTEGER NOT NULL,
    version             INTEGER NOT NULL,
    version_hex         TEXT NOT NULL,
    merkleroot          TEXT NOT NULL,
    time                INTEGER NOT NULL,
    mediantime          INTEGER NOT NULL,
    nonce               INTEGER NOT NULL,
    bits                TEXT NOT NULL,
    difficulty          REAL NOT NULL,
    chainwork           TEXT NOT NULL,
    n_tx                INTEGER NOT NULL,
    previous_block_hash TEXT,
    next_block_hash     TEXT
);

CREATE TABLE IF NOT EXISTS block_stats (
    block_height         INTEGER PRIMARY KEY,
    block_hash           TEXT NOT NULL,
    time                 INTEGER NOT NULL,
    block_timestamp      TEXT,
    total_fee            INTEGER NOT NULL,
    avg_fee              INTEGER NOT NULL,
    avg_fee_rate         INTEGER NOT NULL,
    avg_tx_size          INTEGER NOT NULL,
    txs                  INTEGER NOT NULL,
    ins                  INTEGER NOT NULL,
    outs                 INTEGER NOT NULL,
    maxfee               INTEGER NOT NULL,
    maxfeerate           INTEGER NOT NULL,
    maxtxsize            INTEGER NOT NULL,
    medianfee            INTEGER NOT NULL,
    mediantime           INTEGER NOT NULL,
    mediantxsize         INTEGER NOT NULL,
    minfee               INTEGER NOT NULL,
    minfeerate           INTEGER NOT NULL,
    mintxsize            INTEGER NOT NULL,
    subsidy              INTEGER NOT NULL,
    swtotal_size         INTEGER NOT NULL,
    swtotal_weight       INTEGER NOT NULL,
    swtxs                INTEGER NOT NULL,
    total_out            INTEGER NOT NULL,
    total_size           INTEGER NOT NULL,
    total_weight         INTEGER NOT NULL,
    utxo_increase        INTEGER NOT NULL,
    utxo_size_inc        INTEGER NOT NULL,
    utxo_increase_actual INTEGER,
    utxo_size_inc_actual INTEGER
);
"#;

/// SQLite-backed [`RecordStore`].
///
/// A single connection is shared behind a mutex and every call runs on the
/// blocking pool, so the store can be used from async code and in-memory
/// databases keep their contents for the life of the store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Convenient in-memory store (useful for tests)
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Database location (`:memory:` for in-memory stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await?
    }

    fn insert(conn: &Connection, record: &DatasetRecord) -> Result<usize, StoreError> {
        let n = match record {
            DatasetRecord::Hash(r) => insert_hash(conn, r)?,
            DatasetRecord::Header(r) => insert_header(conn, r)?,
            DatasetRecord::Stats(r) => insert_stats(conn, r)?,
        };
        Ok(n)
    }
}

fn insert_hash(conn: &Connection, r: &HashRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO block_hashes (block_height, block_hash) VALUES (?1, ?2)
         ON CONFLICT(block_height) DO NOTHING",
        params![r.height as i64, r.hash.to_string()],
    )
}

fn insert_header(conn: &Connection, r: &HeaderRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO block_headers (
            block_height, block_hash, confirmations, version, version_hex, merkleroot,
            time, mediantime, nonce, bits, difficulty, chainwork, n_tx,
            previous_block_hash, next_block_hash
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(block_height) DO NOTHING",
        params![
            r.height as i64,
            r.hash.to_string(),
            r.confirmations,
            r.version,
            r.version_hex,
            r.merkle_root.to_string(),
            r.time as i64,
            r.median_time as i64,
            r.nonce,
            r.bits,
            r.difficulty,
            r.chainwork,
            r.tx_count as i64,
            r.prev_hash.map(|h| h.to_string()),
            r.next_hash.map(|h| h.to_string()),
        ],
    )
}

fn insert_stats(conn: &Connection, r: &StatsRecord) -> rusqlite::Result<usize> {
    let timestamp = DateTime::from_timestamp(r.time as i64, 0).map(|t| t.to_rfc3339());
    conn.execute(
        "INSERT INTO block_stats (
            block_height, block_hash, time, block_timestamp, total_fee, avg_fee, avg_fee_rate,
            avg_tx_size, txs, ins, outs, maxfee, maxfeerate, maxtxsize, medianfee, mediantime,
            mediantxsize, minfee, minfeerate, mintxsize, subsidy, swtotal_size, swtotal_weight,
            swtxs, total_out, total_size, total_weight, utxo_increase, utxo_size_inc,
            utxo_increase_actual, utxo_size_inc_actual
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                   ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31)
         ON CONFLICT(block_height) DO NOTHING",
        params![
            r.height as i64,
            r.block_hash.to_string(),
            r.time as i64,
            timestamp,
            r.total_fee as i64,
            r.avg_fee as i64,
            r.avg_fee_rate as i64,
            r.avg_tx_size as i64,
            r.txs as i64,
            r.ins as i64,
            r.outs as i64,
            r.max_fee as i64,
            r.max_fee_rate as i64,
            r.max_tx_size as i64,
            r.median_fee as i64,
            r.median_time as i64,
            r.median_tx_size as i64,
            r.min_fee as i64,
            r.min_fee_rate as i64,
            r.min_tx_size as i64,
            r.subsidy as i64,
            r.sw_total_size as i64,
            r.sw_total_weight as i64,
            r.sw_txs as i64,
            r.total_out as i64,
            r.total_size as i64,
            r.total_weight as i64,
            r.utxo_increase,
            r.utxo_size_inc,
            r.utxo_increase_actual,
            r.utxo_size_inc_actual,
        ],
    )
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn max_height(&self, kind: DatasetKind) -> Result<Option<Height>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT MAX(block_height) FROM {}", kind.table());
            let max: Option<i64> = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(max.map(|h| h as Height))
        })
        .await
    }

    async fn exists(&self, kind: DatasetKind, height: Height) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT 1 FROM {} WHERE block_height = ?1", kind.table());
            let hit: Option<i64> = conn
                .query_row(&sql, params![height as i64], |row| row.get(0))
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, StoreError> {
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT block_hash FROM block_hashes WHERE block_height = ?1",
                    params![height as i64],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| {
                BlockHash::from_str(&s).map_err(|e| StoreError::InvalidValue {
                    table: DatasetKind::Hashes.table(),
                    height,
                    msg: e.to_string(),
                })
            })
            .transpose()
        })
        .await
    }

    async fn upsert(&self, record: &DatasetRecord) -> Result<UpsertOutcome, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let outcome = match Self::insert(conn, &record)? {
                0 => UpsertOutcome::NoOp,
                _ => UpsertOutcome::Stored,
            };
            Ok(outcome)
        })
        .await
    }

    async fn count(&self, kind: DatasetKind) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    /// Set difference computed in SQL: a recursive CTE enumerates `[0, tip]`
    /// and an anti-join drops the stored heights.
    async fn missing_heights(
        &self,
        kind: DatasetKind,
        range: HeightRange,
    ) -> Result<Vec<Height>, StoreError> {
        let Some(tip) = range.tip() else {
            return Ok(Vec::new());
        };
        self.with_conn(move |conn| {
            let sql = format!(
                "WITH RECURSIVE span(h) AS (
                     SELECT 0
                     UNION ALL
                     SELECT h + 1 FROM span WHERE h < ?1
                 )
                 SELECT span.h FROM span
                 LEFT JOIN {table} t ON t.block_height = span.h
                 WHERE t.block_height IS NULL
                 ORDER BY span.h",
                table = kind.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![tip as i64], |row| row.get::<_, i64>(0))?;
            let mut missing = Vec::new();
            for h in rows {
                missing.push(h? as Height);
            }
            Ok(missing)
        })
        .await
    }
}
