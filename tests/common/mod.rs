#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::hashes::Hash as _;
use bitcoin::BlockHash;
use chain_backfill::{
    DatasetKind, DatasetRecord, FetchError, Height, RecordStore, RpcMethod, RpcTransport,
    StoreError, UpsertOutcome,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

/// Deterministic hash for a height; the height sits in the first 8 bytes.
pub fn hash_at(height: Height) -> BlockHash {
    let mut bytes = [0xabu8; 32];
    bytes[..8].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

fn height_of(hash: &str) -> Option<Height> {
    let hash = BlockHash::from_str(hash).ok()?;
    let bytes = hash.to_byte_array();
    let mut h = [0u8; 8];
    h.copy_from_slice(&bytes[..8]);
    Some(Height::from_le_bytes(h))
}

pub fn header_json(height: Height, tip: Height) -> Value {
    let mut v = json!({
        "hash": hash_at(height).to_string(),
        "confirmations": tip - height + 1,
        "height": height,
        "version": 536870912,
        "versionHex": "20000000",
        "merkleroot": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        "time": 1_700_000_000 + height * 600,
        "mediantime": 1_700_000_000 + height * 600 - 3000,
        "nonce": 42 + height,
        "bits": "17034219",
        "difficulty": 86388558925171.02,
        "chainwork": "0000000000000000000000000000000000000000753bdab0e0d745453677442b",
        "nTx": 1 + height,
    });
    if height > 0 {
        v["previousblockhash"] = json!(hash_at(height - 1).to_string());
    }
    if height < tip {
        v["nextblockhash"] = json!(hash_at(height + 1).to_string());
    }
    v
}

pub fn stats_json(height: Height) -> Value {
    json!({
        "avgfee": 1200,
        "avgfeerate": 7,
        "avgtxsize": 380,
        "blockhash": hash_at(height).to_string(),
        "feerate_percentiles": [1, 2, 5, 9, 20],
        "height": height,
        "ins": 5000,
        "maxfee": 250000,
        "maxfeerate": 300,
        "maxtxsize": 90000,
        "medianfee": 800,
        "mediantime": 1_700_000_000 + height * 600 - 3000,
        "mediantxsize": 225,
        "minfee": 110,
        "minfeerate": 1,
        "mintxsize": 150,
        "outs": 7000,
        "subsidy": 312500000,
        "swtotal_size": 1200000,
        "swtotal_weight": 3900000,
        "swtxs": 3000,
        "time": 1_700_000_000 + height * 600,
        "total_out": 900000000000u64,
        "total_size": 1500000,
        "total_weight": 3990000,
        "totalfee": 3600000,
        "txs": 3001,
        "utxo_increase": -120,
        "utxo_size_inc": -9000
    })
}

/// A fake node answering getblockcount/getblockhash/getblockheader/getblockstats.
pub struct FakeChain {
    tip: Option<Height>,
    calls: Mutex<Vec<(RpcMethod, Vec<Value>)>>,
    failures: Mutex<HashMap<RpcMethod, u32>>,
    lying: HashSet<Height>,
    forged: HashSet<Height>,
}

impl FakeChain {
    pub fn new(tip: Option<Height>) -> Self {
        Self {
            tip,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            lying: HashSet::new(),
            forged: HashSet::new(),
        }
    }

    /// The next `n` calls of `method` fail with HTTP 503.
    pub fn fail_next(self, method: RpcMethod, n: u32) -> Self {
        self.failures.lock().unwrap().insert(method, n);
        self
    }

    /// Stats and headers at `height` report the wrong height.
    pub fn lie_about(mut self, height: Height) -> Self {
        self.lying.insert(height);
        self
    }

    /// The header at `height` carries the hash of another block.
    pub fn forge_header(mut self, height: Height) -> Self {
        self.forged.insert(height);
        self
    }

    pub fn calls(&self) -> Vec<(RpcMethod, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, method: RpcMethod) -> usize {
        self.calls().iter().filter(|(m, _)| *m == method).count()
    }

    fn in_range(&self, h: Height) -> bool {
        self.tip.is_some_and(|t| h <= t)
    }

    fn reported(&self, h: Height) -> Height {
        if self.lying.contains(&h) {
            h + 1000
        } else {
            h
        }
    }
}

fn out_of_range() -> FetchError {
    FetchError::Rpc {
        code: -8,
        message: "Block height out of range".into(),
    }
}

#[async_trait]
impl RpcTransport for FakeChain {
    async fn call(&self, method: RpcMethod, params: Vec<Value>) -> Result<Value, FetchError> {
        self.calls.lock().unwrap().push((method, params.clone()));
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(n) = failures.get_mut(&method) {
                if *n > 0 {
                    *n -= 1;
                    return Err(FetchError::Http { status: 503 });
                }
            }
        }
        match method {
            RpcMethod::GetBlockCount => Ok(json!(self.tip.map_or(-1, |t| t as i64))),
            RpcMethod::GetBlockHash => {
                let h = params[0].as_u64().ok_or_else(out_of_range)?;
                if !self.in_range(h) {
                    return Err(out_of_range());
                }
                Ok(json!(hash_at(h).to_string()))
            }
            RpcMethod::GetBlockHeader => {
                let h = params[0]
                    .as_str()
                    .and_then(height_of)
                    .filter(|h| self.in_range(*h))
                    .ok_or_else(|| FetchError::Rpc {
                        code: -5,
                        message: "Block not found".into(),
                    })?;
                let mut v = header_json(h, self.tip.unwrap_or(h));
                v["height"] = json!(self.reported(h));
                if self.forged.contains(&h) {
                    v["hash"] = json!(hash_at(h + 5000).to_string());
                }
                Ok(v)
            }
            RpcMethod::GetBlockStats => {
                let h = params[0].as_u64().ok_or_else(out_of_range)?;
                if !self.in_range(h) {
                    return Err(out_of_range());
                }
                let mut v = stats_json(h);
                v["height"] = json!(self.reported(h));
                Ok(v)
            }
        }
    }
}

/// Minimal in-memory store for tests (keeps engine generic & fast).
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<BTreeMap<DatasetKind, BTreeMap<Height, DatasetRecord>>>,
    writes: Mutex<Vec<(DatasetKind, Height)>>,
    fail_upserts_from: Option<Height>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert at or above `height` fails like a lost connection.
    pub fn failing_from(height: Height) -> Self {
        Self {
            fail_upserts_from: Some(height),
            ..Self::default()
        }
    }

    pub fn seed(&self, record: DatasetRecord) {
        self.rows
            .lock()
            .unwrap()
            .entry(record.kind())
            .or_default()
            .insert(record.height(), record);
    }

    pub fn heights(&self, kind: DatasetKind) -> Vec<Height> {
        self.rows
            .lock()
            .unwrap()
            .get(&kind)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, kind: DatasetKind, height: Height) -> Option<DatasetRecord> {
        self.rows
            .lock()
            .unwrap()
            .get(&kind)
            .and_then(|m| m.get(&height).cloned())
    }

    /// Successful writes, in the order they happened.
    pub fn writes(&self) -> Vec<(DatasetKind, Height)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for MemStore {
    async fn max_height(&self, kind: DatasetKind) -> Result<Option<Height>, StoreError> {
        Ok(self.heights(kind).last().copied())
    }

    async fn exists(&self, kind: DatasetKind, height: Height) -> Result<bool, StoreError> {
        Ok(self.get(kind, height).is_some())
    }

    async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, StoreError> {
        Ok(self
            .get(DatasetKind::Hashes, height)
            .map(|r| r.block_hash()))
    }

    async fn upsert(&self, record: &DatasetRecord) -> Result<UpsertOutcome, StoreError> {
        if self.fail_upserts_from.is_some_and(|h| record.height() >= h) {
            return Err(StoreError::Other("connection reset".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        let table = rows.entry(record.kind()).or_default();
        if table.contains_key(&record.height()) {
            return Ok(UpsertOutcome::NoOp);
        }
        table.insert(record.height(), record.clone());
        self.writes
            .lock()
            .unwrap()
            .push((record.kind(), record.height()));
        Ok(UpsertOutcome::Stored)
    }

    async fn count(&self, kind: DatasetKind) -> Result<u64, StoreError> {
        Ok(self.heights(kind).len() as u64)
    }
}
