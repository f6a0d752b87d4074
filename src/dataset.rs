//! Dataset kinds, their records, and the height range they are audited over.
use bitcoin::{BlockHash, TxMerkleNode};
use serde::Deserialize;
use std::{fmt, str::FromStr};

use crate::error::BackfillError;

/// Zero-based position of a block in the chain.
pub type Height = u64;

/// One of the three parallel record families ingested by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetKind {
    /// `getblockhash` results.
    Hashes,
    /// Verbose `getblockheader` results.
    Headers,
    /// `getblockstats` results.
    Stats,
}

impl DatasetKind {
    /// Every dataset, in default drain order (hashes first so headers can reuse them).
    pub const ALL: [DatasetKind; 3] = [DatasetKind::Hashes, DatasetKind::Headers, DatasetKind::Stats];

    /// Store table backing this dataset.
    pub fn table(self) -> &'static str {
        match self {
            DatasetKind::Hashes => "block_hashes",
            DatasetKind::Headers => "block_headers",
            DatasetKind::Stats => "block_stats",
        }
    }

    /// RPC method producing this dataset's records.
    pub fn method(self) -> RpcMethod {
        match self {
            DatasetKind::Hashes => RpcMethod::GetBlockHash,
            DatasetKind::Headers => RpcMethod::GetBlockHeader,
            DatasetKind::Stats => RpcMethod::GetBlockStats,
        }
    }

    /// Dataset whose record must be resolved before this one can be fetched.
    pub fn depends_on(self) -> Option<DatasetKind> {
        match self {
            DatasetKind::Headers => Some(DatasetKind::Hashes),
            DatasetKind::Hashes | DatasetKind::Stats => None,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            DatasetKind::Hashes => "hashes",
            DatasetKind::Headers => "headers",
            DatasetKind::Stats => "stats",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for DatasetKind {
    type Err = BackfillError;

    /// Accepts either the short name (`hashes`) or the table name (`block_hashes`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetKind::ALL
            .into_iter()
            .find(|k| s == k.short_name() || s == k.table())
            .ok_or_else(|| BackfillError::Contract(format!("unknown dataset kind `{s}`")))
    }
}

/// Upstream JSON-RPC methods the engine speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    /// `getblockcount()`
    GetBlockCount,
    /// `getblockhash(height)`
    GetBlockHash,
    /// `getblockheader(hash, verbose)`
    GetBlockHeader,
    /// `getblockstats(height)`
    GetBlockStats,
}

impl RpcMethod {
    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::GetBlockCount => "getblockcount",
            RpcMethod::GetBlockHash => "getblockhash",
            RpcMethod::GetBlockHeader => "getblockheader",
            RpcMethod::GetBlockStats => "getblockstats",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive range `[0, tip]`. A `None` tip is the empty range (the `-1` sentinel).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HeightRange {
    tip: Option<Height>,
}

impl HeightRange {
    /// The empty range.
    pub const EMPTY: HeightRange = HeightRange { tip: None };

    /// `[0, tip]`, or empty when `tip` is `None`.
    pub fn up_to(tip: Option<Height>) -> Self {
        Self { tip }
    }

    /// Builds the range from the integer form where `-1` means "no data upstream".
    pub fn from_sentinel(tip: i64) -> Result<Self, BackfillError> {
        match tip {
            -1 => Ok(Self::EMPTY),
            t if t >= 0 => Ok(Self { tip: Some(t as Height) }),
            t => Err(BackfillError::Contract(format!("tip must be >= -1, got {t}"))),
        }
    }

    /// Highest height in the range, if any.
    pub fn tip(&self) -> Option<Height> {
        self.tip
    }

    /// The integer form of the tip, `-1` when empty.
    pub fn sentinel(&self) -> i64 {
        self.tip.map_or(-1, |t| t as i64)
    }

    /// Number of heights in the range.
    /// Saturates at `u64::MAX` for the full range.
    pub fn len(&self) -> u64 {
        self.tip.map_or(0, |t| t.saturating_add(1))
    }

    /// `true` for the `-1` range.
    pub fn is_empty(&self) -> bool {
        self.tip.is_none()
    }

    /// Whether `height` lies inside `[0, tip]`.
    pub fn contains(&self, height: Height) -> bool {
        self.tip.is_some_and(|t| height <= t)
    }

    /// Heights in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Height> {
        self.above(None)
    }

    /// Heights strictly above `floor` (or all heights when `floor` is `None`).
    pub fn above(&self, floor: Option<Height>) -> impl Iterator<Item = Height> {
        let start = floor.map_or(Some(0), |f| f.checked_add(1));
        match (start, self.tip) {
            (Some(start), Some(tip)) => start..=tip,
            _ => 1..=0,
        }
    }
}

/// `getblockhash` result at a height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashRecord {
    /// Natural key.
    pub height: Height,
    /// Block hash at `height`.
    pub hash: BlockHash,
}

/// Verbose `getblockheader` result.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct HeaderRecord {
    /// Natural key.
    pub height: Height,
    /// Hash of this header.
    pub hash: BlockHash,
    /// Confirmations at fetch time (`-1` for blocks off the active chain).
    pub confirmations: i64,
    /// Block version.
    pub version: i32,
    /// Block version, hex encoded.
    #[serde(rename = "versionHex")]
    pub version_hex: String,
    /// Merkle root of the block's transactions.
    #[serde(rename = "merkleroot")]
    pub merkle_root: TxMerkleNode,
    /// Header timestamp (unix seconds).
    pub time: u64,
    /// Median time past (unix seconds).
    #[serde(rename = "mediantime")]
    pub median_time: u64,
    /// Header nonce.
    pub nonce: u32,
    /// Compact target, hex encoded.
    pub bits: String,
    /// Difficulty relative to the minimum.
    pub difficulty: f64,
    /// Cumulative chain work, hex encoded.
    pub chainwork: String,
    /// Number of transactions in the block.
    #[serde(rename = "nTx")]
    pub tx_count: u64,
    /// Parent hash; absent for genesis.
    #[serde(rename = "previousblockhash", default)]
    pub prev_hash: Option<BlockHash>,
    /// Child hash; absent at the tip.
    #[serde(rename = "nextblockhash", default)]
    pub next_hash: Option<BlockHash>,
}

/// `getblockstats` result.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StatsRecord {
    /// Natural key.
    pub height: Height,
    /// Hash of the block these stats describe.
    #[serde(rename = "blockhash")]
    pub block_hash: BlockHash,
    /// Block timestamp (unix seconds).
    pub time: u64,
    /// Sum of fees (sats).
    #[serde(rename = "totalfee")]
    pub total_fee: u64,
    /// Average fee per transaction (sats).
    #[serde(rename = "avgfee", default)]
    pub avg_fee: u64,
    /// Average feerate (sat/vB).
    #[serde(rename = "avgfeerate")]
    pub avg_fee_rate: u64,
    /// Average transaction size (bytes).
    #[serde(rename = "avgtxsize", default)]
    pub avg_tx_size: u64,
    /// Transaction count, coinbase included.
    pub txs: u64,
    /// Inputs, coinbase excluded.
    pub ins: u64,
    /// Outputs, coinbase excluded.
    pub outs: u64,
    /// Largest fee (sats).
    #[serde(rename = "maxfee")]
    pub max_fee: u64,
    /// Largest feerate (sat/vB).
    #[serde(rename = "maxfeerate")]
    pub max_fee_rate: u64,
    /// Largest transaction (bytes).
    #[serde(rename = "maxtxsize")]
    pub max_tx_size: u64,
    /// Median fee (sats).
    #[serde(rename = "medianfee")]
    pub median_fee: u64,
    /// Median time past (unix seconds).
    #[serde(rename = "mediantime")]
    pub median_time: u64,
    /// Median transaction size (bytes).
    #[serde(rename = "mediantxsize")]
    pub median_tx_size: u64,
    /// Smallest fee (sats).
    #[serde(rename = "minfee")]
    pub min_fee: u64,
    /// Smallest feerate (sat/vB).
    #[serde(rename = "minfeerate")]
    pub min_fee_rate: u64,
    /// Smallest transaction (bytes).
    #[serde(rename = "mintxsize")]
    pub min_tx_size: u64,
    /// Block subsidy (sats).
    pub subsidy: u64,
    /// Total size of segwit transactions.
    #[serde(rename = "swtotal_size")]
    pub sw_total_size: u64,
    /// Total weight of segwit transactions.
    #[serde(rename = "swtotal_weight")]
    pub sw_total_weight: u64,
    /// Segwit transaction count.
    #[serde(rename = "swtxs")]
    pub sw_txs: u64,
    /// Total output value, coinbase excluded (sats).
    pub total_out: u64,
    /// Total size of non-coinbase transactions.
    pub total_size: u64,
    /// Total weight of non-coinbase transactions.
    pub total_weight: u64,
    /// Net change in UTXO count; negative when a block spends more than it creates.
    pub utxo_increase: i64,
    /// Net change in UTXO set size (bytes).
    pub utxo_size_inc: i64,
    /// Only reported by nodes that exclude unspendable outputs.
    #[serde(default)]
    pub utxo_increase_actual: Option<i64>,
    /// Like `utxo_size_inc`, unspendables excluded.
    #[serde(default)]
    pub utxo_size_inc_actual: Option<i64>,
}

/// A record of any dataset, keyed by height.
#[derive(Clone, Debug, PartialEq)]
pub enum DatasetRecord {
    /// See [`HashRecord`].
    Hash(HashRecord),
    /// See [`HeaderRecord`].
    Header(HeaderRecord),
    /// See [`StatsRecord`].
    Stats(StatsRecord),
}

impl DatasetRecord {
    /// Natural key of the record.
    pub fn height(&self) -> Height {
        match self {
            DatasetRecord::Hash(r) => r.height,
            DatasetRecord::Header(r) => r.height,
            DatasetRecord::Stats(r) => r.height,
        }
    }

    /// Dataset the record belongs to.
    pub fn kind(&self) -> DatasetKind {
        match self {
            DatasetRecord::Hash(_) => DatasetKind::Hashes,
            DatasetRecord::Header(_) => DatasetKind::Headers,
            DatasetRecord::Stats(_) => DatasetKind::Stats,
        }
    }

    /// Block hash carried by the record.
    pub fn block_hash(&self) -> BlockHash {
        match self {
            DatasetRecord::Hash(r) => r.hash,
            DatasetRecord::Header(r) => r.hash,
            DatasetRecord::Stats(r) => r.block_hash,
        }
    }
}

impl From<HashRecord> for DatasetRecord {
    fn from(r: HashRecord) -> Self {
        DatasetRecord::Hash(r)
    }
}

impl From<HeaderRecord> for DatasetRecord {
    fn from(r: HeaderRecord) -> Self {
        DatasetRecord::Header(r)
    }
}

impl From<StatsRecord> for DatasetRecord {
    fn from(r: StatsRecord) -> Self {
        DatasetRecord::Stats(r)
    }
}
