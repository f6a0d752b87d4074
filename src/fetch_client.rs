//! Resilient fetch client: one logical request per call, transient failures retried.
use async_trait::async_trait;
use bitcoin::BlockHash;
use serde_json::{json, Value};
use std::{fmt, str::FromStr};
use tokio_util::sync::CancellationToken;

use crate::{
    dataset::{
        DatasetKind, DatasetRecord, HashRecord, HeaderRecord, Height, HeightRange, RpcMethod,
        StatsRecord,
    },
    error::FetchError,
    retry::{Fetched, RetryPolicy},
    rpc::RpcTransport,
};

/// How a record is addressed upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchKey {
    /// By chain position.
    Height(Height),
    /// By block hash.
    Hash(BlockHash),
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchKey::Height(h) => write!(f, "height {h}"),
            FetchKey::Hash(h) => write!(f, "hash {h}"),
        }
    }
}

/// Where the engine gets records and the chain tip from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Highest height upstream (`getblockcount`).
    async fn chain_tip(&self) -> Result<HeightRange, FetchError>;

    /// Fetch one record of `kind` addressed by `key`.
    ///
    /// Only returns once the record is decoded, the retry policy is exhausted,
    /// the request is unsupported, or the client is cancelled.
    async fn fetch(
        &self,
        kind: DatasetKind,
        key: FetchKey,
    ) -> Result<Fetched<DatasetRecord>, FetchError>;
}

/// [`RecordSource`] over a JSON-RPC transport with an injected retry policy.
pub struct FetchClient<T> {
    transport: T,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<T: RpcTransport> FetchClient<T> {
    /// Client with the default (unbounded, fixed delay) policy.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Abort pending backoff sleeps when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn block_hash_once(&self, height: Height) -> Result<BlockHash, FetchError> {
        let v = self
            .transport
            .call(RpcMethod::GetBlockHash, vec![json!(height)])
            .await?;
        let s = v
            .as_str()
            .ok_or_else(|| FetchError::Decode(format!("getblockhash returned {v}")))?;
        BlockHash::from_str(s).map_err(|e| FetchError::Decode(format!("block hash `{s}`: {e}")))
    }

    async fn header_once(&self, hash: BlockHash) -> Result<HeaderRecord, FetchError> {
        let v = self
            .transport
            .call(RpcMethod::GetBlockHeader, vec![json!(hash.to_string()), json!(true)])
            .await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn stats_once(&self, key: Value) -> Result<StatsRecord, FetchError> {
        let v = self.transport.call(RpcMethod::GetBlockStats, vec![key]).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// A single attempt; the header-by-height path issues two sequential calls
    /// and is retried as one unit.
    async fn fetch_once(&self, kind: DatasetKind, key: FetchKey) -> Result<DatasetRecord, FetchError> {
        match (kind, key) {
            (DatasetKind::Hashes, FetchKey::Height(height)) => {
                let hash = self.block_hash_once(height).await?;
                Ok(HashRecord { height, hash }.into())
            }
            (DatasetKind::Headers, FetchKey::Hash(hash)) => Ok(self.header_once(hash).await?.into()),
            (DatasetKind::Headers, FetchKey::Height(height)) => {
                let hash = self.block_hash_once(height).await?;
                Ok(self.header_once(hash).await?.into())
            }
            (DatasetKind::Stats, FetchKey::Height(height)) => {
                Ok(self.stats_once(json!(height)).await?.into())
            }
            (DatasetKind::Stats, FetchKey::Hash(hash)) => {
                Ok(self.stats_once(json!(hash.to_string())).await?.into())
            }
            (DatasetKind::Hashes, FetchKey::Hash(_)) => Err(FetchError::Unsupported(
                "hash records are addressed by height".into(),
            )),
        }
    }
}

#[async_trait]
impl<T: RpcTransport> RecordSource for FetchClient<T> {
    async fn chain_tip(&self) -> Result<HeightRange, FetchError> {
        let fetched = self
            .policy
            .run(&self.cancel, "getblockcount", || async {
                let v = self.transport.call(RpcMethod::GetBlockCount, vec![]).await?;
                v.as_i64()
                    .ok_or_else(|| FetchError::Decode(format!("getblockcount returned {v}")))
            })
            .await?;
        HeightRange::from_sentinel(fetched.value)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn fetch(
        &self,
        kind: DatasetKind,
        key: FetchKey,
    ) -> Result<Fetched<DatasetRecord>, FetchError> {
        let what = format!("{} {key}", kind.method());
        self.policy
            .run(&self.cancel, &what, || self.fetch_once(kind, key))
            .await
    }
}
