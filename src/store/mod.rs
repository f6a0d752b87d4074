//! Record store interface and implementations.
//!
//! Every dataset is keyed by height. Writes are idempotent: the first record
//! written at a height wins and later writes are no-ops.
use async_trait::async_trait;
use bitcoin::BlockHash;
use std::sync::Arc;

use crate::{
    dataset::{DatasetKind, DatasetRecord, Height, HeightRange},
    error::StoreError,
};

/// Result of an [`RecordStore::upsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was written.
    Stored,
    /// A record already existed at that height and was left untouched.
    NoOp,
}

/// Height-indexed persistence for the three datasets. All errors are fatal.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Highest stored height, `None` when the dataset is empty.
    async fn max_height(&self, kind: DatasetKind) -> Result<Option<Height>, StoreError>;

    /// Whether a record exists at `height`.
    async fn exists(&self, kind: DatasetKind, height: Height) -> Result<bool, StoreError>;

    /// Stored block hash at `height`, if the hash dataset has it.
    async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, StoreError>;

    /// Insert unless a record already exists at the same height.
    async fn upsert(&self, record: &DatasetRecord) -> Result<UpsertOutcome, StoreError>;

    /// Number of stored records.
    async fn count(&self, kind: DatasetKind) -> Result<u64, StoreError>;

    /// Heights of `range` with no stored record, ascending.
    ///
    /// The default probes every height with [`exists`](RecordStore::exists);
    /// stores with a set-difference query should override it.
    async fn missing_heights(
        &self,
        kind: DatasetKind,
        range: HeightRange,
    ) -> Result<Vec<Height>, StoreError> {
        probe_missing(self, kind, range).await
    }
}

/// Point-lookup every height in `range`.
pub async fn probe_missing<S: RecordStore + ?Sized>(
    store: &S,
    kind: DatasetKind,
    range: HeightRange,
) -> Result<Vec<Height>, StoreError> {
    let mut missing = Vec::new();
    for h in range.iter() {
        if !store.exists(kind, h).await? {
            missing.push(h);
        }
    }
    Ok(missing)
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn max_height(&self, kind: DatasetKind) -> Result<Option<Height>, StoreError> {
        (**self).max_height(kind).await
    }
    async fn exists(&self, kind: DatasetKind, height: Height) -> Result<bool, StoreError> {
        (**self).exists(kind, height).await
    }
    async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, StoreError> {
        (**self).block_hash(height).await
    }
    async fn upsert(&self, record: &DatasetRecord) -> Result<UpsertOutcome, StoreError> {
        (**self).upsert(record).await
    }
    async fn count(&self, kind: DatasetKind) -> Result<u64, StoreError> {
        (**self).count(kind).await
    }
    async fn missing_heights(
        &self,
        kind: DatasetKind,
        range: HeightRange,
    ) -> Result<Vec<Height>, StoreError> {
        (**self).missing_heights(kind, range).await
    }
}

// submodules / concrete stores live here
/// SQLite-backed [`RecordStore`].
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
