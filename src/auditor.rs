//! Gap auditor: which heights of `[0, tip]` does a dataset lack?
use serde::Deserialize;
use tracing::info;

use crate::{
    dataset::{DatasetKind, Height, HeightRange},
    error::StoreError,
    store::{probe_missing, RecordStore},
};

/// How the missing set is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStrategy {
    /// One set-difference query against the store. Correct for any gap pattern.
    #[default]
    Bulk,
    /// One point lookup per height. Correct, but a round trip per height.
    Probe,
    /// `max_height + 1 ..= tip` only. Assumes the store is contiguous below its
    /// maximum, so interior gaps are never reported.
    TailScan,
}

/// Heights a dataset is missing within a range. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingSet {
    /// Audited dataset.
    pub kind: DatasetKind,
    /// Audited range.
    pub range: HeightRange,
    /// Missing heights, ascending and unique.
    pub heights: Vec<Height>,
}

impl MissingSet {
    /// Nothing to backfill.
    pub fn is_complete(&self) -> bool {
        self.heights.is_empty()
    }
}

/// Computes [`MissingSet`]s with a configurable [`AuditStrategy`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GapAuditor {
    strategy: AuditStrategy,
}

impl GapAuditor {
    /// Auditor using `strategy`.
    pub fn new(strategy: AuditStrategy) -> Self {
        Self { strategy }
    }

    /// Configured strategy.
    pub fn strategy(&self) -> AuditStrategy {
        self.strategy
    }

    /// `range \ stored(kind)` in ascending order.
    pub async fn missing_heights<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        kind: DatasetKind,
        range: HeightRange,
    ) -> Result<Vec<Height>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let mut heights = match self.strategy {
            AuditStrategy::Bulk => store.missing_heights(kind, range).await?,
            AuditStrategy::Probe => probe_missing(store, kind, range).await?,
            AuditStrategy::TailScan => {
                let max = store.max_height(kind).await?;
                range.above(max).collect()
            }
        };
        // stores are not trusted to sort, dedup or clip
        heights.retain(|h| range.contains(*h));
        heights.sort_unstable();
        heights.dedup();
        Ok(heights)
    }

    /// Audit one dataset.
    pub async fn audit<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        kind: DatasetKind,
        range: HeightRange,
    ) -> Result<MissingSet, StoreError> {
        let heights = self.missing_heights(store, kind, range).await?;
        info!(
            dataset = %kind,
            tip = range.sentinel(),
            missing = heights.len(),
            strategy = ?self.strategy,
            "audit complete"
        );
        Ok(MissingSet {
            kind,
            range,
            heights,
        })
    }

    /// Audit several datasets against the same range.
    pub async fn audit_all<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        kinds: &[DatasetKind],
        range: HeightRange,
    ) -> Result<Vec<MissingSet>, StoreError> {
        let mut sets = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            sets.push(self.audit(store, kind, range).await?);
        }
        Ok(sets)
    }
}
