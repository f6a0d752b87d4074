//! Backfill orchestrator:
//! 1) resolve each dataset's tip and audit it for missing heights,
//! 2) fetch missing records in ascending height order (hash before header),
//! 3) upsert them idempotently and emit one progress event per write.
use futures::{future, stream, StreamExt};
use serde::Deserialize;
use std::pin::pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    auditor::{AuditStrategy, GapAuditor},
    dataset::{DatasetKind, DatasetRecord, HashRecord, Height, HeightRange},
    error::{BackfillError, FetchError, StoreError},
    fetch_client::{FetchKey, RecordSource},
    progress::{Outcome, ProgressEvent},
    retry::Fetched,
    store::{RecordStore, UpsertOutcome},
};

/// Where a dataset's audit range ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TipSource {
    /// Catch up to the live chain (`getblockcount`).
    Chain,
    /// Catch up to another local dataset's highest stored height.
    Dataset(DatasetKind),
    /// A caller-supplied range.
    Fixed(HeightRange),
}

/// How header records get their block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderStrategy {
    /// Look the hash up in the hash dataset, fetching and storing it when absent.
    #[default]
    StoredHash,
    /// `getblockhash` then `getblockheader` upstream; the hash dataset is not touched.
    ByHeight,
}

/// One dataset to backfill and the tip it should reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetPlan {
    /// Dataset to drain.
    pub kind: DatasetKind,
    /// Where the audited range ends.
    pub tip: TipSource,
}

impl DatasetPlan {
    /// Backfill `kind` up to the chain tip.
    pub fn to_chain_tip(kind: DatasetKind) -> Self {
        Self {
            kind,
            tip: TipSource::Chain,
        }
    }

    /// Backfill `kind` up to whatever `leader` already holds.
    pub fn following(kind: DatasetKind, leader: DatasetKind) -> Self {
        Self {
            kind,
            tip: TipSource::Dataset(leader),
        }
    }

    /// Backfill `kind` over a fixed range.
    pub fn fixed(kind: DatasetKind, range: HeightRange) -> Self {
        Self {
            kind,
            tip: TipSource::Fixed(range),
        }
    }
}

/// Per-dataset lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DrainState {
    /// Not started.
    #[default]
    Idle,
    /// Resolving the tip and the missing set.
    Auditing,
    /// Fetching and storing missing heights.
    Draining,
    /// Finished, possibly early.
    Done,
}

/// What one dataset's drain did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetReport {
    /// Dataset drained.
    pub kind: DatasetKind,
    /// Last state reached.
    pub state: DrainState,
    /// Audited range.
    pub range: HeightRange,
    /// Heights the audit reported missing.
    pub missing: u64,
    /// Records written.
    pub stored: u64,
    /// Fetched but another writer stored them first.
    pub already_present: u64,
    /// Heights left missing after a non-fatal failure.
    pub skipped: u64,
    /// Hash records written while resolving header dependencies.
    pub dependencies_stored: u64,
    /// The drain stopped early because of cancellation.
    pub cancelled: bool,
}

impl DatasetReport {
    fn new(kind: DatasetKind) -> Self {
        Self {
            kind,
            state: DrainState::Idle,
            range: HeightRange::EMPTY,
            missing: 0,
            stored: 0,
            already_present: 0,
            skipped: 0,
            dependencies_stored: 0,
            cancelled: false,
        }
    }

    /// Heights that reached a final outcome.
    pub fn processed(&self) -> u64 {
        self.stored + self.already_present + self.skipped
    }
}

/// Reports for every dataset the run reached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// In plan order.
    pub datasets: Vec<DatasetReport>,
}

impl RunSummary {
    /// Whether the run was interrupted.
    pub fn cancelled(&self) -> bool {
        self.datasets.iter().any(|d| d.cancelled)
    }

    /// Report for `kind`, if the run reached it.
    pub fn get(&self, kind: DatasetKind) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.kind == kind)
    }
}

/// A fetched record plus the hash record resolved on its behalf, if any.
struct Resolved {
    dependency: Option<Fetched<HashRecord>>,
    record: Fetched<DatasetRecord>,
}

enum HeightFailure {
    /// Leave the height missing and keep draining.
    Skip(String),
    Cancelled,
    Store(StoreError),
    Contract(String),
}

impl From<StoreError> for HeightFailure {
    fn from(e: StoreError) -> Self {
        HeightFailure::Store(e)
    }
}

impl From<FetchError> for HeightFailure {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Cancelled => HeightFailure::Cancelled,
            FetchError::Unsupported(msg) => HeightFailure::Contract(msg),
            other => HeightFailure::Skip(other.to_string()),
        }
    }
}

/// Core engine. `S` = record store, `F` = record source (usually a [`FetchClient`](crate::FetchClient)).
pub struct Backfill<S, F> {
    store: S,
    source: F,
    auditor: GapAuditor,
    header_strategy: HeaderStrategy,
    concurrency: usize,
    progress: Option<mpsc::Sender<ProgressEvent>>,
    cancel: CancellationToken,
}

impl<S, F> Backfill<S, F>
where
    S: RecordStore,
    F: RecordSource,
{
    /// Sequential engine with bulk auditing and stored-hash header resolution.
    pub fn new(store: S, source: F) -> Self {
        Self {
            store,
            source,
            auditor: GapAuditor::default(),
            header_strategy: HeaderStrategy::default(),
            concurrency: 1,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Choose how missing heights are computed.
    pub fn with_audit_strategy(mut self, strategy: AuditStrategy) -> Self {
        self.auditor = GapAuditor::new(strategy);
        self
    }

    /// Choose how header hashes are resolved.
    pub fn with_header_strategy(mut self, strategy: HeaderStrategy) -> Self {
        self.header_strategy = strategy;
        self
    }

    /// Fetch up to `n` heights at once. Upserts stay in ascending order.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Emit a [`ProgressEvent`] per write into `tx`. Hash records stored on a
    /// header's behalf get their own event under [`DatasetKind::Hashes`].
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Stop dispatching fetches once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The record store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The record source.
    pub fn source(&self) -> &F {
        &self.source
    }

    /// Backfill each plan in order.
    ///
    /// # Errors
    /// Stops at the first fatal condition: a store failure, a contract
    /// violation, or a chain tip that cannot be obtained.
    pub async fn run(&self, plans: &[DatasetPlan]) -> Result<RunSummary, BackfillError> {
        let mut summary = RunSummary::default();
        for plan in plans {
            let report = self.backfill(*plan).await?;
            let cancelled = report.cancelled;
            summary.datasets.push(report);
            if cancelled {
                warn!(dataset = %plan.kind, "run cancelled, remaining datasets not started");
                break;
            }
        }
        Ok(summary)
    }

    /// Audit and drain one dataset.
    pub async fn backfill(&self, plan: DatasetPlan) -> Result<DatasetReport, BackfillError> {
        let kind = plan.kind;
        let mut report = DatasetReport::new(kind);

        report.state = DrainState::Auditing;
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            report.state = DrainState::Done;
            return Ok(report);
        }
        report.range = self.resolve_tip(plan.tip).await?;
        let missing = self
            .auditor
            .audit(&self.store, kind, report.range)
            .await?;
        report.missing = missing.heights.len() as u64;

        if missing.is_complete() {
            report.state = DrainState::Done;
            info!(dataset = %kind, tip = report.range.sentinel(), "nothing to backfill");
            return Ok(report);
        }

        report.state = DrainState::Draining;
        let cancel = &self.cancel;
        // `buffered` yields in dispatch order, so upserts stay ascending
        let mut resolved = pin!(stream::iter(missing.heights)
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|height| async move { (height, self.resolve(kind, height).await) })
            .buffered(self.concurrency));

        while let Some((height, resolution)) = resolved.next().await {
            match resolution {
                Ok(r) => self.apply(kind, height, r, &mut report).await?,
                Err(HeightFailure::Skip(reason)) => {
                    warn!(dataset = %kind, height, %reason, "height skipped");
                    report.skipped += 1;
                    self.emit(kind, height, Outcome::Skipped { reason }).await;
                }
                Err(HeightFailure::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(HeightFailure::Store(e)) => {
                    error!(dataset = %kind, height, error = %e, "store failure, aborting drain");
                    return Err(e.into());
                }
                Err(HeightFailure::Contract(msg)) => return Err(BackfillError::Contract(msg)),
            }
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
        }

        report.state = DrainState::Done;
        info!(
            dataset = %kind,
            processed = report.processed(),
            stored = report.stored,
            already_present = report.already_present,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "dataset drained"
        );
        Ok(report)
    }

    async fn resolve_tip(&self, tip: TipSource) -> Result<HeightRange, BackfillError> {
        match tip {
            TipSource::Chain => self.source.chain_tip().await.map_err(|e| match e {
                FetchError::Cancelled => BackfillError::Cancelled,
                other => BackfillError::Tip(other),
            }),
            TipSource::Dataset(leader) => {
                Ok(HeightRange::up_to(self.store.max_height(leader).await?))
            }
            TipSource::Fixed(range) => Ok(range),
        }
    }

    /// Fetch the record at `height`, resolving its dependency first.
    async fn resolve(&self, kind: DatasetKind, height: Height) -> Result<Resolved, HeightFailure> {
        let (dependency, record) = match (kind, self.header_strategy) {
            (DatasetKind::Headers, HeaderStrategy::StoredHash) => {
                let (dependency, hash) = match self.store.block_hash(height).await? {
                    Some(hash) => (None, hash),
                    None => {
                        let fetched = self
                            .source
                            .fetch(DatasetKind::Hashes, FetchKey::Height(height))
                            .await?;
                        let attempts = fetched.attempts;
                        let DatasetRecord::Hash(value) = fetched.value else {
                            return Err(HeightFailure::Skip(
                                "hash fetch returned another dataset".into(),
                            ));
                        };
                        if value.height != height {
                            return Err(HeightFailure::Skip(format!(
                                "hash record reports height {}",
                                value.height
                            )));
                        }
                        let hash = value.hash;
                        debug!(height, %hash, "hash resolved upstream for header");
                        (Some(Fetched { value, attempts }), hash)
                    }
                };
                let record = self
                    .source
                    .fetch(DatasetKind::Headers, FetchKey::Hash(hash))
                    .await?;
                if record.value.block_hash() != hash {
                    return Err(HeightFailure::Skip(format!(
                        "header hash {} disagrees with resolved hash {hash}",
                        record.value.block_hash()
                    )));
                }
                (dependency, record)
            }
            _ => {
                let record = self.source.fetch(kind, FetchKey::Height(height)).await?;
                (None, record)
            }
        };

        if record.value.kind() != kind {
            return Err(HeightFailure::Skip(format!(
                "expected a {kind} record, got {}",
                record.value.kind()
            )));
        }
        if record.value.height() != height {
            return Err(HeightFailure::Skip(format!(
                "record reports height {}",
                record.value.height()
            )));
        }
        Ok(Resolved { dependency, record })
    }

    async fn apply(
        &self,
        kind: DatasetKind,
        height: Height,
        resolved: Resolved,
        report: &mut DatasetReport,
    ) -> Result<(), BackfillError> {
        if let Some(dep) = resolved.dependency {
            let attempts = dep.attempts;
            let outcome = match self.store.upsert(&DatasetRecord::Hash(dep.value)).await? {
                UpsertOutcome::Stored => {
                    report.dependencies_stored += 1;
                    debug!(height, attempts, "hash stored for header");
                    Outcome::Stored { attempts }
                }
                UpsertOutcome::NoOp => Outcome::AlreadyPresent { attempts },
            };
            self.emit(DatasetKind::Hashes, height, outcome).await;
        }

        let attempts = resolved.record.attempts;
        let outcome = match self.store.upsert(&resolved.record.value).await? {
            UpsertOutcome::Stored => {
                report.stored += 1;
                info!(dataset = %kind, height, attempts, "record stored");
                Outcome::Stored { attempts }
            }
            UpsertOutcome::NoOp => {
                report.already_present += 1;
                debug!(dataset = %kind, height, "record already present");
                Outcome::AlreadyPresent { attempts }
            }
        };
        self.emit(kind, height, outcome).await;
        Ok(())
    }

    async fn emit(&self, dataset: DatasetKind, height: Height, outcome: Outcome) {
        if let Some(tx) = &self.progress {
            // a dropped reporter must not fail the run
            let _ = tx
                .send(ProgressEvent {
                    dataset,
                    height,
                    outcome,
                })
                .await;
        }
    }
}
