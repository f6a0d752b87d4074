#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! chain-backfill: gap detection and idempotent backfill for height-indexed block data.
//!
//! ## What you provide
//! - A [`RecordStore`]: point lookups, idempotent upserts and a max-height query per
//!   dataset. [`SqliteStore`] is included.
//! - A [`RecordSource`]: usually a [`FetchClient`] over an [`RpcTransport`] such as
//!   [`HttpTransport`], talking Bitcoin Core style JSON-RPC.
//!
//! ## What the engine does
//! - Resolves each dataset's tip (live chain, another local dataset, or fixed).
//! - Audits the store for **every** missing height in `[0, tip]`, not just the tail.
//! - Fetches missing records in ascending order, resolving the block hash before a
//!   header, retrying transient upstream failures under a [`RetryPolicy`].
//! - Writes each record once (first writer wins), so re-running is always safe.
//!
//! ## Minimal usage
//! ```rust,no_run
//! use chain_backfill::prelude::*;
//! use std::time::Duration;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let transport = HttpTransport::new("http://127.0.0.1:8332", None, Duration::from_secs(30))?;
//!     let client = FetchClient::new(transport).with_retry_policy(RetryPolicy::default());
//!     let store = SqliteStore::new("./blocks.sqlite")?;
//!
//!     let engine = Backfill::new(store, client);
//!     let plans: Vec<_> = DatasetKind::ALL
//!         .into_iter()
//!         .map(DatasetPlan::to_chain_tip)
//!         .collect();
//!     let summary = engine.run(&plans).await?;
//!     for report in &summary.datasets {
//!         println!("{}: {} stored, {} skipped", report.kind, report.stored, report.skipped);
//!     }
//!     Ok(())
//! }
//! ```
/// Dataset kinds, records and height ranges.
pub mod dataset;

/// Error taxonomy (transient vs fatal).
pub mod error;

/// Retry policy and the retry loop.
pub mod retry;

/// JSON-RPC transport.
pub mod rpc;

/// Resilient fetch client.
pub mod fetch_client;

/// Persistence layer (traits and SQLite implementation).
pub mod store;

/// Missing-height computation.
pub mod auditor;

/// Orchestrator that drains missing heights into the store.
pub mod engine;

/// Progress events and reporter.
pub mod progress;

/// Environment configuration and logger setup.
pub mod config;

// Public re-exports
pub use auditor::{AuditStrategy, GapAuditor, MissingSet};
pub use dataset::{
    DatasetKind, DatasetRecord, HashRecord, HeaderRecord, Height, HeightRange, RpcMethod,
    StatsRecord,
};
pub use engine::{
    Backfill, DatasetPlan, DatasetReport, DrainState, HeaderStrategy, RunSummary, TipSource,
};
pub use error::{BackfillError, FailureKind, FetchError, StoreError};
pub use fetch_client::{FetchClient, FetchKey, RecordSource};
pub use progress::{Outcome, ProgressEvent, ProgressReporter};
pub use retry::{Backoff, Fetched, RetryPolicy};
pub use rpc::{HttpTransport, RpcTransport};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::{RecordStore, UpsertOutcome};

/// Convenience prelude for end users.
pub mod prelude {
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
    pub use crate::{
        Backfill, DatasetKind, DatasetPlan, FetchClient, HttpTransport, RecordSource,
        RecordStore, RetryPolicy,
    };
}
