//! Progress events emitted while draining, and a terminal reporter for them.
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::dataset::{DatasetKind, Height};

/// What happened to one height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Fetched and written.
    Stored {
        /// Fetch attempts, 1 when nothing was retried.
        attempts: u32,
    },
    /// Fetched, but another writer got there first.
    AlreadyPresent {
        /// Fetch attempts, 1 when nothing was retried.
        attempts: u32,
    },
    /// Left missing for the next run.
    Skipped {
        /// Why the height was not written.
        reason: String,
    },
}

/// `(dataset, height, outcome)` as produced by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Dataset written (or skipped).
    pub dataset: DatasetKind,
    /// Height the event is about.
    pub height: Height,
    /// What happened.
    pub outcome: Outcome,
}

/// Bounded progress channel; the engine only waits when `buffer` events are pending.
pub fn channel(buffer: usize) -> (mpsc::Sender<ProgressEvent>, mpsc::Receiver<ProgressEvent>) {
    mpsc::channel(buffer.max(1))
}

/// Per-dataset totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    /// Heights written.
    pub stored: u64,
    /// Heights another writer got to first.
    pub already_present: u64,
    /// Heights left missing.
    pub skipped: u64,
    /// Failed attempts summed over every successful height.
    pub retries: u64,
}

/// Drains progress events into one progress bar per dataset.
pub struct ProgressReporter {
    bars: MultiProgress,
    per_dataset: BTreeMap<DatasetKind, (ProgressBar, Tally)>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// Reporter drawing to stderr.
    pub fn new() -> Self {
        Self {
            bars: MultiProgress::new(),
            per_dataset: BTreeMap::new(),
        }
    }

    /// Reporter that draws nothing, only tallies.
    pub fn hidden() -> Self {
        Self {
            bars: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            per_dataset: BTreeMap::new(),
        }
    }

    /// Consume events until every sender is dropped, then return the totals.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ProgressEvent>,
    ) -> BTreeMap<DatasetKind, Tally> {
        while let Some(event) = events.recv().await {
            self.record(&event);
        }
        self.per_dataset
            .into_iter()
            .map(|(kind, (bar, tally))| {
                bar.finish();
                (kind, tally)
            })
            .collect()
    }

    fn record(&mut self, event: &ProgressEvent) {
        let bars = &self.bars;
        let (bar, tally) = self.per_dataset.entry(event.dataset).or_insert_with(|| {
            let bar = bars.add(ProgressBar::new_spinner());
            bar.set_style(
                ProgressStyle::with_template("{prefix:>8} {spinner} {pos} heights {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_prefix(event.dataset.to_string());
            (bar, Tally::default())
        });
        match &event.outcome {
            Outcome::Stored { attempts } => {
                tally.stored += 1;
                tally.retries += u64::from(attempts.saturating_sub(1));
            }
            Outcome::AlreadyPresent { attempts } => {
                tally.already_present += 1;
                tally.retries += u64::from(attempts.saturating_sub(1));
            }
            Outcome::Skipped { .. } => tally.skipped += 1,
        }
        bar.inc(1);
        bar.set_message(format!("(last {}, {} skipped)", event.height, tally.skipped));
    }
}
