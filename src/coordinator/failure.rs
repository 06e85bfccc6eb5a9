use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::protocol::{FailureOperation, FailureType, SimulatorAddress, TestId};

/// Decides whether a newly recorded failure stops the run.
pub trait AbortPolicy: Send + Sync {
    fn should_abort(&self, failure: &FailureOperation) -> bool;
}

/// Aborts on the first failure that counts against the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

impl AbortPolicy for FailFast {
    fn should_abort(&self, failure: &FailureOperation) -> bool {
        failure.failure_type.is_poison()
    }
}

/// Records failures but never aborts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl AbortPolicy for Never {
    fn should_abort(&self, _failure: &FailureOperation) -> bool {
        false
    }
}

impl<F> AbortPolicy for F
where
    F: Fn(&FailureOperation) -> bool + Send + Sync,
{
    fn should_abort(&self, failure: &FailureOperation) -> bool {
        self(failure)
    }
}

/// Configured abort behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AbortMode {
    #[default]
    FailFast,
    Never,
}

impl AbortMode {
    #[must_use]
    pub fn policy(self) -> Arc<dyn AbortPolicy> {
        match self {
            AbortMode::FailFast => Arc::new(FailFast),
            AbortMode::Never => Arc::new(Never),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FailureKey {
    source: SimulatorAddress,
    failure_type: FailureType,
    message: String,
}

impl FailureKey {
    fn of(failure: &FailureOperation) -> Self {
        Self {
            source: failure.worker_address,
            failure_type: failure.failure_type,
            message: failure.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    /// Arrival order of the first occurrence.
    pub sequence: u64,
    pub failure: FailureOperation,
    pub occurrences: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAdded {
    New,
    Duplicate { occurrences: u64 },
}

/// Append-only failure registry deduplicated on `(source, type, message)`.
pub struct FailureContainer {
    records: DashMap<FailureKey, FailureRecord>,
    next_sequence: AtomicU64,
    policy: Arc<dyn AbortPolicy>,
    abort_requested: AtomicBool,
    abort_tx: watch::Sender<bool>,
}

impl FailureContainer {
    #[must_use]
    pub fn new(policy: Arc<dyn AbortPolicy>) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            records: DashMap::new(),
            next_sequence: AtomicU64::new(0),
            policy,
            abort_requested: AtomicBool::new(false),
            abort_tx,
        }
    }

    /// Records a failure, counting repeats instead of storing them.
    ///
    /// The abort policy only sees failures that were not stored before.
    pub fn add_failure(&self, failure: FailureOperation) -> FailureAdded {
        let added = match self.records.entry(FailureKey::of(&failure)) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.occurrences = record.occurrences.saturating_add(1);
                FailureAdded::Duplicate {
                    occurrences: record.occurrences,
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(FailureRecord {
                    sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                    failure: failure.clone(),
                    occurrences: 1,
                });
                FailureAdded::New
            }
        };

        match added {
            FailureAdded::New => {
                error!(
                    "Failure {} from {}{}: {}",
                    failure.failure_type,
                    failure.worker_address,
                    failure
                        .test_id
                        .as_ref()
                        .map(|test_id| format!(" in test {}", test_id))
                        .unwrap_or_default(),
                    failure.message
                );
                if self.policy.should_abort(&failure) {
                    self.request_abort();
                }
            }
            FailureAdded::Duplicate { occurrences } => {
                debug!(
                    "Duplicate failure {} from {} (seen {} times)",
                    failure.failure_type, failure.worker_address, occurrences
                );
            }
        }
        added
    }

    /// Raises the abort signal; later calls are no-ops.
    pub fn request_abort(&self) {
        if !self.abort_requested.swap(true, Ordering::SeqCst) {
            warn!("Abort requested by failure policy");
            self.abort_tx.send_replace(true);
        }
    }

    #[must_use]
    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Watch channel that flips to `true` once the run should stop.
    #[must_use]
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    /// Number of distinct failures.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn total_occurrences(&self) -> u64 {
        self.records
            .iter()
            .fold(0_u64, |total, record| total.saturating_add(record.occurrences))
    }

    /// Snapshot of every distinct failure in arrival order.
    #[must_use]
    pub fn list(&self) -> Vec<FailureRecord> {
        let mut records: Vec<FailureRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    #[must_use]
    pub fn failures_for_test(&self, test_id: &TestId) -> Vec<FailureRecord> {
        self.list()
            .into_iter()
            .filter(|record| record.failure.test_id.as_ref() == Some(test_id))
            .collect()
    }
}

impl Default for FailureContainer {
    fn default() -> Self {
        Self::new(Arc::new(FailFast))
    }
}
