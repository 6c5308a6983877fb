use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tally_core::Error;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// Resolving the checkpoint; nothing has been read yet.
    Starting,
    Running,
    /// Caught up; waiting for the poll interval.
    Idle,
    /// A cycle failed after retries; waiting before re-fetching the same batch.
    Backoff,
    /// Stopped after too many consecutive failures.
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PartitionHealth {
    pub state: PartitionState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub batches_committed: u64,
    pub readings_processed: u64,
    pub last_continuation: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for PartitionHealth {
    fn default() -> Self {
        Self {
            state: PartitionState::Starting,
            last_error: None,
            consecutive_failures: 0,
            batches_committed: 0,
            readings_processed: 0,
            last_continuation: None,
            updated_at: Utc::now(),
        }
    }
}

/// Per-partition health shared between the workers and whoever observes them.
#[derive(Clone, Default)]
pub struct HealthRegistry(Arc<RwLock<BTreeMap<String, PartitionHealth>>>);

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PartitionHealth> {
        self.0.read().clone()
    }

    pub fn get(&self, partition_key: &str) -> Option<PartitionHealth> {
        self.0.read().get(partition_key).cloned()
    }

    /// True when no partition is `Failed` or `Backoff`.
    pub fn is_healthy(&self) -> bool {
        self.0
            .read()
            .values()
            .all(|h| !matches!(h.state, PartitionState::Failed | PartitionState::Backoff))
    }

    fn update<F: FnOnce(&mut PartitionHealth)>(&self, partition_key: &str, f: F) {
        let mut guard = self.0.write();
        let entry = guard.entry(partition_key.to_string()).or_default();
        f(entry);
        entry.updated_at = Utc::now();
    }

    pub(crate) fn set_state(&self, partition_key: &str, state: PartitionState) {
        self.update(partition_key, |h| h.state = state);
    }

    /// Returns the number of consecutive failures including this one.
    pub(crate) fn record_failure(&self, partition_key: &str, error: &Error) -> u32 {
        let mut failures = 0;
        self.update(partition_key, |h| {
            h.state = PartitionState::Backoff;
            h.last_error = Some(error.to_string());
            h.consecutive_failures += 1;
            failures = h.consecutive_failures;
        });
        failures
    }

    pub(crate) fn record_commit(&self, partition_key: &str, continuation: &str, readings: usize) {
        self.update(partition_key, |h| {
            h.state = PartitionState::Running;
            h.consecutive_failures = 0;
            h.batches_committed += 1;
            h.readings_processed += readings as u64;
            h.last_continuation = Some(continuation.to_string());
        });
    }

    /// A cycle went through without error, even if nothing was committed.
    pub(crate) fn record_success(&self, partition_key: &str, state: PartitionState) {
        self.update(partition_key, |h| {
            h.state = state;
            h.consecutive_failures = 0;
        });
    }
}
