use chrono::{DateTime, Utc};
use tally_core::{Reading, Summary, SummaryIdentity};
use tracing::debug;

use crate::Stats;

#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub reading: Reading,
    /// Arrival order within the window's lifetime; breaks timestamp ties.
    seq: u64,
}

impl WindowEntry {
    pub fn arrival(&self) -> u64 {
        self.seq
    }
}

/// The N most recent readings of one partition.
///
/// Entries are ordered newest first: by timestamp descending, and for equal
/// timestamps by arrival descending, so the entry evicted on overflow is
/// always the oldest timestamp and, among those, the earliest arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowState {
    partition_key: String,
    capacity: usize,
    entries: Vec<WindowEntry>,
    next_seq: u64,
}

impl WindowState {
    fn new(partition_key: String, capacity: usize) -> Self {
        Self {
            partition_key,
            capacity,
            entries: Vec::with_capacity(capacity + 1),
            next_seq: 0,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WindowEntry] {
        &self.entries
    }

    /// Readings newest first.
    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter().map(|e| &e.reading)
    }

    /// Usable numeric values, newest first.
    pub fn valid_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.readings().filter_map(Reading::numeric_value)
    }

    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.reading.timestamp)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.reading.id == id)
    }
}

/// Per-partition sliding window and its statistics.
///
/// Example
/// ```no_run
/// use tally_core::{Reading, SummaryIdentity};
/// use tally_ops::WindowAggregator;
/// let mut agg = WindowAggregator::new("sensor-1", 10, SummaryIdentity::Latest);
/// agg.ingest(Reading::new("r1", "sensor-1", 21.5, chrono::Utc::now()));
/// let summary = agg.compute();
/// # let _ = summary;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAggregator {
    state: WindowState,
    identity: SummaryIdentity,
}

impl WindowAggregator {
    /// `capacity` is clamped to at least one entry.
    pub fn new(partition_key: impl Into<String>, capacity: usize, identity: SummaryIdentity) -> Self {
        Self {
            state: WindowState::new(partition_key.into(), capacity.max(1)),
            identity,
        }
    }

    pub fn state(&self) -> &WindowState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Admit a reading, evicting the oldest entry if the window overflows.
    ///
    /// Redeliveries (an id already held) and readings of another partition
    /// leave the window unchanged. A reading older than everything in a full
    /// window is admitted and immediately evicted.
    pub fn ingest(&mut self, reading: Reading) -> &WindowState {
        let state = &mut self.state;
        if reading.partition_key != state.partition_key {
            debug!(expected = %state.partition_key, got = %reading.partition_key, "reading routed to wrong window");
            return state;
        }
        if state.contains(&reading.id) {
            return state;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let pos = state
            .entries
            .partition_point(|e| e.reading.timestamp > reading.timestamp);
        state.entries.insert(pos, WindowEntry { reading, seq });
        if state.entries.len() > state.capacity {
            state.entries.pop();
        }
        state
    }

    /// Statistics over the valid values currently held, `None` if there are none.
    pub fn compute(&self) -> Option<Summary> {
        let stats = Stats::from_values(self.state.valid_values())?;
        let newest = self.state.newest_timestamp()?;
        Some(Summary {
            id: self.identity.summary_id(&self.state.partition_key, newest),
            partition_key: self.state.partition_key.clone(),
            timestamp: newest,
            max: stats.max,
            min: stats.min,
            avg: stats.avg,
            count: stats.count,
        })
    }
}
