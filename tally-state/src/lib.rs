//! tally-state: store backends
//! Provides in-memory implementations of every consumed interface and an
//! optional RocksDB checkpoint/summary store (`--features rocksdb`).

pub mod mem;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use mem::{InMemoryChangeFeed, InMemoryCheckpointStore, InMemorySummarySink};
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

use tally_core::Summary;

/// Newest first, ties by id so listings are stable.
pub(crate) fn sort_newest_first(summaries: &mut [Summary]) {
    summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
}
