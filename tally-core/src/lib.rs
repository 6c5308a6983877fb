//! tally-core: Fundamental types and traits for the change-feed summariser.
//!
//! Goal: provide the abstractions every other crate in the workspace builds on:
//! - `Reading`, `Summary`, `Checkpoint`, `Cursor`
//! - Traits: `ChangeSource`, `CheckpointStore`, `SummarySink`
//! - Shared error type, retry policy, configuration and metrics
//!
//! Quick example:
//! ```no_run
//! use tally_core::{ChangeBatch, ChangeSource, Cursor, Result};
//! struct Empty;
//! #[async_trait::async_trait]
//! impl ChangeSource for Empty {
//!     async fn partitions(&self) -> Result<Vec<String>> { Ok(vec!["sensor-1".into()]) }
//!     async fn read_batch(&self, _pk: &str, _cursor: &Cursor, _max: usize) -> Result<ChangeBatch> {
//!         Ok(ChangeBatch { items: vec![], continuation: "0".into(), has_more: false })
//!     }
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod record;
pub mod retry;

pub use checkpoint::{ChangeBatch, Checkpoint, Cursor, StartPosition};
pub use record::{parse_timestamp, FieldMap, Reading, Summary, SummaryIdentity};
pub use retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("change source: {message}")]
    Source { message: String, transient: bool },
    #[error("summary sink: {message}")]
    Sink { message: String, transient: bool },
    #[error("checkpoint store: {message}")]
    Checkpoint { message: String, transient: bool },
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Error::Source { message: message.into(), transient: true }
    }

    pub fn sink_unavailable(message: impl Into<String>) -> Self {
        Error::Sink { message: message.into(), transient: true }
    }

    pub fn checkpoint_unavailable(message: impl Into<String>) -> Self {
        Error::Checkpoint { message: message.into(), transient: true }
    }

    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Source { transient, .. }
            | Error::Sink { transient, .. }
            | Error::Checkpoint { transient, .. } => *transient,
            Error::Io(_) | Error::Anyhow(_) => true,
            Error::Config(_) | Error::Json(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Ordered, partitioned, append-only log of readings, replayable from a cursor.
///
/// Delivery is at-least-once and order is preserved within a partition only.
#[async_trait::async_trait]
pub trait ChangeSource: Send + Sync {
    /// Partition keys currently known to the source.
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Read up to `max_items` readings of `partition_key` starting at `cursor`.
    async fn read_batch(&self, partition_key: &str, cursor: &Cursor, max_items: usize) -> Result<ChangeBatch>;
}

/// Durable mapping partition key -> continuation token.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` means the store confirmed no checkpoint exists; `Err` means it could not tell.
    async fn load(&self, partition_key: &str) -> Result<Option<Checkpoint>>;

    /// Must be durable before returning `Ok`.
    async fn save(&self, partition_key: &str, continuation: &str) -> Result<()>;
}

/// Document store where summaries are upserted by `Summary::id`.
#[async_trait::async_trait]
pub trait SummarySink: Send + Sync {
    async fn upsert(&self, summary: &Summary) -> Result<()>;
}

pub mod prelude {
    pub use super::{
        ChangeBatch, ChangeSource, Checkpoint, CheckpointStore, Cursor, Error, FieldMap, Reading, Result,
        StartPosition, Summary, SummaryIdentity, SummarySink,
    };
}
