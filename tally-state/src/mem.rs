use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_core::{
    metrics, ChangeBatch, ChangeSource, Checkpoint, CheckpointStore, Cursor, Error, FieldMap, Reading, Result,
    StartPosition, Summary, SummarySink,
};
use tracing::warn;

#[derive(Default)]
struct FeedInner {
    logs: BTreeMap<String, Vec<Reading>>,
}

/// An in-memory partitioned change log. Continuation tokens are offsets into a partition's log.
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed(Arc<Mutex<FeedInner>>);

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the reading's partition; returns the new log length.
    pub fn append(&self, reading: Reading) -> usize {
        let mut guard = self.0.lock();
        let log = guard.logs.entry(reading.partition_key.clone()).or_default();
        log.push(reading);
        log.len()
    }

    /// Append a raw producer document; documents that cannot be routed are dropped.
    ///
    /// The fallback id position is taken under the same lock as the append.
    pub fn append_document(&self, doc: &serde_json::Value, fields: &FieldMap) -> Option<usize> {
        let mut guard = self.0.lock();
        let reading = fields.partition_key(doc).and_then(|pk| {
            let position = guard.logs.get(&pk).map_or(0, Vec::len) as u64;
            fields.to_reading(doc, position)
        });
        match reading {
            Some(reading) => {
                let log = guard.logs.entry(reading.partition_key.clone()).or_default();
                log.push(reading);
                Some(log.len())
            }
            None => {
                drop(guard);
                warn!(%doc, "dropping document without partition key or timestamp");
                metrics::MALFORMED_DOCUMENTS.inc();
                None
            }
        }
    }

    pub fn len(&self, partition_key: &str) -> usize {
        self.0.lock().logs.get(partition_key).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().logs.values().all(Vec::is_empty)
    }
}

fn start_offset(log: &[Reading], cursor: &Cursor) -> Result<usize> {
    match cursor {
        Cursor::Token(t) => t.parse::<usize>().map_err(|_| Error::Source {
            message: format!("malformed continuation token: {t}"),
            transient: false,
        }),
        Cursor::Start(StartPosition::Beginning) => Ok(0),
        Cursor::Start(StartPosition::Now) => Ok(log.len()),
        Cursor::Start(StartPosition::Since(t)) => Ok(log.iter().position(|r| r.timestamp >= *t).unwrap_or(log.len())),
    }
}

#[async_trait]
impl ChangeSource for InMemoryChangeFeed {
    async fn partitions(&self) -> Result<Vec<String>> {
        Ok(self.0.lock().logs.keys().cloned().collect())
    }

    async fn read_batch(&self, partition_key: &str, cursor: &Cursor, max_items: usize) -> Result<ChangeBatch> {
        let guard = self.0.lock();
        let log = guard.logs.get(partition_key).map(Vec::as_slice).unwrap_or_default();
        let start = start_offset(log, cursor)?.min(log.len());
        let end = start.saturating_add(max_items).min(log.len());
        Ok(ChangeBatch {
            items: log[start..end].to_vec(),
            continuation: end.to_string(),
            has_more: end < log.len(),
        })
    }
}

/// In-memory `CheckpointStore`; every save is immediately visible.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore(Arc<Mutex<HashMap<String, Checkpoint>>>);

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition_key: &str) -> Option<Checkpoint> {
        self.0.lock().get(partition_key).cloned()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, partition_key: &str) -> Result<Option<Checkpoint>> {
        Ok(self.get(partition_key))
    }

    async fn save(&self, partition_key: &str, continuation: &str) -> Result<()> {
        self.0
            .lock()
            .insert(partition_key.to_string(), Checkpoint::new(partition_key, continuation));
        Ok(())
    }
}

#[derive(Default)]
struct SinkInner {
    docs: HashMap<String, Summary>,
    writes: usize,
}

/// In-memory `SummarySink` keyed by summary id.
#[derive(Clone, Default)]
pub struct InMemorySummarySink(Arc<Mutex<SinkInner>>);

impl InMemorySummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Summary> {
        self.0.lock().docs.get(id).cloned()
    }

    /// Stored summaries, optionally for one partition, newest first.
    pub fn list(&self, partition_key: Option<&str>) -> Vec<Summary> {
        let mut out: Vec<Summary> = self
            .0
            .lock()
            .docs
            .values()
            .filter(|s| partition_key.map_or(true, |pk| s.partition_key == pk))
            .cloned()
            .collect();
        crate::sort_newest_first(&mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.0.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful upserts so far, including overwrites.
    pub fn writes(&self) -> usize {
        self.0.lock().writes
    }
}

#[async_trait]
impl SummarySink for InMemorySummarySink {
    async fn upsert(&self, summary: &Summary) -> Result<()> {
        let mut guard = self.0.lock();
        guard.docs.insert(summary.id.clone(), summary.clone());
        guard.writes += 1;
        Ok(())
    }
}
