use async_trait::async_trait;
use tally_core::{Checkpoint, CheckpointStore, Error, Result, Summary, SummarySink};

const CHECKPOINT_NS: &[u8] = b"checkpoint:";
const SUMMARY_NS: &[u8] = b"summary:";

/// A RocksDB-backed checkpoint and summary store (enable with `--features rocksdb`).
///
/// Both live in one database under separate key prefixes; values are JSON.
pub struct RocksStore {
    db: rocksdb::DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = rocksdb::DB::open_default(path).map_err(|e| Error::Anyhow(e.into()))?;
        Ok(Self { db })
    }

    fn key(ns: &[u8], id: &str) -> Vec<u8> {
        let mut k = ns.to_vec();
        k.extend_from_slice(id.as_bytes());
        k
    }

    /// Stored summaries, optionally for one partition, newest first.
    pub fn list_summaries(&self, partition_key: Option<&str>) -> Result<Vec<Summary>> {
        let mode = rocksdb::IteratorMode::From(SUMMARY_NS, rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator(mode) {
            let (k, v) = item.map_err(|e| Error::sink_unavailable(e.to_string()))?;
            if !k.starts_with(SUMMARY_NS) {
                break;
            }
            let summary: Summary = serde_json::from_slice(&v)?;
            if partition_key.map_or(true, |pk| summary.partition_key == pk) {
                out.push(summary);
            }
        }
        crate::sort_newest_first(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for RocksStore {
    async fn load(&self, partition_key: &str) -> Result<Option<Checkpoint>> {
        let raw = self
            .db
            .get(Self::key(CHECKPOINT_NS, partition_key))
            .map_err(|e| Error::checkpoint_unavailable(e.to_string()))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, partition_key: &str, continuation: &str) -> Result<()> {
        let bytes = serde_json::to_vec(&Checkpoint::new(partition_key, continuation))?;
        let mut opts = rocksdb::WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_opt(Self::key(CHECKPOINT_NS, partition_key), bytes, &opts)
            .map_err(|e| Error::checkpoint_unavailable(e.to_string()))
    }
}

#[async_trait]
impl SummarySink for RocksStore {
    async fn upsert(&self, summary: &Summary) -> Result<()> {
        let bytes = serde_json::to_vec(summary)?;
        let mut opts = rocksdb::WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_opt(Self::key(SUMMARY_NS, &summary.id), bytes, &opts)
            .map_err(|e| Error::sink_unavailable(e.to_string()))
    }
}
