//! tally-io: file-backed stores.
//! - `JsonlChangeFeed`: one `<partition>.jsonl` file per partition; tokens are byte offsets
//! - `JsonDirSummarySink`: one JSON document per summary id
//! - `JsonDirCheckpointStore`: one JSON document per partition key
//!
//! Documents are replaced by writing a temp file, syncing it and renaming it
//! over the target, so readers never observe a half-written document.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tally_core::{
    metrics, ChangeBatch, ChangeSource, Checkpoint, CheckpointStore, Cursor, Error, FieldMap, Reading, Result,
    StartPosition, Summary, SummarySink,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

/// File name for a partition key or document id.
///
/// Bytes outside `[A-Za-z0-9._-]`, `%` itself and a leading `.` are written as
/// `%XX`, so distinct keys never share a file and the key can be recovered
/// with [`key_for_file_stem`].
pub fn file_stem_for(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Inverse of [`file_stem_for`]; `None` if `stem` is not a valid encoding.
pub fn key_for_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

async fn write_json_atomic<T: Serialize>(dir: &Path, stem: &str, value: &T, kind: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(format!("{stem}.json"));
    let tmp = dir.join(format!(".{stem}.json.tmp"));
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&bytes).await?;
    f.sync_all().await?;
    drop(f);
    tokio::fs::rename(&tmp, &target).await?;
    metrics::BYTES_WRITTEN.with_label_values(&[kind]).inc_by(bytes.len() as u64);
    Ok(())
}

/// `Ok(None)` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_json_document(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json")
        && !path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

/// Offset just past the last `\n` in `file`; a partly written tail line is not skipped.
async fn end_of_last_line(file: &mut tokio::fs::File) -> Result<u64> {
    const CHUNK: u64 = 4096;
    let mut end = file.metadata().await?.len();
    let mut buf = Vec::new();
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        buf.resize((end - start) as usize, 0);
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf).await?;
        if let Some(i) = buf.iter().rposition(|b| *b == b'\n') {
            return Ok(start + i as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Reads readings from a directory holding one JSONL file per partition.
///
/// A trailing line without a newline is treated as still being written and
/// is not consumed until it is complete.
#[derive(Clone)]
pub struct JsonlChangeFeed {
    pub dir: PathBuf,
    pub fields: FieldMap,
}

impl JsonlChangeFeed {
    pub fn new(dir: impl Into<PathBuf>, fields: FieldMap) -> Self {
        Self { dir: dir.into(), fields }
    }

    pub fn partition_path(&self, partition_key: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem_for(partition_key)))
    }

    /// Append a producer document to its partition file.
    pub async fn append_document(&self, doc: &serde_json::Value) -> Result<()> {
        let pk = self.fields.partition_key(doc).ok_or_else(|| Error::Source {
            message: format!("document has no {} field", self.fields.partition_key_field),
            transient: false,
        })?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(doc)?;
        line.push('\n');
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partition_path(&pk))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }

    async fn start_offset(&self, file: &mut tokio::fs::File, cursor: &Cursor) -> Result<u64> {
        match cursor {
            Cursor::Token(t) => t.parse::<u64>().map_err(|_| Error::Source {
                message: format!("malformed continuation token: {t}"),
                transient: false,
            }),
            Cursor::Start(StartPosition::Beginning) => Ok(0),
            Cursor::Start(StartPosition::Now) => end_of_last_line(file).await,
            Cursor::Start(StartPosition::Since(since)) => {
                let mut reader = tokio::io::BufReader::new(&mut *file);
                let mut offset = 0u64;
                let mut line = Vec::new();
                loop {
                    line.clear();
                    let n = reader.read_until(b'\n', &mut line).await?;
                    if n == 0 || line.last() != Some(&b'\n') {
                        return Ok(offset);
                    }
                    let ts = serde_json::from_slice::<serde_json::Value>(trim_line(&line))
                        .ok()
                        .and_then(|v| v.get(&self.fields.time_field).and_then(tally_core::parse_timestamp));
                    if ts.is_some_and(|ts| ts >= *since) {
                        return Ok(offset);
                    }
                    offset += n as u64;
                }
            }
        }
    }

    fn parse_line(&self, partition_key: &str, line: &[u8], offset: u64) -> Option<Reading> {
        let doc: serde_json::Value = match serde_json::from_slice(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(partition = partition_key, offset, error = %e, "skipping unparseable line");
                metrics::MALFORMED_DOCUMENTS.inc();
                return None;
            }
        };
        match self.fields.to_reading(&doc, offset) {
            Some(r) if r.partition_key == partition_key => Some(r),
            Some(r) => {
                warn!(partition = partition_key, found = %r.partition_key, offset, "skipping document of another partition");
                metrics::MALFORMED_DOCUMENTS.inc();
                None
            }
            None => {
                warn!(partition = partition_key, offset, "skipping document without partition key or timestamp");
                metrics::MALFORMED_DOCUMENTS.inc();
                None
            }
        }
    }
}

#[async_trait]
impl ChangeSource for JsonlChangeFeed {
    async fn partitions(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::source_unavailable(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "jsonl") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(key_for_file_stem) {
                Some(key) => out.push(key),
                None => warn!(path = %path.display(), "ignoring feed file whose name is not an encoded partition key"),
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_batch(&self, partition_key: &str, cursor: &Cursor, max_items: usize) -> Result<ChangeBatch> {
        let path = self.partition_path(partition_key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let continuation = match cursor {
                    Cursor::Token(t) => t.clone(),
                    Cursor::Start(_) => "0".to_string(),
                };
                return Ok(ChangeBatch { items: vec![], continuation, has_more: false });
            }
            Err(e) => return Err(Error::source_unavailable(format!("{}: {e}", path.display()))),
        };
        let len = file.metadata().await?.len();
        let mut offset = self.start_offset(&mut file, cursor).await?.min(len);
        file.seek(SeekFrom::Start(offset)).await?;

        let mut reader = tokio::io::BufReader::new(file);
        let mut items = Vec::new();
        let mut line = Vec::new();
        while items.len() < max_items {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 || line.last() != Some(&b'\n') {
                break;
            }
            let at = offset;
            offset += n as u64;
            let trimmed = trim_line(&line);
            if trimmed.is_empty() {
                continue;
            }
            if let Some(r) = self.parse_line(partition_key, trimmed, at) {
                items.push(r);
            }
        }
        Ok(ChangeBatch {
            items,
            continuation: offset.to_string(),
            has_more: offset < len,
        })
    }
}

/// Summary documents stored as `<dir>/<id>.json`.
#[derive(Clone)]
pub struct JsonDirSummarySink {
    pub dir: PathBuf,
}

impl JsonDirSummarySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Summary>> {
        Ok(read_json(&self.dir.join(format!("{}.json", file_stem_for(id)))).await?)
    }

    /// Stored summaries, optionally for one partition, newest first.
    pub async fn list(&self, partition_key: Option<&str>) -> Result<Vec<Summary>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_json_document(&path) {
                continue;
            }
            if let Some(s) = read_json::<Summary>(&path).await? {
                if partition_key.map_or(true, |pk| s.partition_key == pk) {
                    out.push(s);
                }
            }
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl SummarySink for JsonDirSummarySink {
    async fn upsert(&self, summary: &Summary) -> Result<()> {
        write_json_atomic(&self.dir, &file_stem_for(&summary.id), summary, "summary")
            .await
            .map_err(|e| Error::sink_unavailable(format!("{}: {e}", self.dir.display())))
    }
}

/// Checkpoints stored as `<dir>/<partition>.json`.
#[derive(Clone)]
pub struct JsonDirCheckpointStore {
    pub dir: PathBuf,
}

impl JsonDirCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every stored checkpoint, ordered by partition key.
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_json_document(&path) {
                if let Some(cp) = read_json::<Checkpoint>(&path).await? {
                    out.push(cp);
                }
            }
        }
        out.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for JsonDirCheckpointStore {
    async fn load(&self, partition_key: &str) -> Result<Option<Checkpoint>> {
        let path = self.dir.join(format!("{}.json", file_stem_for(partition_key)));
        read_json(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => Error::Checkpoint {
                message: format!("{}: {e}", path.display()),
                transient: false,
            },
            _ => Error::checkpoint_unavailable(format!("{}: {e}", path.display())),
        })
    }

    async fn save(&self, partition_key: &str, continuation: &str) -> Result<()> {
        let cp = Checkpoint::new(partition_key, continuation);
        write_json_atomic(&self.dir, &file_stem_for(partition_key), &cp, "checkpoint")
            .await
            .map_err(|e| Error::checkpoint_unavailable(format!("{}: {e}", self.dir.display())))
    }
}
