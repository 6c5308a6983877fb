use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tally_core::{
    ChangeBatch, ChangeSource, Checkpoint, CheckpointStore, Cursor, Error, Reading, Result, RetryPolicy,
    StartPosition, Summary, SummaryIdentity, SummarySink,
};
use tally_runtime::{Dispatcher, DispatcherConfig, PartitionState};
use tally_state::{InMemoryChangeFeed, InMemoryCheckpointStore, InMemorySummarySink};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type Events = Arc<Mutex<Vec<String>>>;

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn reading(pk: &str, i: i64, value: serde_json::Value) -> Reading {
    Reading::new(format!("{pk}-{i}"), pk, value, t0() + chrono::Duration::seconds(i))
}

/// Readings 1..=n of `pk`, each valued at its index.
fn fill(feed: &InMemoryChangeFeed, pk: &str, n: i64) {
    for i in 1..=n {
        feed.append(reading(pk, i, json!(i)));
    }
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        window_size: 10,
        batch_size: 100,
        poll_interval: Duration::from_millis(10),
        failure_backoff: Duration::from_millis(20),
        discovery_interval: Duration::from_millis(10),
        start_position: StartPosition::Beginning,
        summary_mode: SummaryIdentity::Latest,
        retry: RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        max_consecutive_failures: None,
    }
}

fn start(dispatcher: Arc<Dispatcher>) -> (watch::Sender<bool>, JoinHandle<Result<()>>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { dispatcher.run(rx).await });
    (tx, handle)
}

async fn stop(tx: watch::Sender<bool>, handle: JoinHandle<Result<()>>) {
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap()
        .unwrap();
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Fails upserts for one partition `remaining` times, then delegates.
struct FlakySink {
    inner: InMemorySummarySink,
    partition: String,
    remaining: AtomicUsize,
    events: Events,
}

impl FlakySink {
    fn new(inner: InMemorySummarySink, partition: &str, failures: usize, events: Events) -> Self {
        Self { inner, partition: partition.into(), remaining: AtomicUsize::new(failures), events }
    }
}

#[async_trait]
impl SummarySink for FlakySink {
    async fn upsert(&self, summary: &Summary) -> Result<()> {
        if summary.partition_key == self.partition && self.remaining.load(Ordering::SeqCst) > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().push(format!("upsert {} err", summary.partition_key));
            return Err(Error::sink_unavailable("503 service unavailable"));
        }
        self.inner.upsert(summary).await?;
        self.events.lock().push(format!("upsert {} ok", summary.partition_key));
        Ok(())
    }
}

/// Records checkpoint traffic; fails the first `load_failures` loads.
struct RecordingStore {
    inner: InMemoryCheckpointStore,
    load_failures: AtomicUsize,
    events: Events,
}

impl RecordingStore {
    fn new(inner: InMemoryCheckpointStore, load_failures: usize, events: Events) -> Self {
        Self { inner, load_failures: AtomicUsize::new(load_failures), events }
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn load(&self, partition_key: &str) -> Result<Option<Checkpoint>> {
        if self.load_failures.load(Ordering::SeqCst) > 0 {
            self.load_failures.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().push(format!("load {partition_key} err"));
            return Err(Error::checkpoint_unavailable("lease container unreachable"));
        }
        self.events.lock().push(format!("load {partition_key} ok"));
        self.inner.load(partition_key).await
    }

    async fn save(&self, partition_key: &str, continuation: &str) -> Result<()> {
        self.events.lock().push(format!("save {partition_key} {continuation}"));
        self.inner.save(partition_key, continuation).await
    }
}

/// Records every read that returns readings.
struct RecordingSource {
    inner: InMemoryChangeFeed,
    events: Events,
}

#[async_trait]
impl ChangeSource for RecordingSource {
    async fn partitions(&self) -> Result<Vec<String>> {
        self.inner.partitions().await
    }

    async fn read_batch(&self, partition_key: &str, cursor: &Cursor, max_items: usize) -> Result<ChangeBatch> {
        let batch = self.inner.read_batch(partition_key, cursor, max_items).await?;
        if !batch.items.is_empty() {
            self.events.lock().push(format!("read {partition_key} {}", batch.items.len()));
        }
        Ok(batch)
    }
}

#[tokio::test]
async fn summarises_each_partition_independently() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "sensor-1", 12);
    feed.append(reading("sensor-2", 1, json!(10)));
    feed.append(reading("sensor-2", 2, json!(20)));
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed.clone()),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
        fast_config(),
    ));
    let health = dispatcher.health();
    let (tx, handle) = start(dispatcher);

    eventually("both checkpoints", || store.get("sensor-1").is_some() && store.get("sensor-2").is_some()).await;

    let s1 = sink.get("summary-sensor-1").unwrap();
    assert_eq!((s1.max, s1.min, s1.avg, s1.count), (12.0, 3.0, 7.5, 10));
    assert_eq!(s1.timestamp, t0() + chrono::Duration::seconds(12));
    let s2 = sink.get("summary-sensor-2").unwrap();
    assert_eq!((s2.max, s2.min, s2.avg, s2.count), (20.0, 10.0, 15.0, 2));
    assert_eq!(store.get("sensor-1").unwrap().continuation, "12");
    assert_eq!(store.get("sensor-2").unwrap().continuation, "2");

    stop(tx, handle).await;
    let snapshot = health.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.values().all(|h| h.state == PartitionState::Stopped));
    assert_eq!(snapshot["sensor-1"].readings_processed, 12);
}

#[tokio::test]
async fn checkpoint_advances_only_after_summary_write() {
    let events: Events = Arc::default();
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 12);
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();

    // max_retries = 1: the first cycle burns two attempts, the second succeeds on its retry.
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed),
        Arc::new(FlakySink::new(sink.clone(), "s1", 3, events.clone())),
        Arc::new(RecordingStore::new(store.clone(), 0, events.clone())),
        fast_config(),
    ));
    let health = dispatcher.health();
    let (tx, handle) = start(dispatcher);

    eventually("checkpoint", || store.get("s1").is_some()).await;
    stop(tx, handle).await;

    let log: Vec<String> = events.lock().iter().filter(|e| !e.starts_with("load")).cloned().collect();
    assert_eq!(log, ["upsert s1 err", "upsert s1 err", "upsert s1 err", "upsert s1 ok", "save s1 12"]);

    // The replayed batch must not be counted twice.
    let s = sink.get("summary-s1").unwrap();
    assert_eq!((s.max, s.min, s.avg, s.count), (12.0, 3.0, 7.5, 10));
    assert_eq!(sink.writes(), 1);

    let h = health.get("s1").unwrap();
    assert_eq!(h.batches_committed, 1);
    assert_eq!(h.consecutive_failures, 0);
    assert_eq!(h.last_error.as_deref(), Some("summary sink: 503 service unavailable"));
}

#[tokio::test]
async fn persistent_sink_failure_never_moves_checkpoint() {
    let events: Events = Arc::default();
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 3);
    fill(&feed, "s2", 2);
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed),
        Arc::new(FlakySink::new(sink.clone(), "s1", usize::MAX, events)),
        Arc::new(store.clone()),
        fast_config(),
    ));
    let health = dispatcher.health();
    let (tx, handle) = start(dispatcher);

    eventually("s2 committed and s1 failing repeatedly", || {
        store.get("s2").is_some() && health.get("s1").map_or(false, |h| h.consecutive_failures >= 3)
    })
    .await;

    assert!(store.get("s1").is_none());
    assert!(sink.get("summary-s1").is_none());
    assert_eq!(sink.get("summary-s2").unwrap().count, 2);
    assert_eq!(health.get("s1").unwrap().state, PartitionState::Backoff);
    assert!(!health.is_healthy());

    stop(tx, handle).await;
    assert!(store.get("s1").is_none());
}

#[tokio::test]
async fn partition_gives_up_after_consecutive_failures() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 3);
    fill(&feed, "s2", 2);
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();
    let config = DispatcherConfig { max_consecutive_failures: Some(2), ..fast_config() };

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed.clone()),
        Arc::new(FlakySink::new(sink.clone(), "s1", usize::MAX, Arc::default())),
        Arc::new(store.clone()),
        config,
    ));
    let health = dispatcher.health();
    let (tx, handle) = start(dispatcher);

    eventually("s1 failed", || health.get("s1").map_or(false, |h| h.state == PartitionState::Failed)).await;
    assert_eq!(health.get("s1").unwrap().consecutive_failures, 2);

    // The other partition keeps going.
    feed.append(reading("s2", 3, json!(30)));
    eventually("s2 third reading", || store.get("s2").map_or(false, |cp| cp.continuation == "3")).await;
    assert!(!handle.is_finished());

    stop(tx, handle).await;
    assert_eq!(health.get("s1").unwrap().state, PartitionState::Failed);
    assert!(store.get("s1").is_none());
}

#[tokio::test]
async fn resumes_after_saved_checkpoint() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 12);
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();
    store.save("s1", "10").await.unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
        fast_config(),
    ));
    let (tx, handle) = start(dispatcher);

    eventually("checkpoint 12", || store.get("s1").map_or(false, |cp| cp.continuation == "12")).await;
    stop(tx, handle).await;

    let s = sink.get("summary-s1").unwrap();
    assert_eq!((s.max, s.min, s.avg, s.count), (12.0, 11.0, 11.5, 2));
}

#[tokio::test]
async fn start_now_skips_history_and_pins_position() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 5);
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();
    let config = DispatcherConfig { start_position: StartPosition::Now, ..fast_config() };

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed.clone()),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
        config,
    ));
    let (tx, handle) = start(dispatcher);

    eventually("position pinned", || store.get("s1").is_some()).await;
    assert_eq!(store.get("s1").unwrap().continuation, "5");
    assert!(sink.is_empty());

    feed.append(reading("s1", 6, json!(40.5)));
    eventually("summary", || sink.get("summary-s1").is_some()).await;
    stop(tx, handle).await;

    let s = sink.get("summary-s1").unwrap();
    assert_eq!((s.avg, s.count), (40.5, 1));
    assert_eq!(store.get("s1").unwrap().continuation, "6");
}

#[tokio::test]
async fn batch_without_valid_values_still_checkpoints() {
    let feed = InMemoryChangeFeed::new();
    feed.append(reading("s1", 1, json!("NaN")));
    feed.append(reading("s1", 2, serde_json::Value::Null));
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed.clone()),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
        fast_config(),
    ));
    let (tx, handle) = start(dispatcher);

    eventually("checkpoint", || store.get("s1").is_some()).await;
    assert!(sink.is_empty());

    feed.append(reading("s1", 3, json!(21)));
    eventually("summary", || sink.get("summary-s1").is_some()).await;
    stop(tx, handle).await;

    let s = sink.get("summary-s1").unwrap();
    assert_eq!((s.max, s.min, s.avg, s.count), (21.0, 21.0, 21.0, 1));
}

#[tokio::test]
async fn reading_waits_for_checkpoint_store() {
    let events: Events = Arc::default();
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 4);
    let store = InMemoryCheckpointStore::new();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(RecordingSource { inner: feed, events: events.clone() }),
        Arc::new(InMemorySummarySink::new()),
        Arc::new(RecordingStore::new(store.clone(), 3, events.clone())),
        fast_config(),
    ));
    let (tx, handle) = start(dispatcher);

    eventually("checkpoint", || store.get("s1").is_some()).await;
    stop(tx, handle).await;

    let log = events.lock().clone();
    assert_eq!(&log[..5], ["load s1 err", "load s1 err", "load s1 err", "load s1 ok", "read s1 4"]);
}

#[tokio::test]
async fn shutdown_interrupts_idle_wait() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 1);
    let store = InMemoryCheckpointStore::new();
    let config = DispatcherConfig {
        poll_interval: Duration::from_secs(3600),
        discovery_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed),
        Arc::new(InMemorySummarySink::new()),
        Arc::new(store.clone()),
        config,
    ));
    let health = dispatcher.health();
    let (tx, handle) = start(dispatcher);

    eventually("idle", || health.get("s1").map_or(false, |h| h.state == PartitionState::Idle)).await;
    stop(tx, handle).await;
    assert_eq!(health.get("s1").unwrap().state, PartitionState::Stopped);
}

#[tokio::test]
async fn history_mode_keeps_one_document_per_window() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 2);
    let sink = InMemorySummarySink::new();
    let store = InMemoryCheckpointStore::new();
    let config = DispatcherConfig { summary_mode: SummaryIdentity::History, batch_size: 1, ..fast_config() };

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
        config,
    ));
    let (tx, handle) = start(dispatcher);

    eventually("both batches", || store.get("s1").map_or(false, |cp| cp.continuation == "2")).await;
    stop(tx, handle).await;

    let summaries = sink.list(Some("s1"));
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].count, 2);
    assert_eq!(summaries[1].count, 1);
    assert_ne!(summaries[0].id, summaries[1].id);
}

/// A source whose container is gone for good.
struct MissingContainer;

#[async_trait]
impl ChangeSource for MissingContainer {
    async fn partitions(&self) -> Result<Vec<String>> {
        Err(Error::Source { message: "container not found".into(), transient: false })
    }

    async fn read_batch(&self, _partition_key: &str, _cursor: &Cursor, _max_items: usize) -> Result<ChangeBatch> {
        Ok(ChangeBatch::default())
    }
}

#[tokio::test]
async fn permanent_discovery_failure_ends_run() {
    let dispatcher = Dispatcher::new(
        Arc::new(MissingContainer),
        Arc::new(InMemorySummarySink::new()),
        Arc::new(InMemoryCheckpointStore::new()),
        fast_config(),
    );
    let (_tx, rx) = watch::channel(false);
    let err = tokio::time::timeout(Duration::from_secs(5), dispatcher.run(rx))
        .await
        .expect("dispatcher kept running")
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(err.to_string(), "change source: container not found");
}

/// Panics on upserts for one partition.
struct PanickingSink {
    inner: InMemorySummarySink,
    partition: String,
}

#[async_trait]
impl SummarySink for PanickingSink {
    async fn upsert(&self, summary: &Summary) -> Result<()> {
        if summary.partition_key == self.partition {
            panic!("sink bug for {}", summary.partition_key);
        }
        self.inner.upsert(summary).await
    }
}

#[tokio::test]
async fn worker_panic_stops_every_worker_and_fails_run() {
    let feed = InMemoryChangeFeed::new();
    fill(&feed, "s1", 3);
    fill(&feed, "s2", 2);
    let config = DispatcherConfig {
        poll_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed),
        Arc::new(PanickingSink { inner: InMemorySummarySink::new(), partition: "s1".into() }),
        Arc::new(InMemoryCheckpointStore::new()),
        config,
    ));
    let health = dispatcher.health();
    let (_tx, handle) = start(dispatcher);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatcher kept running after a worker panic")
        .unwrap();
    assert!(matches!(outcome, Err(Error::Anyhow(_))));
    assert_eq!(health.get("s2").unwrap().state, PartitionState::Stopped);
}

fn tmp_dir(name: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("tally_dispatch_{}_{}", name, nanos))
}

#[tokio::test]
async fn summarises_file_backed_feed_with_unusual_keys() {
    use tally_io::{JsonDirCheckpointStore, JsonDirSummarySink, JsonlChangeFeed};

    let dir = tmp_dir("files");
    let feed = JsonlChangeFeed::new(dir.join("readings"), tally_core::FieldMap::default());
    for i in 1..=12 {
        feed.append_document(&json!({
            "id": format!("r{i}"),
            "sensor_id": "plant/a",
            "temperature": i,
            "timestamp": format!("2024-01-01T00:00:{i:02}"),
        }))
        .await
        .unwrap();
    }
    feed.append_document(&json!({"sensor_id": "plant_a", "temperature": 50, "timestamp": "2024-01-01T00:00:00"}))
        .await
        .unwrap();
    let sink = JsonDirSummarySink::new(dir.join("summaries"));
    let store = JsonDirCheckpointStore::new(dir.join("leases"));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed.clone()),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
        fast_config(),
    ));
    let (tx, handle) = start(dispatcher);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.list().await.unwrap().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for checkpoints");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop(tx, handle).await;

    let a = sink.get("summary-plant/a").await.unwrap().unwrap();
    assert_eq!((a.max, a.min, a.avg, a.count), (12.0, 3.0, 7.5, 10));
    assert_eq!(a.partition_key, "plant/a");
    let b = sink.get("summary-plant_a").await.unwrap().unwrap();
    assert_eq!((b.max, b.count), (50.0, 1));

    let file_len = tokio::fs::metadata(feed.partition_path("plant/a")).await.unwrap().len();
    assert_eq!(store.load("plant/a").await.unwrap().unwrap().continuation, file_len.to_string());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
