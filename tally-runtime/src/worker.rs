use std::sync::Arc;
use std::time::{Duration, Instant};

use tally_core::{metrics, retry_with_backoff, ChangeSource, CheckpointStore, Cursor, Error, Result, SummarySink};
use tally_ops::WindowAggregator;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::health::{HealthRegistry, PartitionState};
use crate::DispatcherConfig;

enum Step {
    /// Summary (if any) and checkpoint persisted, window and cursor advanced.
    Committed { has_more: bool },
    /// Nothing new was read.
    Idle,
}

/// Counts a running worker in `tally_active_partitions`, also across a panic.
struct ActivePartition;

impl ActivePartition {
    fn enter() -> Self {
        metrics::ACTIVE_PARTITIONS.inc();
        ActivePartition
    }
}

impl Drop for ActivePartition {
    fn drop(&mut self) {
        metrics::ACTIVE_PARTITIONS.dec();
    }
}

/// Owns one partition: its window, its cursor and its commit cycle.
pub(crate) struct PartitionWorker {
    pub(crate) partition_key: String,
    pub(crate) source: Arc<dyn ChangeSource>,
    pub(crate) sink: Arc<dyn SummarySink>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) config: Arc<DispatcherConfig>,
    pub(crate) health: HealthRegistry,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl PartitionWorker {
    /// Runs until shutdown; returns `Err` only when the partition gives up.
    pub(crate) async fn run(mut self) -> Result<()> {
        let _active = ActivePartition::enter();
        let outcome = self.run_inner().await;
        match &outcome {
            Ok(()) => self.health.set_state(&self.partition_key, PartitionState::Stopped),
            Err(_) => self.health.set_state(&self.partition_key, PartitionState::Failed),
        }
        outcome
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.health.set_state(&self.partition_key, PartitionState::Starting);
        let Some(mut cursor) = self.resolve_cursor().await? else {
            return Ok(());
        };
        info!(partition = %self.partition_key, ?cursor, "partition worker started");

        // Starts empty even when resuming: readings before the checkpoint are not re-read.
        let mut window = WindowAggregator::new(
            self.partition_key.clone(),
            self.config.window_size,
            self.config.summary_mode,
        );
        loop {
            if self.shutting_down() {
                break;
            }
            match self.step(&mut window, &mut cursor).await {
                Ok(Step::Committed { has_more }) => {
                    debug!(partition = %self.partition_key, has_more, "batch committed");
                }
                Ok(Step::Idle) => {
                    self.health.record_success(&self.partition_key, PartitionState::Idle);
                    if self.pause(self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    self.on_failure(&e)?;
                    if self.pause(self.config.failure_backoff).await {
                        break;
                    }
                }
            }
        }
        info!(partition = %self.partition_key, "partition worker stopped");
        Ok(())
    }

    /// Load the checkpoint; no reading happens until this resolves. `None` on shutdown.
    async fn resolve_cursor(&mut self) -> Result<Option<Cursor>> {
        loop {
            let checkpoints = &self.checkpoints;
            let pk = self.partition_key.as_str();
            match retry_with_backoff(&self.config.retry, "load_checkpoint", || checkpoints.load(pk)).await {
                Ok(cp) => return Ok(Some(Cursor::resume(cp, self.config.start_position))),
                Err(e) => {
                    self.on_failure(&e)?;
                    if self.pause(self.config.failure_backoff).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn on_failure(&self, e: &Error) -> Result<()> {
        let failures = self.health.record_failure(&self.partition_key, e);
        if let Some(max) = self.config.max_consecutive_failures {
            if failures >= max {
                error!(partition = %self.partition_key, failures, error = %e, "giving up on partition");
                return Err(Error::Anyhow(anyhow::anyhow!(
                    "partition {} failed {failures} times in a row: {e}",
                    self.partition_key
                )));
            }
        }
        warn!(
            partition = %self.partition_key,
            failures,
            backoff_ms = self.config.failure_backoff.as_millis() as u64,
            error = %e,
            "cycle failed; will re-read from the last checkpoint"
        );
        Ok(())
    }

    /// One read-aggregate-write-checkpoint cycle.
    ///
    /// The batch is ingested into a copy of the window. The copy replaces the
    /// committed window only after the summary upsert and the checkpoint save
    /// both succeed, so a failed cycle re-reads the same batch into the same
    /// state.
    #[instrument(level = "debug", skip_all, fields(partition = %self.partition_key))]
    async fn step(&self, window: &mut WindowAggregator, cursor: &mut Cursor) -> Result<Step> {
        let policy = &self.config.retry;
        let pk = self.partition_key.as_str();
        let source = &self.source;
        let checkpoints = &self.checkpoints;
        let sink = &self.sink;
        let max_items = self.config.batch_size;

        let batch = {
            let cursor_ref: &Cursor = cursor;
            retry_with_backoff(policy, "read_batch", || source.read_batch(pk, cursor_ref, max_items)).await?
        };
        let next = Cursor::Token(batch.continuation.clone());

        if batch.items.is_empty() {
            // Nothing to aggregate, but pin the position so a restart doesn't
            // fall back to the start position.
            if next != *cursor {
                retry_with_backoff(policy, "save_checkpoint", || checkpoints.save(pk, &batch.continuation)).await?;
                debug!(partition = %pk, continuation = %batch.continuation, "checkpoint advanced without readings");
                *cursor = next;
            }
            return Ok(Step::Idle);
        }

        let received = batch.items.len();
        let invalid = batch.items.iter().filter(|r| r.numeric_value().is_none()).count();
        let mut staged = window.clone();
        for reading in batch.items {
            staged.ingest(reading);
        }
        metrics::READINGS_INGESTED.with_label_values(&[pk]).inc_by(received as u64);
        if invalid > 0 {
            metrics::INVALID_VALUES.inc_by(invalid as u64);
            debug!(partition = %pk, invalid, "readings without a usable value");
        }

        match staged.compute() {
            Some(summary) => {
                let started = Instant::now();
                let written = retry_with_backoff(policy, "upsert_summary", || sink.upsert(&summary)).await;
                metrics::SINK_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1000.0);
                written?;
                debug!(
                    partition = %pk,
                    id = %summary.id,
                    max = summary.max,
                    min = summary.min,
                    avg = summary.avg,
                    count = summary.count,
                    "summary written"
                );
            }
            None => debug!(partition = %pk, "window holds no valid values; no summary written"),
        }

        retry_with_backoff(policy, "save_checkpoint", || checkpoints.save(pk, &batch.continuation)).await?;

        *window = staged;
        *cursor = next;
        metrics::WINDOW_LEN.with_label_values(&[pk]).set(window.len() as i64);
        metrics::BATCHES_COMMITTED.with_label_values(&[pk]).inc();
        self.health.record_commit(pk, &batch.continuation, received);
        info!(
            partition = %pk,
            readings = received,
            window_len = window.len(),
            continuation = %batch.continuation,
            "batch committed"
        );
        Ok(Step::Committed { has_more: batch.has_more })
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `period` unless shutdown comes first; true means stop.
    async fn pause(&mut self, period: Duration) -> bool {
        if self.shutting_down() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => false,
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}
