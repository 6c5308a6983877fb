use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tally_core::config::WorkerConfig;
use tally_core::{
    retry_with_backoff, ChangeSource, CheckpointStore, Error, Result, RetryPolicy, StartPosition, SummaryIdentity,
    SummarySink,
};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use crate::health::HealthRegistry;
use crate::worker::PartitionWorker;

/// Resolved runtime settings for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub window_size: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub failure_backoff: Duration,
    pub discovery_interval: Duration,
    pub start_position: StartPosition,
    pub summary_mode: SummaryIdentity,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(5),
            start_position: StartPosition::Now,
            summary_mode: SummaryIdentity::Latest,
            retry: RetryPolicy::default(),
            max_consecutive_failures: None,
        }
    }
}

impl DispatcherConfig {
    pub fn from_worker_config(cfg: &WorkerConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            window_size: cfg.window_size,
            batch_size: cfg.batch_size,
            poll_interval: cfg.poll_interval()?,
            failure_backoff: cfg.failure_backoff()?,
            discovery_interval: cfg.discovery_interval()?,
            start_position: cfg.start_position,
            summary_mode: cfg.summary_mode,
            retry: cfg.retry_policy(),
            max_consecutive_failures: cfg.max_consecutive_failures,
        })
    }
}

/// Runs one worker per partition of a change source.
///
/// Partitions are discovered at start and every `discovery_interval` after
/// that; each new key gets its own task with its own window and cursor.
/// A partition that gives up is not restarted and does not affect the others.
pub struct Dispatcher {
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn SummarySink>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: Arc<DispatcherConfig>,
    health: HealthRegistry,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn SummarySink>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            source,
            sink,
            checkpoints,
            config: Arc::new(config),
            health: HealthRegistry::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Shared view of per-partition health; stays valid after `run` returns.
    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Run until `shutdown` turns true (or its sender is dropped), then wait for every worker.
    ///
    /// Returns `Err` when partition discovery fails permanently or a worker
    /// panics; the remaining workers are stopped first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut known: HashSet<String> = HashSet::new();
        let mut outcome = Ok(());

        info!(
            window_size = self.config.window_size,
            batch_size = self.config.batch_size,
            start = %self.config.start_position,
            "dispatcher started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.discover().await {
                Ok(keys) => {
                    for key in keys {
                        if known.insert(key.clone()) {
                            self.spawn_worker(&mut workers, key, stop_rx.clone());
                        }
                    }
                }
                Err(e) if !e.is_transient() => {
                    error!(error = %e, "partition discovery failed permanently");
                    outcome = Err(e);
                    break;
                }
                Err(e) => warn!(error = %e, "partition discovery failed; keeping current workers"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.discovery_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = on_worker_exit(joined) {
                        outcome = Err(e);
                        break;
                    }
                }
            }
        }

        info!(workers = workers.len(), "dispatcher stopping");
        let _ = stop_tx.send(true);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = on_worker_exit(joined) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        info!("dispatcher stopped");
        outcome
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let source = &self.source;
        retry_with_backoff(&self.config.retry, "partitions", || source.partitions()).await
    }

    fn spawn_worker(&self, workers: &mut JoinSet<(String, Result<()>)>, key: String, stop: watch::Receiver<bool>) {
        info!(partition = %key, "starting partition worker");
        let worker = PartitionWorker {
            partition_key: key.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            checkpoints: self.checkpoints.clone(),
            config: self.config.clone(),
            health: self.health.clone(),
            shutdown: stop,
        };
        let span = info_span!("partition", key = %key);
        workers.spawn(async move { (key, worker.run().await) }.instrument(span));
    }
}

/// A worker giving up is logged and contained; a panic is not.
fn on_worker_exit(joined: std::result::Result<(String, Result<()>), JoinError>) -> Result<()> {
    match joined {
        Ok((key, Ok(()))) => {
            info!(partition = %key, "partition worker exited");
            Ok(())
        }
        Ok((key, Err(e))) => {
            error!(partition = %key, error = %e, "partition worker failed; other partitions continue");
            Ok(())
        }
        Err(e) => Err(Error::Anyhow(anyhow::anyhow!(e))),
    }
}

/// Run a [`Dispatcher`] over `source` until `shutdown` fires.
pub async fn run(
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn SummarySink>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: DispatcherConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    Dispatcher::new(source, sink, checkpoints, config).run(shutdown).await
}
