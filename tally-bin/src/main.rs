use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use tally_core::config::WorkerConfig;
use tally_core::{CheckpointStore, Summary, SummarySink};
use tally_io::{JsonDirCheckpointStore, JsonDirSummarySink, JsonlChangeFeed};
use tally_runtime::{Dispatcher, DispatcherConfig, HealthRegistry, PartitionHealth};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Sliding-window summaries over a sensor change feed")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the summariser until Ctrl+C. Settings come from --config or the environment.
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Serve /metrics and /health on 127.0.0.1 (0 disables)
        #[arg(long, default_value_t = 0)]
        http_port: u16,
        /// Keep checkpoints and summaries in a RocksDB database instead of JSON files
        #[cfg(feature = "rocksdb")]
        #[arg(long)]
        rocksdb: Option<PathBuf>,
    },
    /// Print stored summaries as JSON lines, newest first
    Summaries {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        partition: Option<String>,
        #[cfg(feature = "rocksdb")]
        #[arg(long)]
        rocksdb: Option<PathBuf>,
    },
}

fn app(health: HealthRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health_report))
        .with_state(health)
}

async fn metrics() -> String {
    tally_core::metrics::render_prometheus()
}

async fn health_report(
    State(health): State<HealthRegistry>,
) -> (StatusCode, Json<BTreeMap<String, PartitionHealth>>) {
    let status = if health.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(health.snapshot()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        #[cfg(not(feature = "rocksdb"))]
        Commands::Run { config, http_port } => {
            let cfg = load_config(config.as_deref()).await?;
            let (sink, checkpoints) = file_stores(&cfg);
            run_worker(cfg, sink, checkpoints, http_port).await
        }
        #[cfg(feature = "rocksdb")]
        Commands::Run { config, http_port, rocksdb } => {
            let cfg = load_config(config.as_deref()).await?;
            let (sink, checkpoints) = match rocksdb {
                Some(path) => {
                    let store = Arc::new(tally_state::RocksStore::open(path)?);
                    (store.clone() as Arc<dyn SummarySink>, store as Arc<dyn CheckpointStore>)
                }
                None => file_stores(&cfg),
            };
            run_worker(cfg, sink, checkpoints, http_port).await
        }
        #[cfg(not(feature = "rocksdb"))]
        Commands::Summaries { config, partition } => {
            let cfg = load_config(config.as_deref()).await?;
            let summaries = JsonDirSummarySink::new(cfg.summaries_dir()).list(partition.as_deref()).await?;
            print_summaries(&summaries)
        }
        #[cfg(feature = "rocksdb")]
        Commands::Summaries { config, partition, rocksdb } => {
            let cfg = load_config(config.as_deref()).await?;
            let summaries = match rocksdb {
                Some(path) => tally_state::RocksStore::open(path)?.list_summaries(partition.as_deref())?,
                None => JsonDirSummarySink::new(cfg.summaries_dir()).list(partition.as_deref()).await?,
            };
            print_summaries(&summaries)
        }
    }
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    let cfg = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            WorkerConfig::from_toml_str(&text)?
        }
        None => WorkerConfig::from_env()?,
    };
    Ok(cfg)
}

fn file_stores(cfg: &WorkerConfig) -> (Arc<dyn SummarySink>, Arc<dyn CheckpointStore>) {
    (
        Arc::new(JsonDirSummarySink::new(cfg.summaries_dir())),
        Arc::new(JsonDirCheckpointStore::new(cfg.leases_dir())),
    )
}

async fn run_worker(
    cfg: WorkerConfig,
    sink: Arc<dyn SummarySink>,
    checkpoints: Arc<dyn CheckpointStore>,
    http_port: u16,
) -> anyhow::Result<()> {
    let source = Arc::new(JsonlChangeFeed::new(cfg.readings_dir(), cfg.fields.clone()));
    let dispatcher = Dispatcher::new(source, sink, checkpoints, DispatcherConfig::from_worker_config(&cfg)?);
    tracing::info!(
        readings = %cfg.readings_dir().display(),
        summaries = %cfg.summaries_dir().display(),
        leases = %cfg.leases_dir().display(),
        window_size = cfg.window_size,
        "starting summariser"
    );

    if http_port != 0 {
        let app = app(dispatcher.health());
        let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("serving /metrics and /health on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "http server stopped");
            }
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
        }
        let _ = stop_tx.send(true);
    });
    dispatcher.run(stop_rx).await?;
    Ok(())
}

fn print_summaries(summaries: &[Summary]) -> anyhow::Result<()> {
    for s in summaries {
        println!("{}", serde_json::to_string(s)?);
    }
    Ok(())
}
