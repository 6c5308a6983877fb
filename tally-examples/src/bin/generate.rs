//! Synthetic temperature producer: one task per sensor appends readings to the readings feed.
//! Run:
//!   cargo run -p tally-examples --bin generate -- --fast --count 200
//! Each document looks like {id, sensor_id, temperature, timestamp}; the
//! feed directory comes from --config or the same environment as `tally run`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use tally_core::config::WorkerConfig;
use tally_io::JsonlChangeFeed;

#[derive(Parser, Debug)]
#[command(about = "Append random sensor readings to the tally readings feed")]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of sensors, named sensor-1..sensor-N
    #[arg(long, default_value_t = 5)]
    sensors: usize,
    /// Divide the 1-10 s interval between readings by 10
    #[arg(long)]
    fast: bool,
    /// Stop after this many readings across all sensors
    #[arg(long)]
    count: Option<u64>,
}

/// Takes one unit from the shared budget; false once it is spent.
fn take(budget: &Option<Arc<AtomicU64>>) -> bool {
    match budget {
        None => true,
        Some(left) => left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok(),
    }
}

async fn produce(feed: JsonlChangeFeed, sensor: String, fast: bool, budget: Option<Arc<AtomicU64>>) -> Result<()> {
    loop {
        let (delay_ms, temperature, tag) = {
            let mut rng = rand::thread_rng();
            let delay_ms: u64 = rng.gen_range(1_000..=10_000);
            let temperature = tally_ops::round_to(rng.gen_range(15.0..=40.0), 2);
            (delay_ms, temperature, rng.gen::<u32>())
        };
        let delay = Duration::from_millis(if fast { delay_ms / 10 } else { delay_ms });
        tokio::time::sleep(delay).await;
        if !take(&budget) {
            return Ok(());
        }
        let now = Utc::now();
        let doc = serde_json::json!({
            "id": format!("{sensor}-{}-{tag:08x}", now.timestamp_millis()),
            "sensor_id": &sensor,
            "temperature": temperature,
            "timestamp": now.to_rfc3339(),
        });
        feed.append_document(&doc).await?;
        tracing::info!(%sensor, temperature, "reading written");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => WorkerConfig::from_toml_str(&tokio::fs::read_to_string(path).await?)?,
        None => WorkerConfig::from_env()?,
    };
    let feed = JsonlChangeFeed::new(cfg.readings_dir(), cfg.fields.clone());
    tracing::info!(dir = %feed.dir.display(), sensors = args.sensors, "generating readings");

    let budget = args.count.map(|n| Arc::new(AtomicU64::new(n)));
    let mut tasks = tokio::task::JoinSet::new();
    for i in 1..=args.sensors {
        tasks.spawn(produce(feed.clone(), format!("sensor-{i}"), args.fast, budget.clone()));
    }

    tokio::select! {
        res = async {
            while let Some(joined) = tasks.join_next().await {
                joined??;
            }
            Ok::<_, anyhow::Error>(())
        } => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, stopping");
            Ok(())
        }
    }
}
