//! End-to-end run over in-memory stores: seeded synthetic readings go through
//! the dispatcher and every summary written along the way is printed.
//! Run:
//!   cargo run -p tally-examples --bin replay -- --readings 30 --window 10

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tally_core::{Reading, RetryPolicy, StartPosition, SummaryIdentity};
use tally_runtime::{Dispatcher, DispatcherConfig};
use tally_state::{InMemoryChangeFeed, InMemoryCheckpointStore, InMemorySummarySink};
use tokio::sync::watch;

#[derive(Parser, Debug)]
struct Args {
    /// Readings per sensor
    #[arg(long, default_value_t = 30)]
    readings: usize,
    #[arg(long, default_value_t = 3)]
    sensors: usize,
    #[arg(long, default_value_t = 10)]
    window: usize,
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let feed = InMemoryChangeFeed::new();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
    for i in 0..args.readings {
        for s in 1..=args.sensors {
            let sensor = format!("sensor-{s}");
            // A sprinkling of unusable values; they sit in the window but never count.
            let value = if rng.gen_ratio(1, 12) {
                serde_json::json!("NaN")
            } else {
                serde_json::json!(tally_ops::round_to(rng.gen_range(15.0..=40.0), 2))
            };
            let at = t0 + chrono::Duration::seconds(i as i64 * 5 + rng.gen_range(0..5));
            feed.append(Reading::new(format!("{sensor}-{i}"), sensor, value, at));
        }
    }

    let sink = InMemorySummarySink::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let config = DispatcherConfig {
        window_size: args.window,
        batch_size: 4,
        poll_interval: Duration::from_millis(20),
        discovery_interval: Duration::from_millis(50),
        failure_backoff: Duration::from_millis(100),
        start_position: StartPosition::Beginning,
        summary_mode: SummaryIdentity::History,
        retry: RetryPolicy::default(),
        max_consecutive_failures: Some(3),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(feed.clone()),
        Arc::new(sink.clone()),
        Arc::new(checkpoints.clone()),
        config,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(stop_rx).await })
    };

    let target = args.readings.to_string();
    let sensors: Vec<String> = (1..=args.sensors).map(|s| format!("sensor-{s}")).collect();
    let caught_up = || {
        sensors
            .iter()
            .all(|pk| checkpoints.get(pk).is_some_and(|cp| cp.continuation == target))
    };
    tokio::time::timeout(Duration::from_secs(30), async {
        while !caught_up() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("replay did not catch up within 30s"))?;

    let _ = stop_tx.send(true);
    runner.await??;

    for summary in sink.list(None).iter().rev() {
        println!("{}", serde_json::to_string(summary)?);
    }
    for (pk, health) in dispatcher.health().snapshot() {
        eprintln!(
            "{pk}: {:?}, {} batches, {} readings",
            health.state, health.batches_committed, health.readings_processed
        );
    }
    Ok(())
}
