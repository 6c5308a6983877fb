use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static READINGS_INGESTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_readings_ingested_total", "Readings fed to a window aggregator"),
        &["partition"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static INVALID_VALUES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tally_invalid_values_total",
        "Readings admitted to a window without a usable numeric value",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static MALFORMED_DOCUMENTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tally_malformed_documents_total",
        "Change feed documents skipped for lacking a partition key or timestamp",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static BATCHES_COMMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_batches_committed_total", "Batches whose summary and checkpoint were persisted"),
        &["partition"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static IO_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_io_retries_total", "Retried store calls"),
        &["op"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static IO_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_io_failures_total", "Store calls that failed after exhausting retries"),
        &["op"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static BYTES_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_bytes_written_total", "Total bytes written by file-backed stores"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static WINDOW_LEN: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("tally_window_len", "Readings held in the committed window"),
        &["partition"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static SINK_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("tally_sink_latency_ms", "Summary upsert latency (ms), retries included").buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static ACTIVE_PARTITIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("tally_active_partitions", "Partition workers currently running").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub fn render_prometheus() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
