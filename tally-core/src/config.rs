use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, FieldMap, Result, RetryPolicy, StartPosition, SummaryIdentity};

/// Settings for one summariser worker process.
///
/// Loaded from the environment (`WorkerConfig::from_env`) or a TOML file
/// (`WorkerConfig::from_toml_str`); anything not given keeps its default.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub database: String,
    pub readings_container: String,
    pub summaries_container: String,
    pub leases_container: String,
    /// Root directory of the file-backed stores.
    pub data_dir: PathBuf,
    pub window_size: usize,
    pub poll_interval: String, // e.g. "1s"
    pub batch_size: usize,
    pub start_position: StartPosition,
    pub summary_mode: SummaryIdentity,
    pub failure_backoff: String,
    pub discovery_interval: String,
    pub max_retries: usize,
    /// Stop a partition after this many failed cycles in a row; `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
    pub fields: FieldMap,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database: "sensors".into(),
            readings_container: "readings".into(),
            summaries_container: "summaries".into(),
            leases_container: "leases".into(),
            data_dir: PathBuf::from("./data"),
            window_size: 10,
            poll_interval: "1s".into(),
            batch_size: 100,
            start_position: StartPosition::Now,
            summary_mode: SummaryIdentity::Latest,
            failure_backoff: "30s".into(),
            discovery_interval: "5s".into(),
            max_retries: 5,
            max_consecutive_failures: None,
            fields: FieldMap::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: WorkerConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = WorkerConfig::default();
        if let Some(v) = lookup("DATABASE_NAME") {
            cfg.database = v;
        }
        if let Some(v) = lookup("READINGS_CONTAINER") {
            cfg.readings_container = v;
        }
        if let Some(v) = lookup("SUMMARIES_CONTAINER") {
            cfg.summaries_container = v;
        }
        if let Some(v) = lookup("LEASES_CONTAINER") {
            cfg.leases_container = v;
        }
        if let Some(v) = lookup("TALLY_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WINDOW_SIZE") {
            cfg.window_size = parse_number("WINDOW_SIZE", &v)?;
        }
        if let Some(v) = lookup("BATCH_INTERVAL_SECONDS") {
            // bare numbers are seconds
            cfg.poll_interval = v;
        }
        if let Some(v) = lookup("BATCH_SIZE") {
            cfg.batch_size = parse_number("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("START_POSITION") {
            cfg.start_position = v.parse()?;
        }
        if let Some(v) = lookup("SUMMARY_MODE") {
            cfg.summary_mode = v.parse()?;
        }
        if let Some(v) = lookup("FAILURE_BACKOFF") {
            cfg.failure_backoff = v;
        }
        if let Some(v) = lookup("DISCOVERY_INTERVAL") {
            cfg.discovery_interval = v;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            cfg.max_retries = parse_number("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MAX_CONSECUTIVE_FAILURES") {
            cfg.max_consecutive_failures = Some(parse_number("MAX_CONSECUTIVE_FAILURES", &v)?);
        }
        if let Some(v) = lookup("PARTITION_KEY_FIELD") {
            cfg.fields.partition_key_field = v;
        }
        if let Some(v) = lookup("VALUE_FIELD") {
            cfg.fields.value_field = v;
        }
        if let Some(v) = lookup("TIME_FIELD") {
            cfg.fields.time_field = v;
        }
        if let Some(v) = lookup("ID_FIELD") {
            cfg.fields.id_field = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Config("window_size must be greater than zero".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".into()));
        }
        for (name, value) in [
            ("database", &self.database),
            ("readings_container", &self.readings_container),
            ("summaries_container", &self.summaries_container),
            ("leases_container", &self.leases_container),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }
        self.poll_interval()?;
        self.failure_backoff()?;
        self.discovery_interval()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
    }

    pub fn failure_backoff(&self) -> Result<Duration> {
        parse_duration(&self.failure_backoff)
    }

    pub fn discovery_interval(&self) -> Result<Duration> {
        parse_duration(&self.discovery_interval)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn readings_dir(&self) -> PathBuf {
        self.data_dir.join(&self.database).join(&self.readings_container)
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.data_dir.join(&self.database).join(&self.summaries_container)
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.data_dir.join(&self.database).join(&self.leases_container)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, v: &str) -> Result<T> {
    v.trim()
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{name} is not a valid number: {v}")))
}

pub fn parse_duration_ms(s: &str) -> Result<i64> {
    // very small parser for values like "10s", "500ms", "2m"
    let s = s.trim();
    let parse = |num: &str| {
        num.trim()
            .parse::<i64>()
            .map_err(|_| Error::Config(format!("invalid duration: {s}")))
    };
    if let Some(num) = s.strip_suffix("ms") {
        return parse(num);
    }
    if let Some(num) = s.strip_suffix('s') {
        return Ok(parse(num)? * 1_000);
    }
    if let Some(num) = s.strip_suffix('m') {
        return Ok(parse(num)? * 60_000);
    }
    if let Some(num) = s.strip_suffix('h') {
        return Ok(parse(num)? * 3_600_000);
    }
    // default assume seconds
    Ok(parse(s)? * 1_000)
}

pub fn parse_duration(s: &str) -> Result<Duration> {
    let ms = parse_duration_ms(s)?;
    if ms < 0 {
        return Err(Error::Config(format!("negative duration: {s}")));
    }
    Ok(Duration::from_millis(ms as u64))
}
