use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped measurement from the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub id: String,
    pub partition_key: String,
    /// Raw metric value. Missing or non-numeric values are kept as-is.
    #[serde(default)]
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        id: impl Into<String>,
        partition_key: impl Into<String>,
        value: impl Into<serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            value: value.into(),
            timestamp,
        }
    }

    /// The value as a finite number, if it is one.
    pub fn numeric_value(&self) -> Option<f64> {
        match &self.value {
            serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
            _ => None,
        }
    }
}

/// How summary ids are derived.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SummaryIdentity {
    /// One document per partition, overwritten on every batch.
    #[default]
    Latest,
    /// One document per window, keyed by the newest reading's timestamp.
    History,
}

impl FromStr for SummaryIdentity {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(SummaryIdentity::Latest),
            "history" => Ok(SummaryIdentity::History),
            other => Err(crate::Error::Config(format!("unknown summary mode: {other}"))),
        }
    }
}

impl fmt::Display for SummaryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryIdentity::Latest => f.write_str("latest"),
            SummaryIdentity::History => f.write_str("history"),
        }
    }
}

impl SummaryIdentity {
    /// Deterministic document id for a window of `partition_key` whose newest entry is `newest`.
    pub fn summary_id(&self, partition_key: &str, newest: DateTime<Utc>) -> String {
        match self {
            SummaryIdentity::Latest => format!("summary-{partition_key}"),
            SummaryIdentity::History => format!("summary-{partition_key}-{}", newest.timestamp_millis()),
        }
    }
}

/// Rolling statistics over the most recent readings of one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub id: String,
    pub partition_key: String,
    /// Timestamp of the newest reading in the window.
    pub timestamp: DateTime<Utc>,
    pub max: f64,
    pub min: f64,
    /// Arithmetic mean rounded to two decimals.
    pub avg: f64,
    /// Number of valid values the statistics were computed over.
    pub count: usize,
}

/// Maps raw change-feed documents onto `Reading`s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldMap {
    pub id_field: String,
    pub partition_key_field: String,
    pub value_field: String,
    pub time_field: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            id_field: "id".into(),
            partition_key_field: "sensor_id".into(),
            value_field: "temperature".into(),
            time_field: "timestamp".into(),
        }
    }
}

impl FieldMap {
    /// Partition key of a raw document, if it has one.
    pub fn partition_key(&self, doc: &serde_json::Value) -> Option<String> {
        match doc.get(&self.partition_key_field)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Build a reading from a raw document.
    ///
    /// Returns `None` when the document has no partition key or no parseable
    /// timestamp, since it can then be neither routed nor ordered. Documents
    /// without an id get `"{partition_key}@{position}"`.
    pub fn to_reading(&self, doc: &serde_json::Value, position: u64) -> Option<Reading> {
        let partition_key = self.partition_key(doc)?;
        let timestamp = doc.get(&self.time_field).and_then(parse_timestamp)?;
        let id = match doc.get(&self.id_field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => format!("{partition_key}@{position}"),
        };
        let value = doc.get(&self.value_field).cloned().unwrap_or(serde_json::Value::Null);
        Some(Reading { id, partition_key, value, timestamp })
    }
}

/// Parse an ISO-8601 string or an epoch-milliseconds number.
///
/// Strings without a UTC offset are taken to be UTC.
pub fn parse_timestamp(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    match v {
        serde_json::Value::Number(n) => DateTime::<Utc>::from_timestamp_millis(n.as_i64()?),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}
