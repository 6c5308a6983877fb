use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Reading;

/// Persisted resume point of one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub partition_key: String,
    /// Opaque continuation token issued by the change source.
    pub continuation: String,
    /// When the checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(partition_key: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            continuation: continuation.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Where to start reading a partition that has no checkpoint yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartPosition {
    Beginning,
    #[default]
    Now,
    Since(DateTime<Utc>),
}

impl FromStr for StartPosition {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "beginning" => Ok(StartPosition::Beginning),
            "now" => Ok(StartPosition::Now),
            _ => DateTime::parse_from_rfc3339(s)
                .map(|t| StartPosition::Since(t.with_timezone(&Utc)))
                .map_err(|_| crate::Error::Config(format!("invalid start position: {s}"))),
        }
    }
}

impl TryFrom<String> for StartPosition {
    type Error = crate::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StartPosition> for String {
    fn from(p: StartPosition) -> Self {
        p.to_string()
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Beginning => f.write_str("beginning"),
            StartPosition::Now => f.write_str("now"),
            StartPosition::Since(t) => f.write_str(&t.to_rfc3339()),
        }
    }
}

/// Position a read starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Start(StartPosition),
    Token(String),
}

impl Cursor {
    /// Resume from a loaded checkpoint, or from `start` when none exists.
    pub fn resume(checkpoint: Option<Checkpoint>, start: StartPosition) -> Self {
        match checkpoint {
            Some(cp) => Cursor::Token(cp.continuation),
            None => Cursor::Start(start),
        }
    }
}

/// One page of a partition's change log.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    /// Readings in log order.
    pub items: Vec<Reading>,
    /// Token to pass back to continue after `items`.
    pub continuation: String,
    /// More readings were available than `max_items`.
    pub has_more: bool,
}
