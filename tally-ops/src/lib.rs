//! tally-ops: in-memory aggregation built on top of tally-core.
//!
//! Included:
//! - `WindowAggregator`: per-partition window of the N most recent readings
//! - `Stats`: max/min/mean over a set of values, mean rounded to `AVG_DECIMALS`
//!
//! Nothing in this crate performs I/O, so it can be tested deterministically.

pub mod window;

pub use window::{WindowAggregator, WindowEntry, WindowState};

/// Decimal digits kept in `Summary::avg`.
pub const AVG_DECIMALS: i32 = 2;

/// Statistics over a non-empty set of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub max: f64,
    pub min: f64,
    pub avg: f64,
    pub count: usize,
}

impl Stats {
    /// `None` for an empty input.
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut iter = values.into_iter();
        let first = iter.next()?;
        let (mut max, mut min, mut sum, mut count) = (first, first, first, 1usize);
        for v in iter {
            max = max.max(v);
            min = min.min(v);
            sum += v;
            count += 1;
        }
        Some(Stats {
            max,
            min,
            avg: round_to(sum / count as f64, AVG_DECIMALS),
            count,
        })
    }
}

/// Round half away from zero to `decimals` digits.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub mod prelude {
    pub use super::{round_to, Stats, WindowAggregator, WindowState, AVG_DECIMALS};
}
