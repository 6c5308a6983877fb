//! tally-runtime: the dispatcher that keeps one summarising worker per partition.
//!
//! Each worker repeats a read, aggregate, write, checkpoint cycle:
//! - read the next batch after its cursor (retried with backoff)
//! - feed the batch through a copy of its sliding window
//! - upsert the resulting summary, then save the batch's continuation
//! - only then adopt the new window and cursor
//!
//! A failed cycle leaves window and checkpoint untouched; the worker backs
//! off and re-reads the same batch.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally_runtime::{Dispatcher, DispatcherConfig};
//! # async fn demo(
//! #     source: Arc<dyn tally_core::ChangeSource>,
//! #     sink: Arc<dyn tally_core::SummarySink>,
//! #     checkpoints: Arc<dyn tally_core::CheckpointStore>,
//! # ) -> tally_core::Result<()> {
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! let dispatcher = Dispatcher::new(source, sink, checkpoints, DispatcherConfig::default());
//! dispatcher.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod health;
mod worker;

pub use dispatcher::{run, Dispatcher, DispatcherConfig};
pub use health::{HealthRegistry, PartitionHealth, PartitionState};
