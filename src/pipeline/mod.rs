//! The streaming transform pipeline.
//!
//! - [`transform`]: per-field coercion of raw values (numbers, local timestamps)
//! - [`batch`]: the bounded row buffer and flush threshold
//! - [`sequencer`]: the pull-based state machine that turns a record stream into
//!   `create` / `insert` / `swap` events
//!
//! Schema derivation lives in [`crate::table_config`] because the loaders use it too.

pub mod batch;
pub mod sequencer;
pub mod transform;

pub use batch::{format_elapsed, BatchAccumulator, FLUSH_THRESHOLD};
pub use sequencer::{EventSequencer, IngestEventHandler, RunSummary};
pub use transform::{transform_record, transform_value};
