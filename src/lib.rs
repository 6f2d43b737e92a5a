//! `tabular-loader` streams row-oriented files into relational tables without holding a whole
//! file in memory.
//!
//! The pipeline is:
//!
//! 1. A [`ingestion::RecordSource`] reads records one at a time, each tagged with a group
//!    (a workbook sheet, or the value of a record's `sheet` field).
//! 2. The first record of a group fixes the group's column configuration
//!    ([`table_config::derive_table_config`]), with optional per-field overrides.
//! 3. Every record is coerced to typed values ([`pipeline::transform`]) and buffered.
//! 4. The [`pipeline::EventSequencer`] flushes the buffer as `create` / `insert` / `swap`
//!    [`types::IngestEvent`]s: every 50,000 rows, and when a group ends.
//! 5. The [`load::LoadOrchestrator`] writes each group into a temporary table and swaps it into
//!    place when the group's `swap` event arrives.
//!
//! ## What you can load
//!
//! **File formats (auto-detected by extension):**
//!
//! - **JSONL**: `.jsonl`, `.ndjson` (one JSON object per line)
//! - **CSV**: `.csv`
//! - **Excel/workbooks** (Cargo feature `excel`, on by default): `.xlsx`, `.xls`, `.xlsm`, `.xlsb`, `.ods`
//!
//! **Column types:** text (values pass through), number (`f64`; unparseable input becomes NaN)
//! and timestamp (`YYYY-MM-DD HH:mm` local time in a configured IANA zone).
//!
//! ## Quick example: transform without a database
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use tabular_loader::ingestion::memory::MemorySource;
//! use tabular_loader::pipeline::EventSequencer;
//! use tabular_loader::table_config::TableConfigOverrides;
//! use tabular_loader::types::{EventKind, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tabular_loader::IngestionError> {
//! let overrides = TableConfigOverrides::from_json_str(r#"{"x": {"fieldType": "number"}}"#)?;
//! let source = MemorySource::from_json([json!({"sheet": "A", "x": "1"}), json!({"sheet": "A", "x": "2"})]);
//! let mut events = EventSequencer::new(source, Arc::new(overrides), chrono_tz::UTC);
//!
//! let swap = events.next_event().await?.expect("one event");
//! assert_eq!(swap.kind, EventKind::Swap);
//! assert_eq!(swap.columns, vec!["x"]);
//! assert_eq!(swap.rows, vec![vec![Value::Number(1.0)], vec![Value::Number(2.0)]]);
//! assert!(events.next_event().await?.is_none());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`ingestion`]: source iterators, notifications and the [`ingestion::run_import`] entrypoint
//! - [`table_config`]: schema derivation and the override document
//! - [`pipeline`]: value transformation, batching and event sequencing
//! - [`load`]: table loading and the PostgreSQL store
//! - [`types`]: the shared data model
//! - [`logging`]: tracing subscriber setup for binaries
//! - [`error`]: error types used across the crate

pub mod error;
pub mod ingestion;
pub mod load;
pub mod logging;
pub mod pipeline;
pub mod table_config;
pub mod types;

pub use error::{IngestionError, IngestionResult};
