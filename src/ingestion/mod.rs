//! Source iterators and the unified import entrypoint.
//!
//! Every input format is read through the [`RecordSource`] trait: a forward-only, single-pass
//! sequence of [`crate::types::SourceRecord`]s, each tagged with its group. Implementations:
//!
//! - [`jsonl`]: one JSON object per line; the `sheet` field names the group
//! - [`csv`]: one record per row; an optional `sheet` column names the group
//! - [`excel`]: every row of every sheet, grouped by sheet (feature `excel`)
//! - [`memory`]: an in-process record list
//!
//! Most callers should use [`run_import`] (from [`unified`]), which opens the right source,
//! drives the [`crate::pipeline::EventSequencer`] into a [`crate::load::LoadOrchestrator`] and
//! reports the outcome through an [`ImportNotifier`].

pub mod csv;
#[cfg(feature = "excel")]
pub mod excel;
pub mod jsonl;
pub mod memory;
pub mod notify;
pub mod unified;

use async_trait::async_trait;

use crate::error::IngestionResult;
use crate::table_config::GROUP_FIELD;
use crate::types::SourceRecord;

pub use notify::{
    notify_best_effort, CompositeNotifier, FileNotifier, ImportNotifier, IngestionSeverity, LogNotifier,
    Notification, WebhookNotifier,
};
pub use unified::{open_source, run_import, ImportFormat, ImportOptions, ImportReport, ImportRequest};

/// Rows a source dropped on its own, cumulative since the source was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowTally {
    /// Blank rows.
    pub empty_rows: u64,
    /// Rows that could not be decoded.
    pub skipped_rows: u64,
}

impl RowTally {
    /// Counts accumulated since `earlier`.
    pub fn since(self, earlier: RowTally) -> RowTally {
        RowTally {
            empty_rows: self.empty_rows.saturating_sub(earlier.empty_rows),
            skipped_rows: self.skipped_rows.saturating_sub(earlier.skipped_rows),
        }
    }
}

/// A forward-only sequence of grouped records.
///
/// `next_record` returns `Ok(None)` once the source is exhausted. Record-level decode problems
/// are handled inside the source (logged, counted in [`RowTally`], skipped); an `Err` means the
/// source itself can no longer be read and the run must stop.
#[async_trait]
pub trait RecordSource: Send {
    async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>>;

    /// Rows dropped by the source so far.
    fn tally(&self) -> RowTally {
        RowTally::default()
    }

    /// Identity of the source (usually the file path) for error messages.
    fn describe(&self) -> String;

    /// Record field that carries the group identifier and is left out of derived schemas.
    /// `None` when groups come from the source's structure instead of the records.
    fn group_field(&self) -> Option<&str> {
        Some(GROUP_FIELD)
    }
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
        (**self).next_record().await
    }

    fn tally(&self) -> RowTally {
        (**self).tally()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn group_field(&self) -> Option<&str> {
        (**self).group_field()
    }
}

/// Group identifier for a record from the value of its structural field.
///
/// Strings are used as-is, other scalars as their JSON text, and a missing or null value maps to
/// the empty (default) group.
pub(crate) fn group_of(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
