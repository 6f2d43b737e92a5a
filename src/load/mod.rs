//! Loading events into a relational store.
//!
//! [`LoadOrchestrator`] consumes the events of an [`crate::pipeline::EventSequencer`] and places
//! each group's rows into its own table:
//!
//! - the group's first event creates a timestamp-suffixed temporary table;
//! - every event's rows are inserted into it in chunks of `insert_batch_size`;
//! - the group's `swap` event moves the temporary table into place (replace or merge) and sends
//!   a success notification.
//!
//! The statements themselves are issued through the [`TableStore`] trait; [`postgres`] provides
//! the PostgreSQL implementation.

pub mod postgres;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::IngestionResult;
use crate::ingestion::notify::{notify_best_effort, ImportNotifier, IngestionSeverity, Notification};
use crate::pipeline::IngestEventHandler;
use crate::types::{EventKind, IngestEvent, TableSchema, TransformedRow};

pub use postgres::PgTableStore;

/// Default number of rows per insert call.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 5_000;

/// Format of the suffix that makes temporary table and index names unique per run.
pub const TIMESTAMP_SUFFIX_FORMAT: &str = "%Y%m%d%H%M%S";

/// Statements a loader needs from the target store.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the temporary table for `table_name` and return its name.
    ///
    /// Called once per group, before the group's first insert. `group_hint` is the kind of the
    /// event that triggered the creation.
    async fn create_temp_table(
        &self,
        table_name: &str,
        columns: &[String],
        table_config: &TableSchema,
        timestamp_suffix: &str,
        group_hint: Option<EventKind>,
    ) -> IngestionResult<String>;

    /// Insert `rows` (one value per entry of `columns`) in order.
    async fn insert_batch(
        &self,
        tmp_table_name: &str,
        columns: &[String],
        table_config: &TableSchema,
        rows: &[TransformedRow],
    ) -> IngestionResult<()>;

    /// Replace (`truncate = true`) or merge into (`truncate = false`) the final table.
    async fn swap_tables(&self, tmp_table_name: &str, final_table_name: &str, truncate: bool) -> IngestionResult<()>;
}

#[async_trait]
impl<S: TableStore + ?Sized> TableStore for Arc<S> {
    async fn create_temp_table(
        &self,
        table_name: &str,
        columns: &[String],
        table_config: &TableSchema,
        timestamp_suffix: &str,
        group_hint: Option<EventKind>,
    ) -> IngestionResult<String> {
        (**self)
            .create_temp_table(table_name, columns, table_config, timestamp_suffix, group_hint)
            .await
    }

    async fn insert_batch(
        &self,
        tmp_table_name: &str,
        columns: &[String],
        table_config: &TableSchema,
        rows: &[TransformedRow],
    ) -> IngestionResult<()> {
        (**self).insert_batch(tmp_table_name, columns, table_config, rows).await
    }

    async fn swap_tables(&self, tmp_table_name: &str, final_table_name: &str, truncate: bool) -> IngestionResult<()> {
        (**self).swap_tables(tmp_table_name, final_table_name, truncate).await
    }
}

/// Final table name for `group`: `<table>_<group>`, or `<table>` for the unnamed group.
pub fn final_table_name(table: &str, group: &str) -> String {
    if group.is_empty() {
        table.to_string()
    } else {
        format!("{table}_{group}")
    }
}

/// Outcome of loading one group. Also the summary carried by the success notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableLoad {
    pub input_file: String,
    pub table_name: String,
    /// Valid, empty and skipped rows together.
    pub total_rows: u64,
    pub valid_rows: u64,
    pub empty_rows: u64,
    pub skipped_rows: u64,
    /// Seconds from table creation to swap, two decimals.
    pub duration: String,
    pub sheet_name: String,
}

/// Every table loaded by a run, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub tables: Vec<TableLoad>,
}

impl LoadReport {
    pub fn valid_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.valid_rows).sum()
    }
}

#[derive(Debug)]
struct ActiveTable {
    group: String,
    final_table: String,
    tmp_table: String,
    inserted: u64,
    empty_rows: u64,
    skipped_rows: u64,
    started: Instant,
}

/// Applies events to a [`TableStore`], one group table at a time.
pub struct LoadOrchestrator<S> {
    store: S,
    table: String,
    input_file: String,
    insert_batch_size: usize,
    truncate: bool,
    notifier: Option<Arc<dyn ImportNotifier>>,
    active: Option<ActiveTable>,
    report: LoadReport,
}

impl<S: TableStore> LoadOrchestrator<S> {
    /// `table` is the base (optionally schema-qualified) name; group names are appended to it.
    pub fn new(store: S, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            input_file: String::new(),
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            truncate: false,
            notifier: None,
            active: None,
            report: LoadReport::default(),
        }
    }

    /// Input file name reported in notifications.
    pub fn with_input_file(mut self, input_file: impl Into<String>) -> Self {
        self.input_file = input_file.into();
        self
    }

    /// Rows per insert call. Values below 1 are treated as 1.
    pub fn with_insert_batch_size(mut self, size: usize) -> Self {
        self.insert_batch_size = size.max(1);
        self
    }

    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ImportNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn into_report(self) -> LoadReport {
        self.report
    }

    async fn open_table(&mut self, event: &IngestEvent) -> IngestionResult<ActiveTable> {
        let final_table = final_table_name(&self.table, &event.group);
        let suffix = Local::now().format(TIMESTAMP_SUFFIX_FORMAT).to_string();
        let tmp_table = self
            .store
            .create_temp_table(&final_table, &event.columns, &event.table_config, &suffix, Some(event.kind))
            .await?;
        debug!(table = %final_table, tmp_table = %tmp_table, "created temp table");
        Ok(ActiveTable {
            group: event.group.clone(),
            final_table,
            tmp_table,
            inserted: 0,
            empty_rows: 0,
            skipped_rows: 0,
            started: Instant::now(),
        })
    }

    async fn finish_table(&mut self, table: ActiveTable) -> IngestionResult<()> {
        self.store
            .swap_tables(&table.tmp_table, &table.final_table, self.truncate)
            .await?;

        let load = TableLoad {
            input_file: self.input_file.clone(),
            table_name: table.final_table.clone(),
            total_rows: table.inserted + table.empty_rows + table.skipped_rows,
            valid_rows: table.inserted,
            empty_rows: table.empty_rows,
            skipped_rows: table.skipped_rows,
            duration: format!("{:.2}", table.started.elapsed().as_secs_f64()),
            sheet_name: table.group,
        };
        let message = format!("Successfully imported {} rows into {}", load.valid_rows, load.table_name);
        info!(
            table = %load.table_name,
            rows = load.valid_rows,
            truncate = self.truncate,
            "{message}"
        );

        if let Some(notifier) = &self.notifier {
            let summary = serde_json::to_value(&load)?;
            notify_best_effort(notifier.as_ref(), &Notification::new(IngestionSeverity::Info, message, summary))
                .await;
        }
        self.report.tables.push(load);
        Ok(())
    }
}

#[async_trait]
impl<S: TableStore> IngestEventHandler for LoadOrchestrator<S> {
    async fn handle(&mut self, event: IngestEvent) -> IngestionResult<()> {
        let mut table = match self.active.take() {
            Some(table) if table.group == event.group => table,
            _ => self.open_table(&event).await?,
        };

        for chunk in event.rows.chunks(self.insert_batch_size) {
            self.store
                .insert_batch(&table.tmp_table, &event.columns, &event.table_config, chunk)
                .await?;
            table.inserted += chunk.len() as u64;
        }
        table.empty_rows += event.summary.empty_rows;
        table.skipped_rows += event.summary.skipped_rows;
        debug!(
            table = %table.tmp_table,
            kind = %event.kind,
            rows = event.row_count(),
            inserted = table.inserted,
            "inserted batch"
        );

        if event.kind == EventKind::Swap {
            self.finish_table(table).await
        } else {
            self.active = Some(table);
            Ok(())
        }
    }
}
