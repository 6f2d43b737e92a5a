//! Unified import entrypoint.
//!
//! Most callers should use [`run_import`], which loads one file into a [`TableStore`]:
//!
//! - If [`ImportOptions::format`] is `None`, the format is inferred from the file extension.
//! - The records are transformed by an [`EventSequencer`] and loaded by a [`LoadOrchestrator`].
//! - A failure is reported to the notifier before it is returned.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tabular_loader::ingestion::{run_import, ImportOptions, ImportRequest, LogNotifier};
//! use tabular_loader::load::PgTableStore;
//!
//! # async fn example() -> Result<(), tabular_loader::IngestionError> {
//! let store = PgTableStore::connect("postgres://localhost/warehouse", 4).await?;
//! let request = ImportRequest::new("exports/sales.jsonl", "public.sales", ImportOptions::default());
//! let report = run_import(&request, store, Arc::new(LogNotifier)).await?;
//! println!("rows={}", report.load.valid_rows());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono_tz::Tz;
use tracing::{error, info};

use crate::error::{IngestionError, IngestionResult};
use crate::load::{LoadOrchestrator, LoadReport, TableStore, DEFAULT_INSERT_BATCH_SIZE};
use crate::pipeline::{EventSequencer, RunSummary};
use crate::table_config::TableConfigOverrides;

use super::csv::CsvSource;
use super::jsonl::JsonLinesSource;
use super::notify::{notify_best_effort, ImportNotifier, Notification};
use super::RecordSource;

/// Supported input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    /// Line-delimited JSON objects.
    Jsonl,
    /// Comma-separated values with a header row.
    Csv,
    /// Spreadsheet/workbook formats (feature-gated behind `excel`).
    Excel,
}

impl ImportFormat {
    /// Parse a format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jsonl" | "ndjson" => Some(Self::Jsonl),
            "csv" => Some(Self::Csv),
            "xlsx" | "xls" | "xlsm" | "xlsb" | "ods" => Some(Self::Excel),
            _ => None,
        }
    }

    /// Infer the format of `path` from its extension.
    pub fn from_path(path: &Path) -> IngestionResult<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| IngestionError::UnsupportedFormat {
                message: format!("cannot infer format: path has no extension ({})", path.display()),
            })?;

        Self::from_extension(ext).ok_or_else(|| IngestionError::UnsupportedFormat {
            message: format!(
                "unsupported file type '.{ext}' ({}); supported: .jsonl, .ndjson, .csv, .xlsx, .xls, .xlsm, .xlsb, .ods",
                path.display()
            ),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImportFormat::Jsonl => "jsonl",
            ImportFormat::Csv => "csv",
            ImportFormat::Excel => "excel",
        }
    }
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an IANA time zone name.
pub fn parse_timezone(name: &str) -> IngestionResult<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| IngestionError::InvalidTimezone { zone: name.to_string() })
}

/// Open the record source for `path`.
pub async fn open_source(path: &Path, format: ImportFormat) -> IngestionResult<Box<dyn RecordSource>> {
    let name = path.display().to_string();
    let source: Box<dyn RecordSource> = match format {
        ImportFormat::Jsonl => Box::new(
            JsonLinesSource::open(path)
                .await
                .map_err(|e| IngestionError::in_source(&name, e))?,
        ),
        ImportFormat::Csv => Box::new(CsvSource::open(path).map_err(|e| IngestionError::in_source(&name, e))?),
        ImportFormat::Excel => open_excel(path).map_err(|e| IngestionError::in_source(&name, e))?,
    };
    Ok(source)
}

#[cfg(feature = "excel")]
fn open_excel(path: &Path) -> IngestionResult<Box<dyn RecordSource>> {
    Ok(Box::new(super::excel::ExcelSource::open(path)?))
}

#[cfg(not(feature = "excel"))]
fn open_excel(_path: &Path) -> IngestionResult<Box<dyn RecordSource>> {
    Err(IngestionError::UnsupportedFormat {
        message: "excel ingestion not enabled (enable cargo feature 'excel')".to_string(),
    })
}

/// Options controlling an import.
///
/// Use [`Default`] for common cases.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// If `None`, auto-detect format from file extension.
    pub format: Option<ImportFormat>,
    /// Zone in which timestamp text is interpreted.
    pub timezone: Tz,
    /// Per-field column overrides.
    pub overrides: Arc<TableConfigOverrides>,
    /// Rows per insert statement batch.
    pub insert_batch_size: usize,
    /// Replace (`true`) or merge into (`false`) existing tables.
    pub truncate: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            format: None,
            timezone: chrono_tz::UTC,
            overrides: Arc::new(TableConfigOverrides::empty()),
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            truncate: false,
        }
    }
}

/// One file to import into one base table.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub path: PathBuf,
    /// Base table name, optionally schema-qualified. Group names are appended to it.
    pub table: String,
    pub options: ImportOptions,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>, options: ImportOptions) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
            options,
        }
    }

    /// File name reported in notifications.
    pub fn input_file(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Execute the request by calling [`run_import`].
    pub async fn run<S: TableStore>(&self, store: S, notifier: Arc<dyn ImportNotifier>) -> IngestionResult<ImportReport> {
        run_import(self, store, notifier).await
    }
}

/// Outcome of a successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub format: ImportFormat,
    pub run: RunSummary,
    pub load: LoadReport,
}

/// Import `request.path` into `store`.
///
/// Success notifications are sent per loaded table; on failure a failure notification (with the
/// computed severity) is sent before the error is returned. Notification delivery problems are
/// logged and never change the outcome.
pub async fn run_import<S: TableStore>(
    request: &ImportRequest,
    store: S,
    notifier: Arc<dyn ImportNotifier>,
) -> IngestionResult<ImportReport> {
    let result = execute(request, store, Arc::clone(&notifier)).await;
    if let Err(e) = &result {
        error!(path = %request.path.display(), error = %e, "import failed");
        notify_best_effort(notifier.as_ref(), &Notification::failure(&request.input_file(), e)).await;
    }
    result
}

async fn execute<S: TableStore>(
    request: &ImportRequest,
    store: S,
    notifier: Arc<dyn ImportNotifier>,
) -> IngestionResult<ImportReport> {
    let options = &request.options;
    let format = match options.format {
        Some(f) => f,
        None => ImportFormat::from_path(&request.path)?,
    };
    info!(
        path = %request.path.display(),
        %format,
        table = %request.table,
        timezone = %options.timezone,
        batch_size = options.insert_batch_size,
        truncate = options.truncate,
        "starting import"
    );

    let source = open_source(&request.path, format).await?;
    let sequencer = EventSequencer::new(source, Arc::clone(&options.overrides), options.timezone);
    let mut loader = LoadOrchestrator::new(store, request.table.clone())
        .with_input_file(request.input_file())
        .with_insert_batch_size(options.insert_batch_size)
        .with_truncate(options.truncate)
        .with_notifier(notifier);

    let run = sequencer.drive(&mut loader).await?;
    let load = loader.into_report();
    info!(
        groups = run.groups,
        rows = run.rows,
        skipped_rows = run.skipped_rows,
        empty_rows = run.empty_rows,
        "import complete"
    );
    Ok(ImportReport { format, run, load })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{parse_timezone, ImportFormat, ImportRequest, ImportOptions};
    use crate::error::IngestionError;

    #[test]
    fn formats_are_inferred_from_extensions() {
        assert_eq!(ImportFormat::from_extension("JSONL"), Some(ImportFormat::Jsonl));
        assert_eq!(ImportFormat::from_extension("ndjson"), Some(ImportFormat::Jsonl));
        assert_eq!(ImportFormat::from_extension("csv"), Some(ImportFormat::Csv));
        assert_eq!(ImportFormat::from_extension("xlsx"), Some(ImportFormat::Excel));
        assert_eq!(ImportFormat::from_extension("parquet"), None);

        let err = ImportFormat::from_path(Path::new("data/input")).unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedFormat { .. }));
        let err = ImportFormat::from_path(Path::new("data/input.txt")).unwrap_err();
        assert!(err.to_string().contains(".txt"));
    }

    #[test]
    fn timezones_are_validated() {
        assert_eq!(parse_timezone("Asia/Kolkata").unwrap(), chrono_tz::Asia::Kolkata);
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(IngestionError::InvalidTimezone { zone }) if zone == "Mars/Olympus"
        ));
    }

    #[test]
    fn input_file_is_the_base_name() {
        let req = ImportRequest::new("/tmp/exports/sales.jsonl", "t", ImportOptions::default());
        assert_eq!(req.input_file(), "sales.jsonl");
    }
}
