//! CSV source.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{IngestionError, IngestionResult};
use crate::table_config::GROUP_FIELD;
use crate::types::{RawRecord, SourceRecord};

use super::{group_of, RecordSource, RowTally};

/// Reads one record per CSV row.
///
/// Rules:
///
/// - The first row is the header row.
/// - Rows may be shorter or longer than the header; missing cells are null, extra cells dropped.
/// - Empty cells become null.
/// - A `sheet` column, when present, names the group; otherwise every row is in the default group.
/// - A row the reader cannot decode (e.g. invalid UTF-8) is logged and skipped. I/O errors are
///   returned.
pub struct CsvSource<R: std::io::Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    name: String,
    record: csv::StringRecord,
    tally: RowTally,
}

impl CsvSource<std::fs::File> {
    pub fn open(path: impl AsRef<Path>) -> IngestionResult<Self> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        debug!(path = %path.display(), "reading csv file");
        Self::from_reader(reader, path.display().to_string())
    }
}

impl<R: std::io::Read> CsvSource<R> {
    /// Build a source from an existing reader. The reader must be configured with headers.
    pub fn from_reader(mut reader: csv::Reader<R>, name: impl Into<String>) -> IngestionResult<Self> {
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self {
            reader,
            headers,
            name: name.into(),
            record: csv::StringRecord::new(),
            tally: RowTally::default(),
        })
    }

    fn build_record(&self) -> RawRecord {
        let mut fields = RawRecord::new();
        for (idx, header) in self.headers.iter().enumerate() {
            let value = match self.record.get(idx) {
                Some(cell) if !cell.trim().is_empty() => serde_json::Value::String(cell.to_string()),
                _ => serde_json::Value::Null,
            };
            fields.insert(header.clone(), value);
        }
        fields
    }
}

#[async_trait]
impl<R: std::io::Read + Send> RecordSource for CsvSource<R> {
    async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => return Ok(None),
                Ok(true) => {
                    let fields = self.build_record();
                    let group = group_of(fields.get(GROUP_FIELD));
                    return Ok(Some(SourceRecord::new(group, fields)));
                }
                Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => {
                    return Err(IngestionError::Csv(e));
                }
                Err(e) => {
                    self.tally.skipped_rows += 1;
                    let line = e.position().map(|p| p.line()).unwrap_or_default();
                    error!(source = %self.name, line, error = %e, "error processing csv row");
                }
            }
        }
    }

    fn tally(&self) -> RowTally {
        self.tally
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
