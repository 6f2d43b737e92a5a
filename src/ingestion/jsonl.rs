//! Line-delimited JSON source.
//!
//! Each non-blank line is one JSON object. Blank lines are skipped silently. A line that is not
//! UTF-8, not JSON, or not an object is logged with its line number and content, counted as a
//! skipped row, and the stream continues.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error};

use crate::error::IngestionResult;
use crate::table_config::GROUP_FIELD;
use crate::types::SourceRecord;

use super::{group_of, RecordSource, RowTally};

/// Longest slice of a rejected line that is written to the log.
const LOGGED_LINE_LIMIT: usize = 512;

/// Reads one record per line from any buffered async reader.
pub struct JsonLinesSource<R> {
    reader: R,
    name: String,
    line_number: u64,
    buf: Vec<u8>,
    tally: RowTally,
}

impl JsonLinesSource<BufReader<File>> {
    /// Open a `.jsonl` / `.ndjson` file.
    pub async fn open(path: impl AsRef<Path>) -> IngestionResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        debug!(path = %path.display(), "reading jsonl file");
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            line_number: 0,
            buf: Vec::new(),
            tally: RowTally::default(),
        }
    }

    fn reject(&mut self, line: &str, message: &str) {
        self.tally.skipped_rows += 1;
        let shown: String = line.chars().take(LOGGED_LINE_LIMIT).collect();
        error!(
            source = %self.name,
            line = self.line_number,
            content = %shown,
            error = %message,
            "error processing jsonl line"
        );
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> RecordSource for JsonLinesSource<R> {
    async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let line = match std::str::from_utf8(&self.buf) {
                Ok(s) => s.trim_end_matches(['\n', '\r']).to_string(),
                Err(e) => {
                    let lossy = String::from_utf8_lossy(&self.buf).into_owned();
                    self.reject(lossy.trim_end(), &e.to_string());
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(serde_json::Value::Object(fields)) => {
                    let group = group_of(fields.get(GROUP_FIELD));
                    return Ok(Some(SourceRecord::new(group, fields)));
                }
                Ok(_) => self.reject(&line, "line is not a json object"),
                Err(e) => self.reject(&line, &e.to_string()),
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
