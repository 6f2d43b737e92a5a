#![cfg(feature = "excel")]

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use tracing::debug;

use crate::error::IngestionResult;
use crate::types::{RawRecord, SourceRecord};

use super::{RecordSource, RowTally};

/// Multi-group source over every sheet of a workbook (`.xlsx`, `.xls`, `.ods`, etc.).
///
/// Behavior:
/// - Sheets are visited in workbook order; only the current sheet is held in memory
/// - Each sheet's group identifier is `sheet<n>`, `n` being its 1-based workbook position
/// - The first non-empty row of a sheet is its header row; a sheet without one yields nothing
/// - Empty header cells are named `column_<n>`; repeated header text is suffixed `_1`, `_2`, ...
/// - Rows with every cell empty are dropped and counted as empty rows
/// - A column headed `sheet` is ordinary data; it does not name the group
pub struct ExcelSource {
    workbook: Sheets<BufReader<File>>,
    sheet_names: Vec<String>,
    next_sheet: usize,
    current: Option<SheetCursor>,
    name: String,
    tally: RowTally,
}

struct SheetCursor {
    group: String,
    range: Range<Data>,
    headers: Vec<String>,
    next_row: usize,
}

impl ExcelSource {
    pub fn open(path: impl AsRef<Path>) -> IngestionResult<Self> {
        let path = path.as_ref();
        let workbook = open_workbook_auto(path)?;
        let sheet_names = workbook.sheet_names().to_vec();
        debug!(path = %path.display(), sheets = sheet_names.len(), "opened workbook");
        Ok(Self {
            workbook,
            sheet_names,
            next_sheet: 0,
            current: None,
            name: path.display().to_string(),
            tally: RowTally::default(),
        })
    }

    /// Load the next sheet that has a header row. Returns `false` when no sheets remain.
    fn advance_sheet(&mut self) -> IngestionResult<bool> {
        while self.next_sheet < self.sheet_names.len() {
            let idx = self.next_sheet;
            self.next_sheet += 1;
            let sheet = &self.sheet_names[idx];
            let range = self.workbook.worksheet_range(sheet)?;

            match find_header_row(&range) {
                Some((header_idx, headers)) => {
                    debug!(sheet = %sheet, rows = range.height(), "reading sheet");
                    self.current = Some(SheetCursor {
                        group: format!("sheet{}", idx + 1),
                        range,
                        headers,
                        next_row: header_idx + 1,
                    });
                    return Ok(true);
                }
                None => debug!(sheet = %sheet, "sheet has no header row, skipping"),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl RecordSource for ExcelSource {
    async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
        loop {
            if self.current.is_none() && !self.advance_sheet()? {
                return Ok(None);
            }
            let Some(cursor) = self.current.as_mut() else {
                continue;
            };

            while cursor.next_row < cursor.range.height() {
                let row = cursor.next_row;
                cursor.next_row += 1;

                let mut fields = RawRecord::new();
                let mut any_value = false;
                for (col, header) in cursor.headers.iter().enumerate() {
                    let value = cursor
                        .range
                        .get((row, col))
                        .map(cell_to_json)
                        .unwrap_or(serde_json::Value::Null);
                    any_value |= !value.is_null();
                    fields.insert(header.clone(), value);
                }

                if !any_value {
                    self.tally.empty_rows += 1;
                    continue;
                }
                return Ok(Some(SourceRecord::new(cursor.group.clone(), fields)));
            }

            self.current = None;
        }
    }

    fn tally(&self) -> RowTally {
        self.tally
    }

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn group_field(&self) -> Option<&str> {
        None
    }
}

fn find_header_row(range: &Range<Data>) -> Option<(usize, Vec<String>)> {
    let (idx, row) = range
        .rows()
        .enumerate()
        .find(|(_, row)| row.iter().any(|c| !matches!(c, Data::Empty)))?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut headers = Vec::with_capacity(row.len());
    for (col, cell) in row.iter().enumerate() {
        let text = cell_to_header_string(cell).trim().to_string();
        let base = if text.is_empty() {
            format!("column_{}", col + 1)
        } else {
            text
        };
        let mut name = base.clone();
        let mut n = 0;
        while seen.contains(&name) {
            n += 1;
            name = format!("{base}_{n}");
        }
        seen.insert(name.clone());
        headers.push(name);
    }
    Some((idx, headers))
}

fn cell_to_header_string(c: &Data) -> String {
    match c {
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(d) => d.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{e:?}"),
        Data::Empty => String::new(),
    }
}

/// Cell value as the JSON value the transformer expects. Date cells become
/// `YYYY-MM-DD HH:MM:SS` text so timestamp columns can parse them.
fn cell_to_json(c: &Data) -> serde_json::Value {
    match c {
        Data::String(s) if s.trim().is_empty() => serde_json::Value::Null,
        Data::String(s) => serde_json::Value::String(s.clone()),
        Data::Int(i) => serde_json::Value::from(*i),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Data::Bool(b) => serde_json::Value::Bool(*b),
        Data::DateTime(d) => match d.as_datetime() {
            Some(dt) => serde_json::Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => serde_json::Value::String(d.to_string()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => serde_json::Value::String(s.clone()),
        Data::Error(_) | Data::Empty => serde_json::Value::Null,
    }
}
