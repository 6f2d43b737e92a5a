//! Core data model shared by the transform pipeline and the loaders.
//!
//! A source produces [`SourceRecord`]s, the schema deriver turns the first record of a group
//! into a [`TableSchema`], the transformer turns each record into a [`TransformedRow`], and the
//! sequencer hands batches of rows to the loader as [`IngestEvent`]s.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw record as decoded from the source: field name to raw value, in source order.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A record tagged with the group (sheet / table segment) it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Group identifier. The empty string is the unnamed default group.
    pub group: String,
    /// Field values in source order.
    pub fields: RawRecord,
}

impl SourceRecord {
    pub fn new(group: impl Into<String>, fields: RawRecord) -> Self {
        Self {
            group: group.into(),
            fields,
        }
    }
}

/// Output type of a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Raw values pass through unchanged.
    #[default]
    String,
    /// Values are coerced to `f64`; unparseable input becomes NaN.
    Number,
    /// Values are parsed as `YYYY-MM-DD HH:mm` local time in the configured zone.
    Timestamp,
}

/// Configuration for one logical output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnConfig {
    /// Field name as seen in the source record.
    pub header: String,
    /// Resolved output column name.
    pub sql_column: String,
    pub field_type: FieldType,
    pub primary: bool,
    pub not_null: bool,
    pub need_index: bool,
    pub is_hyperlink: bool,
    /// Skipped columns are transformed but never emitted or loaded.
    pub skip: bool,
}

impl ColumnConfig {
    /// Base config for `header` with every flag at its default.
    pub fn new(header: impl Into<String>) -> Self {
        let header = header.into();
        Self {
            sql_column: header.clone(),
            header,
            field_type: FieldType::String,
            primary: false,
            not_null: false,
            need_index: false,
            is_hyperlink: true,
            skip: false,
        }
    }
}

/// The ordered column configuration of one group. Immutable once derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    /// All columns in derivation order, including skipped ones.
    pub columns: Vec<ColumnConfig>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnConfig>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Columns that are emitted and loaded, in schema order.
    pub fn output_columns(&self) -> impl Iterator<Item = &ColumnConfig> {
        self.columns.iter().filter(|c| !c.skip)
    }

    /// Resolved `sql_column` names of the emitted columns, in schema order.
    pub fn output_names(&self) -> Vec<String> {
        self.output_columns().map(|c| c.sql_column.clone()).collect()
    }

    /// Drop the positions of skipped columns from a full-width row.
    pub fn project(&self, row: TransformedRow) -> TransformedRow {
        if self.columns.iter().all(|c| !c.skip) {
            return row;
        }
        row.into_iter()
            .zip(self.columns.iter())
            .filter(|(_, c)| !c.skip)
            .map(|(v, _)| v)
            .collect()
    }
}

/// A single transformed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value.
    Null,
    /// Raw source value passed through unchanged (string columns).
    Raw(serde_json::Value),
    /// Coerced number. May be NaN when the raw value was not numeric.
    Number(f64),
    /// Parsed instant.
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Text rendering used for text columns: strings as-is, other JSON values as JSON text.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Raw(serde_json::Value::String(s)) => Some(s.clone()),
            Value::Raw(other) => Some(other.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Raw(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// One output row, one [`Value`] per schema position.
pub type TransformedRow = Vec<Value>;

/// Lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// First flush of a group.
    Create,
    /// Subsequent flush of a group.
    Insert,
    /// Terminal flush of a group; the loader finalizes the table.
    Swap,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Insert => "insert",
            EventKind::Swap => "swap",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters reported with every flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushSummary {
    /// Rows in this flush.
    pub total_rows: u64,
    /// Rows in this flush that were transformed.
    pub processed_rows: u64,
    /// Records the source rejected since the previous flush of this group.
    pub skipped_rows: u64,
    /// Blank rows the source dropped since the previous flush of this group.
    pub empty_rows: u64,
    /// Human readable time since the accumulation window started.
    pub elapsed: String,
    /// Running total of rows accumulated for the group, including this flush.
    pub total: Option<u64>,
}

/// A flushed batch plus everything the loader needs to place it.
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub kind: EventKind,
    /// Group identifier the batch belongs to.
    pub group: String,
    /// Resolved non-skip column names in schema order.
    pub columns: Vec<String>,
    /// Rows with skipped columns already removed.
    pub rows: Vec<TransformedRow>,
    /// Full column configuration (skipped columns included) for DDL.
    pub table_config: Arc<TableSchema>,
    pub summary: FlushSummary,
}

impl IngestEvent {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnConfig, FieldType, TableSchema, Value};

    #[test]
    fn column_defaults_match_documented_values() {
        let c = ColumnConfig::new("amount");
        assert_eq!(c.sql_column, "amount");
        assert_eq!(c.field_type, FieldType::String);
        assert!(!c.primary && !c.not_null && !c.need_index && !c.skip);
        assert!(c.is_hyperlink);
    }

    #[test]
    fn project_removes_skipped_positions() {
        let mut hidden = ColumnConfig::new("b");
        hidden.skip = true;
        let schema = TableSchema::new(vec![ColumnConfig::new("a"), hidden, ColumnConfig::new("c")]);

        let row = vec![Value::Number(1.0), Value::Null, Value::Number(3.0)];
        assert_eq!(schema.project(row), vec![Value::Number(1.0), Value::Number(3.0)]);
        assert_eq!(schema.output_names(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn raw_values_render_as_text() {
        assert_eq!(Value::Raw(serde_json::json!("x")).as_text().as_deref(), Some("x"));
        assert_eq!(Value::Raw(serde_json::json!(12)).as_text().as_deref(), Some("12"));
        assert_eq!(Value::Null.as_text(), None);
    }
}
