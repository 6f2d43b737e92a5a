//! Schema derivation: field names of a sample record plus an optional override document
//! become an ordered [`TableSchema`].
//!
//! The override document is a JSON object keyed by source field name:
//!
//! ```json
//! {
//!   "created": { "fieldType": "timestamp", "needIndex": true },
//!   "amount":  { "fieldType": "number", "notNull": true },
//!   "notes":   { "skip": true }
//! }
//! ```
//!
//! Overrides are applied field by field on top of the documented defaults. Keys that are not
//! part of [`ColumnOverride`] are kept but otherwise ignored; a warning is logged once when the
//! document is loaded.
//!
//! ```rust
//! use tabular_loader::table_config::{derive_table_config, TableConfigOverrides};
//!
//! let overrides = TableConfigOverrides::from_json_str(
//!     r#"{"a": {"sqlColumn": "value"}, "b": {"sqlColumn": "value"}}"#,
//! ).unwrap();
//! let schema = derive_table_config(["sheet", "a", "b"], Some("sheet"), &overrides);
//! assert_eq!(schema.output_names(), vec!["value_1", "value_2"]);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{IngestionError, IngestionResult};
use crate::types::{ColumnConfig, FieldType, TableSchema};

/// Field that names the group of a record in line- and row-oriented sources. Sources that group
/// by position (workbook sheets) treat it as an ordinary column.
pub const GROUP_FIELD: &str = "sheet";

/// Partial column configuration from the override document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnOverride {
    pub sql_column: Option<String>,
    pub field_type: Option<FieldType>,
    pub primary: Option<bool>,
    pub not_null: Option<bool>,
    pub need_index: Option<bool>,
    pub is_hyperlink: Option<bool>,
    pub skip: Option<bool>,
    /// Keys this crate does not understand.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl ColumnOverride {
    /// Overlay every field that is present onto `base`.
    pub fn apply(&self, base: &mut ColumnConfig) {
        if let Some(v) = &self.sql_column {
            base.sql_column = v.clone();
        }
        if let Some(v) = self.field_type {
            base.field_type = v;
        }
        if let Some(v) = self.primary {
            base.primary = v;
        }
        if let Some(v) = self.not_null {
            base.not_null = v;
        }
        if let Some(v) = self.need_index {
            base.need_index = v;
        }
        if let Some(v) = self.is_hyperlink {
            base.is_hyperlink = v;
        }
        if let Some(v) = self.skip {
            base.skip = v;
        }
    }
}

/// Per-field overrides keyed by source field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableConfigOverrides {
    columns: BTreeMap<String, ColumnOverride>,
}

impl TableConfigOverrides {
    /// No overrides at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse an override document.
    ///
    /// The document must be a JSON object whose values are objects. A wrong value type for a
    /// known key or an unknown `fieldType` is a malformed document.
    pub fn from_json_str(input: &str) -> IngestionResult<Self> {
        let doc: serde_json::Value =
            serde_json::from_str(input).map_err(|e| IngestionError::InvalidTableConfig {
                message: e.to_string(),
            })?;
        let serde_json::Value::Object(entries) = doc else {
            return Err(IngestionError::InvalidTableConfig {
                message: "table config must be a json object keyed by field name".to_string(),
            });
        };

        let mut columns = BTreeMap::new();
        for (field, raw) in entries {
            let column: ColumnOverride =
                serde_json::from_value(raw).map_err(|e| IngestionError::InvalidTableConfig {
                    message: format!("field '{field}': {e}"),
                })?;
            if !column.unknown.is_empty() {
                let keys: Vec<&str> = column.unknown.keys().map(String::as_str).collect();
                warn!(field = %field, keys = ?keys, "ignoring unknown table config keys");
            }
            columns.insert(field, column);
        }
        Ok(Self { columns })
    }

    /// Read and parse an override document from disk. Parse errors name the file.
    pub fn from_path(path: impl AsRef<Path>) -> IngestionResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text).map_err(|e| match e {
            IngestionError::InvalidTableConfig { message } => IngestionError::InvalidTableConfig {
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })
    }

    /// Load overrides from an optional path.
    ///
    /// No path, or a path that does not exist, yields empty overrides. A file that exists but
    /// cannot be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> IngestionResult<Self> {
        match path {
            None => Ok(Self::empty()),
            Some(p) if !p.exists() => {
                warn!(path = %p.display(), "table config not found, using defaults");
                Ok(Self::empty())
            }
            Some(p) => {
                let overrides = Self::from_path(p)?;
                debug!(path = %p.display(), fields = overrides.len(), "loaded table config");
                Ok(overrides)
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&ColumnOverride> {
        self.columns.get(field)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Derive the column configuration for a group from one sample record's field names.
///
/// - `group_field`, the source's structural field, is dropped entirely when given.
/// - Each remaining field starts from [`ColumnConfig::new`] and gets its override applied.
/// - Every non-skip `sql_column` that occurs more than once is suffixed `_1`, `_2`, ... in
///   derivation order, the first occurrence included. Skipped columns keep their name and do
///   not count towards collisions.
///
/// The result depends only on the inputs; deriving twice gives identical schemas.
pub fn derive_table_config<'a, I>(
    headers: I,
    group_field: Option<&str>,
    overrides: &TableConfigOverrides,
) -> TableSchema
where
    I: IntoIterator<Item = &'a str>,
{
    let mut columns: Vec<ColumnConfig> = headers
        .into_iter()
        .filter(|h| Some(*h) != group_field)
        .map(|header| {
            let mut column = ColumnConfig::new(header);
            if let Some(o) = overrides.get(header) {
                o.apply(&mut column);
            }
            if column.sql_column.is_empty() {
                column.sql_column = sanitize_column_name(&column.header);
            }
            column
        })
        .collect();

    resolve_duplicate_names(&mut columns);
    TableSchema::new(columns)
}

fn resolve_duplicate_names(columns: &mut [ColumnConfig]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for c in columns.iter().filter(|c| !c.skip) {
        *counts.entry(c.sql_column.clone()).or_insert(0) += 1;
    }

    // Names that stay as they are; generated suffixes must not collide with them.
    let mut taken: HashSet<String> = counts
        .iter()
        .filter(|(_, n)| **n == 1)
        .map(|(name, _)| name.clone())
        .collect();

    let mut seen: HashMap<String, usize> = HashMap::new();
    for c in columns.iter_mut().filter(|c| !c.skip) {
        if counts.get(&c.sql_column).copied().unwrap_or(0) <= 1 {
            continue;
        }
        let base = c.sql_column.clone();
        let n = seen.entry(base.clone()).or_insert(0);
        let mut candidate;
        loop {
            *n += 1;
            candidate = format!("{base}_{n}");
            if !taken.contains(&candidate) {
                break;
            }
        }
        taken.insert(candidate.clone());
        c.sql_column = candidate;
    }
}

/// Fallback column name for a header: lowercase, anything but `[a-z0-9_]` becomes `_`.
pub fn sanitize_column_name(header: &str) -> String {
    let out: String = header
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "column".to_string() } else { out }
}
