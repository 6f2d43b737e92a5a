//! In-process record source.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::IngestionResult;
use crate::table_config::GROUP_FIELD;
use crate::types::{RawRecord, SourceRecord};

use super::{group_of, RecordSource};

/// Serves records from memory in insertion order.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: VecDeque<SourceRecord>,
}

impl MemorySource {
    pub fn new(records: impl IntoIterator<Item = SourceRecord>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }

    /// Build from JSON objects, taking each record's group from its `sheet` field.
    ///
    /// # Panics
    ///
    /// Panics if a value is not a JSON object.
    pub fn from_json(values: impl IntoIterator<Item = serde_json::Value>) -> Self {
        Self::new(values.into_iter().map(|v| {
            let fields: RawRecord = match v {
                serde_json::Value::Object(map) => map,
                other => panic!("memory source records must be json objects, got {other}"),
            };
            SourceRecord::new(group_of(fields.get(GROUP_FIELD)), fields)
        }))
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
        Ok(self.records.pop_front())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
