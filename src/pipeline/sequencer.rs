//! The event sequencer: drives a [`RecordSource`] through schema derivation and value
//! transformation and turns the row stream into [`IngestEvent`]s.
//!
//! The sequencer is pull-based. [`EventSequencer::next_event`] reads records only until the next
//! event is ready, so at most one batch is in memory and the consumer's pace bounds the read
//! pace. Flushes are decided per incoming record, in this order:
//!
//! 1. the record belongs to a different group than the active one: the active group is finalized
//!    with a `swap` event before the record is looked at any further;
//! 2. the batch already holds the flush threshold: `create` for a group's first flush, `insert`
//!    afterwards;
//! 3. the source is exhausted: the active group is finalized with a `swap` event.
//!
//! In cases 1 and 2 the record is held back and processed on the next call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use tracing::{debug, error, info, trace};

use crate::error::{IngestionError, IngestionResult};
use crate::ingestion::{RecordSource, RowTally};
use crate::table_config::{derive_table_config, TableConfigOverrides};
use crate::types::{EventKind, FlushSummary, IngestEvent, SourceRecord, TableSchema};

use super::batch::{format_elapsed, BatchAccumulator, FLUSH_THRESHOLD};
use super::transform::transform_record;

/// Consumer of lifecycle events. Each call is awaited before the sequencer reads further.
#[async_trait]
pub trait IngestEventHandler: Send {
    async fn handle(&mut self, event: IngestEvent) -> IngestionResult<()>;
}

/// Totals for a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Groups that received at least one record.
    pub groups: u64,
    /// Records transformed.
    pub rows: u64,
    /// Events emitted.
    pub events: u64,
    pub skipped_rows: u64,
    pub empty_rows: u64,
}

/// The active group: its schema and counters.
#[derive(Debug)]
struct GroupState {
    name: String,
    schema: Arc<TableSchema>,
    /// Rows accumulated for the group so far, flushed or not.
    row_count: u64,
    flushes: u64,
    /// Set once the group's `swap` has been emitted.
    finalized: bool,
}

#[derive(Debug)]
enum State {
    AwaitingFirstRecord,
    Accumulating(GroupState),
    Drained,
    Aborted,
}

/// Turns a record stream into create / insert / swap events.
pub struct EventSequencer<S> {
    source: S,
    overrides: Arc<TableConfigOverrides>,
    timezone: Tz,
    batch: BatchAccumulator,
    state: State,
    pending: Option<SourceRecord>,
    tally_mark: RowTally,
    groups: u64,
    rows: u64,
    events: u64,
}

impl<S: RecordSource> EventSequencer<S> {
    pub fn new(source: S, overrides: Arc<TableConfigOverrides>, timezone: Tz) -> Self {
        Self {
            source,
            overrides,
            timezone,
            batch: BatchAccumulator::new(FLUSH_THRESHOLD),
            state: State::AwaitingFirstRecord,
            pending: None,
            tally_mark: RowTally::default(),
            groups: 0,
            rows: 0,
            events: 0,
        }
    }

    /// Replace the flush threshold (default [`FLUSH_THRESHOLD`]).
    ///
    /// # Panics
    ///
    /// Panics if `threshold == 0`.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.batch = BatchAccumulator::new(threshold);
        self
    }

    /// Produce the next event.
    ///
    /// Returns `Ok(None)` once the final `swap` has been produced; that is the completion signal.
    /// A source error is fatal: it is returned wrapped with the source identity, and every later
    /// call returns [`IngestionError::RunAborted`].
    pub async fn next_event(&mut self) -> IngestionResult<Option<IngestEvent>> {
        loop {
            match self.state {
                State::Drained => return Ok(None),
                State::Aborted => return Err(IngestionError::RunAborted),
                State::AwaitingFirstRecord | State::Accumulating(_) => {}
            }

            let next = match self.pending.take() {
                Some(record) => Some(record),
                None => match self.source.next_record().await {
                    Ok(record) => record,
                    Err(e) => {
                        self.state = State::Aborted;
                        let err = IngestionError::in_source(self.source.describe(), e);
                        error!(error = %err, "aborting ingestion run");
                        return Err(err);
                    }
                },
            };

            let event = match next {
                Some(record) => self.accept(record),
                None => self.drain(),
            };
            if let Some(event) = event {
                self.events += 1;
                return Ok(Some(event));
            }
        }
    }

    /// Push every event into `handler`, one at a time, and return the run totals.
    ///
    /// The summary is returned only when the source was fully drained and every event handled.
    pub async fn drive<H>(mut self, handler: &mut H) -> IngestionResult<RunSummary>
    where
        H: IngestEventHandler + ?Sized,
    {
        while let Some(event) = self.next_event().await? {
            handler.handle(event).await?;
        }
        Ok(self.summary())
    }

    /// Totals so far.
    pub fn summary(&self) -> RunSummary {
        let tally = self.source.tally();
        RunSummary {
            groups: self.groups,
            rows: self.rows,
            events: self.events,
            skipped_rows: tally.skipped_rows,
            empty_rows: tally.empty_rows,
        }
    }

    fn accept(&mut self, record: SourceRecord) -> Option<IngestEvent> {
        let mut group = match std::mem::replace(&mut self.state, State::Drained) {
            State::Accumulating(group) if !group.finalized => group,
            _ => {
                let mut group = self.begin_group(&record);
                self.push_record(&mut group, &record);
                self.state = State::Accumulating(group);
                return None;
            }
        };

        let event = if group.name != record.group {
            let event = self.flush(&mut group, EventKind::Swap);
            group.finalized = true;
            self.pending = Some(record);
            Some(event)
        } else if self.batch.is_full() {
            let kind = if group.flushes == 0 {
                EventKind::Create
            } else {
                EventKind::Insert
            };
            let event = self.flush(&mut group, kind);
            self.pending = Some(record);
            Some(event)
        } else {
            self.push_record(&mut group, &record);
            None
        };

        self.state = State::Accumulating(group);
        event
    }

    fn drain(&mut self) -> Option<IngestEvent> {
        match std::mem::replace(&mut self.state, State::Drained) {
            State::Accumulating(mut group) if !group.finalized => {
                let event = self.flush(&mut group, EventKind::Swap);
                info!(
                    source = %self.source.describe(),
                    groups = self.groups,
                    rows = self.rows,
                    "source drained"
                );
                Some(event)
            }
            _ => {
                info!(source = %self.source.describe(), "source contained no records");
                None
            }
        }
    }

    fn begin_group(&mut self, record: &SourceRecord) -> GroupState {
        let schema = derive_table_config(
            record.fields.keys().map(String::as_str),
            self.source.group_field(),
            &self.overrides,
        );
        debug!(
            group = %record.group,
            columns = ?schema.output_names(),
            "derived table config"
        );
        self.groups += 1;
        self.batch.restart_window();
        GroupState {
            name: record.group.clone(),
            schema: Arc::new(schema),
            row_count: 0,
            flushes: 0,
            finalized: false,
        }
    }

    fn push_record(&mut self, group: &mut GroupState, record: &SourceRecord) {
        let row = transform_record(&record.fields, &group.schema, self.timezone);
        self.batch.push(row);
        group.row_count += 1;
        self.rows += 1;
        trace!(group = %group.name, row = group.row_count, "transformed record");
    }

    fn flush(&mut self, group: &mut GroupState, kind: EventKind) -> IngestEvent {
        let (rows, elapsed) = self.batch.take();
        let rows: Vec<_> = rows.into_iter().map(|r| group.schema.project(r)).collect();

        let tally = self.source.tally();
        let dropped = tally.since(self.tally_mark);
        self.tally_mark = tally;
        group.flushes += 1;

        let count = rows.len() as u64;
        let elapsed = format_elapsed(elapsed);
        info!(
            group = %group.name,
            kind = %kind,
            rows = count,
            total = group.row_count,
            elapsed = %elapsed,
            "flushing batch"
        );

        IngestEvent {
            kind,
            group: group.name.clone(),
            columns: group.schema.output_names(),
            rows,
            table_config: Arc::clone(&group.schema),
            summary: FlushSummary {
                total_rows: count,
                processed_rows: count,
                skipped_rows: dropped.skipped_rows,
                empty_rows: dropped.empty_rows,
                elapsed,
                total: Some(group.row_count),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{EventSequencer, IngestEventHandler};
    use crate::error::{IngestionError, IngestionResult};
    use crate::ingestion::memory::MemorySource;
    use crate::ingestion::{RecordSource, RowTally};
    use crate::table_config::TableConfigOverrides;
    use crate::types::{EventKind, IngestEvent, SourceRecord, Value};

    fn sequencer(records: Vec<serde_json::Value>, overrides: &str) -> EventSequencer<MemorySource> {
        let overrides = TableConfigOverrides::from_json_str(overrides).unwrap();
        EventSequencer::new(MemorySource::from_json(records), Arc::new(overrides), chrono_tz::UTC)
    }

    async fn all_events<S: RecordSource>(mut seq: EventSequencer<S>) -> Vec<IngestEvent> {
        let mut out = Vec::new();
        while let Some(ev) = seq.next_event().await.unwrap() {
            out.push(ev);
        }
        out
    }

    fn shape(events: &[IngestEvent]) -> Vec<(EventKind, String, usize)> {
        events
            .iter()
            .map(|e| (e.kind, e.group.clone(), e.row_count()))
            .collect()
    }

    #[tokio::test]
    async fn single_group_emits_one_swap_with_coerced_rows() {
        let seq = sequencer(
            vec![json!({"sheet": "A", "x": "1"}), json!({"sheet": "A", "x": "2"})],
            r#"{"x": {"fieldType": "number"}}"#,
        );
        let events = all_events(seq).await;
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.kind, EventKind::Swap);
        assert_eq!(ev.group, "A");
        assert_eq!(ev.columns, vec!["x".to_string()]);
        assert_eq!(ev.rows, vec![vec![Value::Number(1.0)], vec![Value::Number(2.0)]]);
        assert_eq!(ev.summary.total_rows, 2);
        assert_eq!(ev.summary.skipped_rows, 0);
        assert_eq!(ev.summary.empty_rows, 0);
    }

    #[tokio::test]
    async fn threshold_plus_one_emits_create_then_swap() {
        let records: Vec<_> = (0..50_001).map(|i| json!({"sheet": "A", "n": i})).collect();
        let events = all_events(sequencer(records, "{}")).await;
        assert_eq!(
            shape(&events),
            vec![
                (EventKind::Create, "A".to_string(), 50_000),
                (EventKind::Swap, "A".to_string(), 1),
            ]
        );
        assert_eq!(events[0].summary.total, Some(50_000));
        assert_eq!(events[1].summary.total, Some(50_001));
        assert_eq!(events[1].rows[0], vec![Value::Raw(json!(50_000))]);
    }

    #[tokio::test]
    async fn exactly_threshold_rows_emit_only_swap() {
        let records: Vec<_> = (0..4).map(|i| json!({"n": i})).collect();
        let seq = sequencer(records, "{}").with_flush_threshold(4);
        let events = all_events(seq).await;
        assert_eq!(shape(&events), vec![(EventKind::Swap, String::new(), 4)]);
    }

    #[tokio::test]
    async fn later_flushes_are_inserts() {
        let records: Vec<_> = (0..5).map(|i| json!({"sheet": "A", "n": i})).collect();
        let seq = sequencer(records, "{}").with_flush_threshold(2);
        let events = all_events(seq).await;
        assert_eq!(
            shape(&events),
            vec![
                (EventKind::Create, "A".to_string(), 2),
                (EventKind::Insert, "A".to_string(), 2),
                (EventKind::Swap, "A".to_string(), 1),
            ]
        );
        let totals: Vec<_> = events.iter().map(|e| e.summary.total).collect();
        assert_eq!(totals, vec![Some(2), Some(4), Some(5)]);

        let all: Vec<Value> = events.iter().flat_map(|e| e.rows.iter().map(|r| r[0].clone())).collect();
        let expected: Vec<Value> = (0..5).map(|i| Value::Raw(json!(i))).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn group_change_finalizes_previous_group() {
        let seq = sequencer(
            vec![
                json!({"sheet": "A", "x": "1"}),
                json!({"sheet": "A", "x": "2"}),
                json!({"sheet": "B", "y": "3"}),
            ],
            "{}",
        );
        let events = all_events(seq).await;
        assert_eq!(
            shape(&events),
            vec![
                (EventKind::Swap, "A".to_string(), 2),
                (EventKind::Swap, "B".to_string(), 1),
            ]
        );
        assert_eq!(events[0].columns, vec!["x".to_string()]);
        assert_eq!(events[1].columns, vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn full_batch_at_group_change_goes_into_the_swap() {
        let mut records: Vec<_> = (0..2).map(|i| json!({"sheet": "A", "n": i})).collect();
        records.push(json!({"sheet": "B", "n": 9}));
        let seq = sequencer(records, "{}").with_flush_threshold(2);
        let events = all_events(seq).await;
        assert_eq!(
            shape(&events),
            vec![
                (EventKind::Swap, "A".to_string(), 2),
                (EventKind::Swap, "B".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn returning_group_is_a_new_segment() {
        let seq = sequencer(
            vec![json!({"sheet": "A"}), json!({"sheet": "B"}), json!({"sheet": "A"})],
            "{}",
        );
        let groups: Vec<String> = all_events(seq).await.into_iter().map(|e| e.group).collect();
        assert_eq!(groups, vec!["A", "B", "A"]);
    }

    #[tokio::test]
    async fn skipped_columns_stay_in_table_config_only() {
        let seq = sequencer(
            vec![json!({"a": "1", "b": "2", "c": "3"})],
            r#"{"b": {"skip": true}}"#,
        );
        let events = all_events(seq).await;
        let ev = &events[0];
        assert_eq!(ev.columns, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(ev.rows[0], vec![Value::Raw(json!("1")), Value::Raw(json!("3"))]);
        assert_eq!(ev.table_config.len(), 3);
    }

    #[tokio::test]
    async fn absent_timestamp_is_null() {
        let seq = sequencer(
            vec![json!({"id": "1"}), json!({"id": "2", "x": "2024-01-02 03:04"})],
            r#"{"x": {"fieldType": "timestamp"}}"#,
        );
        let events = all_events(seq).await;
        // schema comes from the first record, which has no `x`
        assert_eq!(events[0].columns, vec!["id".to_string()]);

        let seq = sequencer(
            vec![json!({"id": "1", "x": null}), json!({"id": "2"})],
            r#"{"x": {"fieldType": "timestamp"}}"#,
        );
        let events = all_events(seq).await;
        assert_eq!(events[0].rows[0][1], Value::Null);
        assert_eq!(events[0].rows[1][1], Value::Null);
    }

    #[tokio::test]
    async fn empty_source_completes_without_events() {
        let mut seq = sequencer(vec![], "{}");
        assert!(seq.next_event().await.unwrap().is_none());
        assert!(seq.next_event().await.unwrap().is_none());
        assert_eq!(seq.summary().events, 0);
    }

    #[tokio::test]
    async fn completion_is_signalled_once_after_final_swap() {
        let mut seq = sequencer(vec![json!({"x": 1})], "{}");
        assert_eq!(seq.next_event().await.unwrap().unwrap().kind, EventKind::Swap);
        assert!(seq.next_event().await.unwrap().is_none());
        assert!(seq.next_event().await.unwrap().is_none());
    }

    struct FailingSource {
        served: usize,
        fail_after: usize,
        tally: RowTally,
    }

    #[async_trait]
    impl RecordSource for FailingSource {
        async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
            if self.served == self.fail_after {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "disk went away").into());
            }
            self.served += 1;
            // every record is preceded by one rejected line
            self.tally.skipped_rows += 1;
            let fields = json!({"n": self.served}).as_object().cloned().unwrap();
            Ok(Some(SourceRecord::new("A", fields)))
        }

        fn tally(&self) -> RowTally {
            self.tally
        }

        fn describe(&self) -> String {
            "broken.jsonl".to_string()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<IngestEvent>,
    }

    #[async_trait]
    impl IngestEventHandler for Recorder {
        async fn handle(&mut self, event: IngestEvent) -> IngestionResult<()> {
            self.events.push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn source_error_is_fatal_and_never_completes() {
        let source = FailingSource {
            served: 0,
            fail_after: 3,
            tally: RowTally::default(),
        };
        let mut seq = EventSequencer::new(source, Arc::new(TableConfigOverrides::empty()), chrono_tz::UTC);
        let err = seq.next_event().await.unwrap_err();
        assert!(err.to_string().contains("broken.jsonl"));
        assert!(err.to_string().contains("disk went away"));
        assert!(matches!(seq.next_event().await, Err(IngestionError::RunAborted)));
    }

    #[tokio::test]
    async fn drive_reports_summary_and_source_tally() {
        let source = FailingSource {
            served: 0,
            fail_after: usize::MAX,
            tally: RowTally::default(),
        };
        let source = LimitedSource { inner: source, limit: 3 };
        let seq = EventSequencer::new(source, Arc::new(TableConfigOverrides::empty()), chrono_tz::UTC)
            .with_flush_threshold(2);
        let mut recorder = Recorder::default();
        let summary = seq.drive(&mut recorder).await.unwrap();

        assert_eq!(summary.groups, 1);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.events, 2);
        assert_eq!(summary.skipped_rows, 3);
        let skipped: Vec<u64> = recorder.events.iter().map(|e| e.summary.skipped_rows).collect();
        // the third rejected line is read together with the held-back record
        assert_eq!(skipped, vec![3, 0]);
    }

    struct LimitedSource {
        inner: FailingSource,
        limit: usize,
    }

    #[async_trait]
    impl RecordSource for LimitedSource {
        async fn next_record(&mut self) -> IngestionResult<Option<SourceRecord>> {
            if self.inner.served == self.limit {
                return Ok(None);
            }
            self.inner.next_record().await
        }

        fn tally(&self) -> RowTally {
            self.inner.tally()
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }
}
