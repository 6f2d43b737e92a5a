use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use tabular_loader::ingestion::jsonl::JsonLinesSource;
use tabular_loader::ingestion::RecordSource;
use tabular_loader::pipeline::EventSequencer;
use tabular_loader::table_config::TableConfigOverrides;
use tabular_loader::types::{EventKind, IngestEvent, Value};

async fn orders_events() -> (Vec<IngestEvent>, u64) {
    let overrides = TableConfigOverrides::from_path("tests/fixtures/orders_table_config.json").unwrap();
    let source = JsonLinesSource::open("tests/fixtures/orders.jsonl").await.unwrap();
    let mut seq = EventSequencer::new(source, Arc::new(overrides), chrono_tz::Asia::Kolkata);

    let mut events = Vec::new();
    while let Some(ev) = seq.next_event().await.unwrap() {
        events.push(ev);
    }
    (events, seq.summary().skipped_rows)
}

#[tokio::test]
async fn jsonl_fixture_produces_one_swap_per_group() {
    let (events, skipped) = orders_events().await;

    let shape: Vec<(EventKind, &str, usize)> = events
        .iter()
        .map(|e| (e.kind, e.group.as_str(), e.row_count()))
        .collect();
    assert_eq!(shape, vec![(EventKind::Swap, "north", 3), (EventKind::Swap, "south", 1)]);
    assert_eq!(skipped, 1);
    assert_eq!(events[0].summary.skipped_rows, 1);
    assert_eq!(events[1].summary.skipped_rows, 0);
}

#[tokio::test]
async fn jsonl_fixture_applies_overrides_and_coercions() {
    let (events, _) = orders_events().await;
    let north = &events[0];

    assert_eq!(north.columns, vec!["id", "amount", "created"]);
    assert_eq!(north.table_config.len(), 4);
    assert!(north.table_config.columns[0].primary);

    assert_eq!(
        north.rows[0],
        vec![
            Value::Raw(json!("1")),
            Value::Number(12.5),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap()),
        ]
    );

    // unparseable number and date
    assert_eq!(north.rows[1][0], Value::Raw(json!("2")));
    assert!(matches!(north.rows[1][1], Value::Number(n) if n.is_nan()));
    assert_eq!(north.rows[1][2], Value::Null);

    // JSON number and blank timestamp
    assert_eq!(north.rows[2][1], Value::Number(7.0));
    assert_eq!(north.rows[2][2], Value::Null);
}

#[tokio::test]
async fn each_group_derives_its_own_schema() {
    let (events, _) = orders_events().await;
    let south = &events[1];

    assert_eq!(south.columns, vec!["id", "amount", "created", "region"]);
    assert_eq!(
        south.rows[0],
        vec![
            Value::Raw(json!("4")),
            Value::Number(1000.0),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 10, 17, 45, 0).unwrap()),
            Value::Raw(json!("coast")),
        ]
    );
    assert_eq!(south.summary.total, Some(1));
}

#[tokio::test]
async fn missing_jsonl_file_is_an_io_error() {
    let err = JsonLinesSource::open("tests/fixtures/does_not_exist.jsonl")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, tabular_loader::IngestionError::Io(_)));
}

#[tokio::test]
async fn jsonl_source_reports_its_path() {
    let source = JsonLinesSource::open("tests/fixtures/orders.jsonl").await.unwrap();
    assert!(source.describe().ends_with("orders.jsonl"));
}
