//! Value transformer: one raw record plus the active schema becomes one [`TransformedRow`].
//!
//! Coercion is per column [`FieldType`]:
//!
//! - `timestamp`: `YYYY-MM-DD HH:mm` (seconds and a bare date are tolerated) read as local time
//!   in the configured zone. Unparseable values become [`Value::Null`] and log a warning; absent
//!   or blank values become null silently.
//! - `number`: non-null values are coerced like a JavaScript `Number(...)` call. Input that is
//!   not numeric, and a field missing from the record, become NaN. Only an explicit null stays null.
//! - `string`: the raw value passes through unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::{ColumnConfig, FieldType, RawRecord, TableSchema, TransformedRow, Value};

/// Primary input pattern for timestamp columns.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

const TIMESTAMP_FALLBACK_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Transform one record. The row has one entry per schema column, skipped columns included.
pub fn transform_record(fields: &RawRecord, schema: &TableSchema, tz: Tz) -> TransformedRow {
    schema
        .columns
        .iter()
        .map(|column| transform_value(fields.get(&column.header), column, tz))
        .collect()
}

/// Transform a single raw value for `column`.
pub fn transform_value(raw: Option<&serde_json::Value>, column: &ColumnConfig, tz: Tz) -> Value {
    let raw = match raw {
        Some(serde_json::Value::Null) => return Value::Null,
        None if column.field_type == FieldType::Number => return Value::Number(f64::NAN),
        None => return Value::Null,
        Some(v) => v,
    };

    match column.field_type {
        FieldType::Timestamp => {
            if is_blank(raw) {
                return Value::Null;
            }
            match parse_timestamp(raw, tz) {
                Some(ts) => Value::Timestamp(ts),
                None => {
                    warn!(column = %column.header, value = %raw, "invalid date value");
                    Value::Null
                }
            }
        }
        FieldType::Number => Value::Number(coerce_number(raw)),
        FieldType::String => Value::Raw(raw.clone()),
    }
}

fn is_blank(raw: &serde_json::Value) -> bool {
    matches!(raw, serde_json::Value::String(s) if s.trim().is_empty())
}

/// Parse a timestamp string as local time in `tz`.
///
/// Returns `None` for non-strings, text that matches none of the accepted patterns, and local
/// times that fall into a daylight-saving gap. Ambiguous local times resolve to the earlier
/// instant.
pub fn parse_timestamp(raw: &serde_json::Value, tz: Tz) -> Option<DateTime<Utc>> {
    let text = raw.as_str()?.trim();
    let naive = parse_naive(text)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
        return Some(dt);
    }
    for fmt in TIMESTAMP_FALLBACK_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Coerce a non-null raw value to a number. Never fails: non-numeric input yields NaN.
pub fn coerce_number(raw: &serde_json::Value) -> f64 {
    match raw {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        serde_json::Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        serde_json::Value::String(s) => parse_number_text(s),
        serde_json::Value::Null => 0.0,
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => f64::NAN,
    }
}

fn parse_number_text(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }

    let radix = match t.get(..2) {
        Some("0x") | Some("0X") => Some(16),
        Some("0o") | Some("0O") => Some(8),
        Some("0b") | Some("0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        return u64::from_str_radix(&t[2..], radix)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN);
    }

    // `f64::from_str` also accepts "inf" and "nan", which are not numbers here.
    let numeric_chars = t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !numeric_chars {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;
    use serde_json::json;

    use super::{coerce_number, parse_timestamp, transform_record, transform_value};
    use crate::types::{ColumnConfig, FieldType, RawRecord, TableSchema, Value};

    fn column(name: &str, field_type: FieldType) -> ColumnConfig {
        let mut c = ColumnConfig::new(name);
        c.field_type = field_type;
        c
    }

    fn record(v: serde_json::Value) -> RawRecord {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn timestamp_is_read_in_target_zone() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let ts = parse_timestamp(&json!("2024-03-01 10:30"), tz).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn timestamp_tolerates_seconds_and_bare_dates() {
        let tz = chrono_tz::UTC;
        assert_eq!(
            parse_timestamp(&json!("2024-03-01 10:30:15"), tz).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 15).unwrap()
        );
        assert_eq!(
            parse_timestamp(&json!("2024-03-01"), tz).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn unparseable_timestamp_becomes_null() {
        let c = column("when", FieldType::Timestamp);
        let v = transform_value(Some(&json!("next tuesday")), &c, chrono_tz::UTC);
        assert_eq!(v, Value::Null);
        let v = transform_value(Some(&json!(1700000000)), &c, chrono_tz::UTC);
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn absent_or_blank_timestamp_is_null() {
        let c = column("when", FieldType::Timestamp);
        assert_eq!(transform_value(None, &c, chrono_tz::UTC), Value::Null);
        assert_eq!(transform_value(Some(&json!("  ")), &c, chrono_tz::UTC), Value::Null);
    }

    #[test]
    fn timestamp_in_dst_gap_is_null() {
        let tz: Tz = "America/New_York".parse().unwrap();
        assert!(parse_timestamp(&json!("2024-03-10 02:30"), tz).is_none());
    }

    #[test]
    fn number_coercion_follows_numeric_text_rules() {
        assert_eq!(coerce_number(&json!("1")), 1.0);
        assert_eq!(coerce_number(&json!(" 2.5 ")), 2.5);
        assert_eq!(coerce_number(&json!("")), 0.0);
        assert_eq!(coerce_number(&json!(true)), 1.0);
        assert_eq!(coerce_number(&json!("0x1A")), 26.0);
        assert_eq!(coerce_number(&json!("-Infinity")), f64::NEG_INFINITY);
        assert!(coerce_number(&json!("abc")).is_nan());
        assert!(coerce_number(&json!("inf")).is_nan());
        assert!(coerce_number(&json!({"a": 1})).is_nan());
    }

    #[test]
    fn non_numeric_number_is_nan_not_null() {
        let c = column("qty", FieldType::Number);
        match transform_value(Some(&json!("lots")), &c, chrono_tz::UTC) {
            Value::Number(n) => assert!(n.is_nan()),
            other => panic!("expected NaN number, got {other:?}"),
        }
        assert_eq!(transform_value(Some(&json!(null)), &c, chrono_tz::UTC), Value::Null);
    }

    #[test]
    fn missing_number_field_is_nan() {
        let c = column("qty", FieldType::Number);
        assert!(matches!(transform_value(None, &c, chrono_tz::UTC), Value::Number(n) if n.is_nan()));
        let s = column("label", FieldType::String);
        assert_eq!(transform_value(None, &s, chrono_tz::UTC), Value::Null);
    }

    /// Collects formatted log output from a scoped subscriber.
    fn captured_logs(f: impl FnOnce()) -> String {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Buf(Arc<Mutex<Vec<u8>>>);

        impl Write for Buf {
            fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(bytes);
                Ok(bytes.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Buf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn unparseable_timestamp_logs_a_warning() {
        let c = column("when", FieldType::Timestamp);
        let logs = captured_logs(|| {
            transform_value(Some(&json!("next tuesday")), &c, chrono_tz::UTC);
        });
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("invalid date value"), "{logs}");
        assert!(logs.contains("next tuesday"), "{logs}");
    }

    #[test]
    fn absent_or_blank_timestamp_logs_nothing() {
        let c = column("when", FieldType::Timestamp);
        let logs = captured_logs(|| {
            transform_value(None, &c, chrono_tz::UTC);
            transform_value(Some(&json!("")), &c, chrono_tz::UTC);
            transform_value(Some(&json!(null)), &c, chrono_tz::UTC);
        });
        assert!(logs.is_empty(), "{logs}");
    }

    #[test]
    fn strings_pass_through_and_rows_follow_schema_order() {
        let mut hidden = column("b", FieldType::String);
        hidden.skip = true;
        let schema = TableSchema::new(vec![
            column("c", FieldType::Number),
            hidden,
            column("a", FieldType::String),
        ]);
        let row = transform_record(&record(json!({"a": {"k": 1}, "b": "x", "c": "3"})), &schema, chrono_tz::UTC);
        assert_eq!(
            row,
            vec![
                Value::Number(3.0),
                Value::Raw(json!("x")),
                Value::Raw(json!({"k": 1})),
            ]
        );
    }
}
