use chrono::{NaiveDate, NaiveDateTime};

use common::change::ColumnValue;

/// Typing heuristic for untyped dump cells:
/// integer -> float -> boolean -> timestamp -> string.
///
/// Null never comes from here — only the parsers' explicit null markers
/// (`\N` in COPY, bare `NULL` in INSERT lists) produce it, so an empty
/// string stays a string.
pub fn infer_value(cell: &str) -> ColumnValue {
    if let Ok(i) = cell.parse::<i64>() {
        return ColumnValue::Int(i);
    }
    if looks_numeric(cell) {
        if let Ok(f) = cell.parse::<f64>() {
            return ColumnValue::Float(f);
        }
    }
    match cell {
        "t" | "true" => return ColumnValue::Bool(true),
        "f" | "false" => return ColumnValue::Bool(false),
        _ => {}
    }
    if is_timestamp(cell) {
        return ColumnValue::Timestamp(cell.to_string());
    }
    ColumnValue::String(cell.to_string())
}

// keep "1e10-ish" words like "5ever" out of the float path
fn looks_numeric(cell: &str) -> bool {
    let mut bytes = cell.bytes();
    match bytes.next() {
        Some(b'+' | b'-' | b'.' | b'0'..=b'9') => {}
        _ => return false,
    }
    cell.bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E'))
}

fn is_timestamp(cell: &str) -> bool {
    if chrono::DateTime::parse_from_rfc3339(cell).is_ok() {
        return true;
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if NaiveDateTime::parse_from_str(cell, fmt).is_ok()
            || chrono::DateTime::parse_from_str(cell, fmt).is_ok()
        {
            return true;
        }
    }
    NaiveDate::parse_from_str(cell, "%Y-%m-%d").is_ok()
}
