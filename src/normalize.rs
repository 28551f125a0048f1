// GTFS text tables to typed documents, and back to CSV for export

use crate::error::{AtlasError, Result};
use crate::store::Document;
use serde_json::{Number, Value};

/// GTFS columns stored as numbers whenever their text parses as one.
pub const NUMERIC_FIELDS: &[&str] = &[
    "continuous_pickup",
    "continuous_drop_off",
    "stop_lat",
    "stop_lon",
    "location_type",
    "wheelchair_boarding",
    "route_type",
    "route_sort_order",
    "direction_id",
    "wheelchair_accessible",
    "bikes_allowed",
    "stop_sequence",
    "pickup_type",
    "drop_off_type",
    "shape_dist_traveled",
    "timepoint",
    "service_id",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
    "exception_type",
    "shape_pt_lat",
    "shape_pt_lon",
    "shape_pt_sequence",
    "headway_secs",
    "exact_times",
    "transfer_type",
    "min_transfer_time",
    "price",
    "payment_method",
    "transfers",
    "transfer_duration",
];

const DELIMITER: char = ',';
const BOM: char = '\u{feff}';

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<Document>,
}

pub fn is_numeric_field(name: &str) -> bool {
    NUMERIC_FIELDS.contains(&name)
}

/// Parses one GTFS table. `table` only labels parse errors.
///
/// Lines with more fields than the header or an unbalanced quote fail the whole
/// table. Lines with fewer fields leave the trailing header keys absent.
pub fn normalize(table: &str, text: &str) -> Result<RawTable> {
    let text = text.strip_prefix(BOM).unwrap_or(text);
    let text = text.replace("\r\n", "\n");

    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    let mut lines = lines.into_iter().enumerate();
    let header = match lines.next() {
        Some((_, line)) => split_line(line).map_err(|reason| AtlasError::Parse {
            table: table.to_string(),
            line: 1,
            reason,
        })?,
        None => return Ok(RawTable::default()),
    };

    let mut rows = Vec::new();
    for (index, line) in lines {
        if line.is_empty() {
            continue;
        }
        let parse_err = |reason: String| AtlasError::Parse {
            table: table.to_string(),
            line: index + 1,
            reason,
        };

        let fields = split_line(line).map_err(parse_err)?;
        if fields.len() > header.len() {
            return Err(parse_err(format!(
                "{} fields but the header has {}",
                fields.len(),
                header.len()
            )));
        }

        let mut row = Document::new();
        for (name, raw) in header.iter().zip(fields) {
            row.insert(name.clone(), coerce(name, raw));
        }
        rows.push(row);
    }

    Ok(RawTable { header, rows })
}

/// Numeric fields become numbers when they parse; everything else stays text.
pub fn coerce(field: &str, raw: String) -> Value {
    if !is_numeric_field(field) {
        return Value::String(raw);
    }
    match parse_number(&raw) {
        Some(number) => Value::Number(number),
        None => Value::String(raw),
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(Number::from(int));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|float| float.is_finite())
        .and_then(Number::from_f64)
}

/// Splits on the delimiter, keeping every double-quoted span as one field.
///
/// Distinct quoted spans are swapped for placeholder tokens before splitting and
/// restored (without their quotes) afterwards, so identical spans share a token.
fn split_line(line: &str) -> std::result::Result<Vec<String>, String> {
    let spans = quoted_spans(line)?;
    if spans.is_empty() {
        return Ok(line.split(DELIMITER).map(str::to_string).collect());
    }

    let mut substituted = line.to_string();
    for (i, span) in spans.iter().enumerate() {
        substituted = substituted.replace(span.as_str(), &placeholder(i));
    }

    let fields = substituted
        .split(DELIMITER)
        .map(|field| {
            let mut field = field.to_string();
            if field.contains('\0') {
                for (i, span) in spans.iter().enumerate() {
                    field = field.replace(&placeholder(i), &span[1..span.len() - 1]);
                }
            }
            field
        })
        .collect();

    Ok(fields)
}

/// Distinct `"..."` spans of a line, in order of first appearance.
fn quoted_spans(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut spans: Vec<String> = Vec::new();
    let mut rest = line;

    while let Some(open) = rest.find('"') {
        let after_open = &rest[open + 1..];
        let close = after_open
            .find('"')
            .ok_or_else(|| "unterminated quoted field".to_string())?;
        let span = &rest[open..open + close + 2];
        if !spans.iter().any(|s| s == span) {
            spans.push(span.to_string());
        }
        rest = &after_open[close + 1..];
    }

    Ok(spans)
}

fn placeholder(index: usize) -> String {
    format!("\0{}\0", index)
}

/// Writes a stored table back out as CSV, columns in header order.
pub fn to_csv(header: &[String], rows: &[Document]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;

    for row in rows {
        let record: Vec<String> = header
            .iter()
            .map(|name| match row.get(name) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AtlasError::Io(e.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|e| AtlasError::Storage(format!("CSV export is not UTF-8: {}", e)))
}
