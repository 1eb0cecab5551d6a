//! Chunk file codec.
//!
//! Format: UTF-8 CSV with a header row. The first column is `date`, written
//! with [`DATE_FORMAT`] in UTC; the remaining columns are the union of the
//! frame's field names. Empty cells mean "no value".

use super::frame::Frame;
use super::row::{FieldValue, Row};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Name of the timestamp column.
pub const DATE_COLUMN: &str = "date";

/// Constant timestamp format for written chunks (RFC 3339 compatible).
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no '{DATE_COLUMN}' column in header")]
    MissingDateColumn,

    #[error("empty content")]
    Empty,

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Serialize a frame to chunk text.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    let columns: Vec<String> = frame
        .columns()
        .into_iter()
        .filter(|c| c != DATE_COLUMN)
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push(DATE_COLUMN.to_string());
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for row in frame {
        let mut record = Vec::with_capacity(columns.len() + 1);
        record.push(format_timestamp(row.timestamp));
        for col in &columns {
            record.push(row.get(col).map(FieldValue::to_cell).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| CodecError::Csv(e.into_error().into()))?;
    Ok(String::from_utf8(bytes)?)
}

/// Parse chunk text. Records whose timestamp cannot be parsed are dropped.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    if text.trim().is_empty() {
        return Err(CodecError::Empty);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let date_idx = headers
        .iter()
        .position(|h| h.trim() == DATE_COLUMN)
        .ok_or(CodecError::MissingDateColumn)?;

    let mut frame = Frame::new();
    let mut dropped = 0usize;

    for record in reader.records() {
        let record = record?;
        let Some(timestamp) = record.get(date_idx).and_then(parse_timestamp) else {
            dropped += 1;
            continue;
        };

        let mut row = Row::new(timestamp);
        for (i, cell) in record.iter().enumerate() {
            if i == date_idx {
                continue;
            }
            let Some(name) = headers.get(i) else { continue };
            if let Some(value) = FieldValue::parse_cell(cell) {
                row.fields.insert(name.trim().to_string(), value);
            }
        }
        frame.push(row);
    }

    if dropped > 0 {
        debug!(dropped, "dropped rows with unparseable timestamps");
    }

    Ok(frame)
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(DATE_FORMAT).to_string()
}

/// Parse a timestamp cell. Offsets are converted to UTC; naive values are
/// taken to be UTC already.
pub fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    let s = cell.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
