//! Row: one timestamped observation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single named value on a row.
///
/// Chunk files are untyped text, so a cell that parses as a float becomes
/// `Number` and anything else becomes `Text`. Types are not stored: a
/// `Text` value that reads as a float (`"005930"`, `"nan"`, `"inf"`) comes
/// back from a chunk as a `Number`, and `"nan"` is then written as an empty
/// cell. Keep such values as text-only fields by giving them a
/// non-numeric form before writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Parse a CSV cell. Empty cells carry no value.
    pub fn parse_cell(cell: &str) -> Option<FieldValue> {
        let cell = cell.trim();
        if cell.is_empty() {
            return None;
        }
        match cell.parse::<f64>() {
            Ok(v) => Some(FieldValue::Number(v)),
            Err(_) => Some(FieldValue::Text(cell.to_string())),
        }
    }

    /// Render as a CSV cell. NaN is written as an empty cell.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Number(v) if v.is_nan() => String::new(),
            FieldValue::Number(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    /// Hashable identity used for exact-row comparison.
    pub(crate) fn key(&self) -> ValueKey {
        match self {
            FieldValue::Number(v) if v.is_nan() => ValueKey::NaN,
            // -0.0 and 0.0 compare equal as floats
            FieldValue::Number(v) if *v == 0.0 => ValueKey::Number(0),
            FieldValue::Number(v) => ValueKey::Number(v.to_bits()),
            FieldValue::Text(s) => ValueKey::Text(s.clone()),
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ValueKey {
    NaN,
    Number(u64),
    Text(String),
}

/// One timestamped observation. The timestamp is the row's key within a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Identity of a row for exact-duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RowKey {
    micros: i64,
    fields: Vec<(String, ValueKey)>,
}

impl Row {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Numeric value of a field, if present and numeric.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    pub(crate) fn key(&self) -> RowKey {
        RowKey {
            micros: self.timestamp.timestamp_micros(),
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.key()))
                .collect(),
        }
    }
}
