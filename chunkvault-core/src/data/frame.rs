//! Frame: an ordered batch of rows and the operations the write and query
//! paths build on.

use super::row::{FieldValue, Row};
use chrono::{DateTime, SubsecRound, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An ordered sequence of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame {
    rows: Vec<Row>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Append `other` after this frame's rows.
    pub fn extend(&mut self, other: Frame) {
        self.rows.extend(other.rows);
    }

    /// Concatenate frames in order.
    pub fn concat(frames: impl IntoIterator<Item = Frame>) -> Frame {
        let mut out = Frame::new();
        for f in frames {
            out.extend(f);
        }
        out
    }

    /// Drop sub-microsecond precision. Chunk files store microseconds, so
    /// rows must be compared at that precision before they are written.
    pub fn truncate_to_micros(&mut self) {
        for r in &mut self.rows {
            r.timestamp = r.timestamp.trunc_subsecs(6);
        }
    }

    /// Stable sort by timestamp ascending. Rows sharing a timestamp keep
    /// their relative order, so "later" stays later.
    pub fn sort_by_timestamp(&mut self) {
        self.rows.sort_by_key(|r| r.timestamp);
    }

    /// Drop rows that are exact duplicates (timestamp and every field) of an
    /// earlier row. Rows sharing a timestamp but differing in any field are
    /// all kept.
    pub fn dedup_exact(&mut self) {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows.retain(|r| seen.insert(r.key()));
    }

    /// Keep only the last occurrence of each timestamp, preserving the
    /// position order of the survivors.
    pub fn dedup_by_timestamp_keep_last(&mut self) {
        let mut last_pos: HashMap<DateTime<Utc>, usize> = HashMap::with_capacity(self.rows.len());
        for (i, r) in self.rows.iter().enumerate() {
            last_pos.insert(r.timestamp, i);
        }
        let mut i = 0;
        self.rows.retain(|r| {
            let keep = last_pos.get(&r.timestamp) == Some(&i);
            i += 1;
            keep
        });
    }

    /// Keep rows with `start <= timestamp <= end`. A missing bound is open.
    pub fn filter_range(&mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) {
        self.rows.retain(|r| {
            start.map_or(true, |s| r.timestamp >= s) && end.map_or(true, |e| r.timestamp <= e)
        });
    }

    /// Keep rows strictly after `cutoff`.
    pub fn retain_after(&mut self, cutoff: DateTime<Utc>) {
        self.rows.retain(|r| r.timestamp > cutoff);
    }

    pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.iter().map(|r| r.timestamp).max()
    }

    pub fn min_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.iter().map(|r| r.timestamp).min()
    }

    /// Union of field names in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut cols = Vec::new();
        for row in &self.rows {
            for name in row.fields.keys() {
                if seen.insert(name.as_str()) {
                    cols.push(name.clone());
                }
            }
        }
        cols
    }

    /// Split into consecutive frames of at most `size` rows.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = Frame> + '_ {
        self.rows.chunks(size.max(1)).map(|c| Frame::from(c.to_vec()))
    }

    /// Convert to a polars DataFrame: a `date` column plus one column per
    /// field. A field is Float64 unless any row holds text for it.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let micros: Vec<i64> = self.rows.iter().map(|r| r.timestamp.timestamp_micros()).collect();
        let mut columns = vec![Column::new("date".into(), micros)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?];

        for name in self.columns() {
            let is_text = self
                .rows
                .iter()
                .any(|r| matches!(r.get(&name), Some(FieldValue::Text(_))));
            if is_text {
                let values: Vec<Option<String>> = self
                    .rows
                    .iter()
                    .map(|r| r.get(&name).map(FieldValue::to_cell))
                    .collect();
                columns.push(Column::new(name.as_str().into(), values));
            } else {
                let values: Vec<Option<f64>> = self.rows.iter().map(|r| r.number(&name)).collect();
                columns.push(Column::new(name.as_str().into(), values));
            }
        }

        DataFrame::new(columns)
    }
}

impl From<Vec<Row>> for Frame {
    fn from(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

impl FromIterator<Row> for Frame {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Frame {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Frame {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 21, 0, 0).unwrap()
    }

    fn row(day: u32, close: f64) -> Row {
        Row::new(ts(day)).with("close", close)
    }

    #[test]
    fn sort_is_stable_for_equal_timestamps() {
        let mut f = Frame::from(vec![row(3, 1.0), row(2, 2.0), row(3, 3.0)]);
        f.sort_by_timestamp();
        let closes: Vec<f64> = f.rows().iter().filter_map(|r| r.number("close")).collect();
        assert_eq!(closes, vec![2.0, 1.0, 3.0]);
    }

    #[test]
    fn dedup_exact_keeps_conflicting_values() {
        let mut f = Frame::from(vec![row(2, 1.0), row(2, 1.0), row(2, 5.0)]);
        f.dedup_exact();
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn dedup_by_timestamp_keeps_last() {
        let mut f = Frame::from(vec![row(2, 1.0), row(3, 2.0), row(2, 9.0)]);
        f.dedup_by_timestamp_keep_last();
        assert_eq!(f.len(), 2);
        assert_eq!(f.rows()[0].number("close"), Some(2.0));
        assert_eq!(f.rows()[1].number("close"), Some(9.0));
    }

    #[test]
    fn filter_range_is_inclusive() {
        let mut f = Frame::from(vec![row(2, 1.0), row(3, 2.0), row(4, 3.0), row(5, 4.0)]);
        f.filter_range(Some(ts(3)), Some(ts(4)));
        assert_eq!(f.len(), 2);
        assert_eq!(f.min_timestamp(), Some(ts(3)));
        assert_eq!(f.max_timestamp(), Some(ts(4)));
    }

    #[test]
    fn open_bounds_keep_everything() {
        let mut f = Frame::from(vec![row(2, 1.0), row(3, 2.0)]);
        f.filter_range(None, None);
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn columns_are_in_first_seen_order() {
        let f = Frame::from(vec![
            Row::new(ts(2)).with("close", 1.0),
            Row::new(ts(3)).with("adj_close", 1.0).with("close", 2.0),
        ]);
        // BTreeMap orders fields within a row alphabetically
        assert_eq!(f.columns(), vec!["close".to_string(), "adj_close".to_string()]);
    }

    #[test]
    fn chunks_split_by_size() {
        let f: Frame = (1..=5).map(|d| row(d, d as f64)).collect();
        let sizes: Vec<usize> = f.chunks(2).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn dataframe_has_date_and_field_columns() {
        let f = Frame::from(vec![
            Row::new(ts(2)).with("close", 100.0).with("symbol", "SPY"),
            Row::new(ts(3)).with("close", 101.0),
        ]);
        let df = f.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 3);
        assert!(df.column("date").is_ok());
        assert_eq!(df.column("close").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("symbol").unwrap().dtype(), &DataType::String);
    }
}
