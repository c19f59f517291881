//! Tabular Data Model
//!
//! [`Table`] is the in-memory frame every stage exchanges: ordered rows over
//! named columns of typed [`Value`] cells. A [`DataSet`] bundles the tables
//! loaded for one window, keyed by data-source name.
//!
//! # JSON Form
//!
//! On every JSON boundary (broadcast payloads, archives, redis and json sinks)
//! a table becomes a sequence of row records. Temporal cells are rendered as
//! ISO-8601 strings before emission; on the way back in, columns named in
//! [`TEMPORAL_COLUMNS`] are re-typed.

use crate::dispatch::error::ParseError;
use crate::dispatch::window::Window;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

/// Per-window bundle of named tables. A missing key means the source was not
/// requested or failed to load.
pub type DataSet = BTreeMap<String, Table>;

/// Column names carrying temporal values in market-data frames.
pub const TEMPORAL_COLUMNS: &[&str] = &["datetime", "refts", "date", "time"];

/// Column used to place rows into windows.
pub const TIMESTAMP_COLUMN: &str = "datetime";

const DATETIME_ISO: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_ISO: &str = "%Y-%m-%d";
const TIME_ISO: &str = "%H:%M:%S%.f";

// =============================================================================
// VALUE
// =============================================================================

/// A typed table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Timestamp view. ISO strings are accepted too, so frames decoded from
    /// JSON without re-typing still slice correctly.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            Self::Str(s) => parse_datetime(s),
            _ => None,
        }
    }

    /// JSON-safe rendering. Temporal values become ISO-8601 strings,
    /// non-finite floats become `null`.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(v) => Json::Number((*v).into()),
            Self::Float(v) => Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
            Self::Str(s) => Json::String(s.clone()),
            Self::Timestamp(ts) => Json::String(ts.format(DATETIME_ISO).to_string()),
            Self::Date(d) => Json::String(d.format(DATE_ISO).to_string()),
            Self::Time(t) => Json::String(t.format(TIME_ISO).to_string()),
        }
    }

    /// Decode a JSON scalar. Nested arrays/objects are kept as their JSON text.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(v) => Self::Int(v),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Json::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    /// Infer a cell from raw text (flat files).
    pub fn infer(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::Null;
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Self::Int(v);
        }
        if let Ok(v) = raw.parse::<f64>() {
            return Self::Float(v);
        }
        match raw {
            "true" | "True" | "TRUE" => Self::Bool(true),
            "false" | "False" | "FALSE" => Self::Bool(false),
            _ => Self::Str(raw.to_string()),
        }
    }

    /// Parse raw text for a known temporal column, falling back to inference.
    pub fn temporal(column: &str, raw: &str) -> Self {
        let parsed = match column {
            "date" => parse_date(raw).map(Self::Date),
            "time" => parse_time(raw).map(Self::Time),
            _ => parse_datetime(raw).map(Self::Timestamp),
        };
        parsed.unwrap_or_else(|| Self::infer(raw))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Json::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

/// Accepts `YYYY-MM-DDTHH:MM:SS[.f]`, the space-separated variant, and a bare date.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, DATETIME_ISO)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .ok()
        .or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, DATE_ISO)
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .ok()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, TIME_ISO)
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

// =============================================================================
// TABLE
// =============================================================================

/// Ordered rows over named, typed columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Append a row. Short rows are padded with `Null`, long rows truncated.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Iterate one column top to bottom.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| &r[idx]))
    }

    /// Add or replace a column. Missing trailing values become `Null`.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        let mut values = values.into_iter();
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = values.next().unwrap_or(Value::Null);
                }
            }
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(values.next().unwrap_or(Value::Null));
                }
            }
        }
    }

    /// Keep rows matching `pred`.
    pub fn filter_rows(&self, pred: impl Fn(&[Value]) -> bool) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| pred(r)).cloned().collect(),
        }
    }

    /// Rows whose `column` timestamp lies inside `window` (exclusive end).
    /// A frame without the column yields an empty frame with the same schema.
    pub fn slice_window(&self, column: &str, window: &Window) -> Table {
        let Some(idx) = self.column_index(column) else {
            return Table::new(self.columns.clone());
        };
        self.filter_rows(|row| {
            row[idx]
                .as_timestamp()
                .map(|ts| window.contains(ts))
                .unwrap_or(false)
        })
    }

    /// Concatenate `other` below `self`, taking the union of columns.
    pub fn append(&mut self, other: Table) {
        for col in &other.columns {
            if !self.has_column(col) {
                self.columns.push(col.clone());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
            }
        }
        let mapping: Vec<usize> = other
            .columns
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect();
        let width = self.columns.len();
        for row in other.rows {
            let mut out = vec![Value::Null; width];
            for (value, &idx) in row.into_iter().zip(&mapping) {
                out[idx] = value;
            }
            self.rows.push(out);
        }
    }

    /// Row-record form with JSON-safe cells.
    pub fn to_records(&self) -> Vec<Json> {
        self.rows
            .iter()
            .map(|row| {
                let record: Map<String, Json> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.clone(), v.to_json()))
                    .collect();
                Json::Object(record)
            })
            .collect()
    }

    /// Rebuild a table from row records. Column order follows first
    /// appearance; temporal columns are re-typed.
    pub fn from_records(records: &[Json]) -> Result<Table, ParseError> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            let obj = record
                .as_object()
                .ok_or_else(|| ParseError::Payload(format!("expected record object, got {}", record)))?;
            for key in obj.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let mut table = Table::new(columns.clone());
        for record in records {
            // Checked above.
            let Some(obj) = record.as_object() else { continue };
            let row = columns
                .iter()
                .map(|c| match obj.get(c) {
                    None | Some(Json::Null) => Value::Null,
                    Some(Json::String(s)) if TEMPORAL_COLUMNS.contains(&c.as_str()) => {
                        Value::temporal(c, s)
                    }
                    Some(v) => Value::from_json(v),
                })
                .collect();
            table.push_row(row);
        }
        Ok(table)
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_records().serialize(serializer)
    }
}

// =============================================================================
// DATASET PAYLOADS
// =============================================================================

/// `{source: [records...]}` JSON object for a dataset.
pub fn encode_dataset(data: &DataSet) -> Json {
    Json::Object(
        data.iter()
            .map(|(name, table)| (name.clone(), Json::Array(table.to_records())))
            .collect(),
    )
}

/// Inverse of [`encode_dataset`].
pub fn decode_dataset(payload: &str) -> Result<DataSet, ParseError> {
    let json: Json =
        serde_json::from_str(payload).map_err(|e| ParseError::Payload(e.to_string()))?;
    let obj = json
        .as_object()
        .ok_or_else(|| ParseError::Payload("payload is not an object".to_string()))?;
    obj.iter()
        .map(|(name, records)| {
            let records = records
                .as_array()
                .ok_or_else(|| ParseError::Payload(format!("source {} is not a record array", name)))?;
            Ok((name.clone(), Table::from_records(records)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_datetime(s).unwrap()
    }

    fn market_frame() -> Table {
        let mut t = Table::new(["datetime", "date", "time", "instrument_id", "value1"]);
        for (i, stamp) in ["2023-10-02T09:30:00", "2023-10-02T09:31:00", "2023-10-02T09:32:00"]
            .iter()
            .enumerate()
        {
            let dt = ts(stamp);
            t.push_row(vec![
                Value::Timestamp(dt),
                Value::Date(dt.date()),
                Value::Time(dt.time()),
                Value::from(format!("instrid{}", i + 1).as_str()),
                Value::Int(i as i64 + 1),
            ]);
        }
        t
    }

    #[test]
    fn test_records_render_iso_strings() {
        let records = market_frame().to_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["datetime"], Json::String("2023-10-02T09:30:00".into()));
        assert_eq!(records[0]["date"], Json::String("2023-10-02".into()));
        assert_eq!(records[0]["time"], Json::String("09:30:00".into()));
        assert_eq!(records[2]["value1"], Json::from(3));
    }

    #[test]
    fn test_from_records_retypes_temporal_columns() {
        let table = Table::from_records(&market_frame().to_records()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.value(1, "datetime"),
            Some(&Value::Timestamp(ts("2023-10-02T09:31:00")))
        );
        assert_eq!(table.value(1, "instrument_id"), Some(&Value::from("instrid2")));
    }

    #[test]
    fn test_slice_window_excludes_boundary() {
        let window = Window::from_boundary(ts("2023-10-02T09:30:00"), ts("2023-10-02T09:32:00")).unwrap();
        let sliced = market_frame().slice_window(TIMESTAMP_COLUMN, &window);
        assert_eq!(sliced.len(), 2);
    }

    #[test]
    fn test_append_unions_columns() {
        let mut a = Table::new(["x"]);
        a.push_row(vec![Value::Int(1)]);
        let mut b = Table::new(["y", "x"]);
        b.push_row(vec![Value::Int(7), Value::Int(2)]);
        a.append(b);
        assert_eq!(a.columns(), &["x".to_string(), "y".to_string()]);
        assert_eq!(a.value(0, "y"), Some(&Value::Null));
        assert_eq!(a.value(1, "x"), Some(&Value::Int(2)));
        assert_eq!(a.value(1, "y"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_set_column_adds_and_replaces() {
        let mut t = market_frame();
        t.set_column("signal", vec![Value::Float(2.0), Value::Float(4.0)]);
        assert_eq!(t.value(2, "signal"), Some(&Value::Null));
        t.set_column("value1", vec![Value::Int(9); 3]);
        assert_eq!(t.value(0, "value1"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(decode_dataset("[1,2,3]").is_err());
        assert!(decode_dataset("{\"market_data\": 5}").is_err());
        assert!(decode_dataset("not json").is_err());
    }

    #[test]
    fn test_value_infer() {
        assert_eq!(Value::infer("42"), Value::Int(42));
        assert_eq!(Value::infer("4.5"), Value::Float(4.5));
        assert_eq!(Value::infer("true"), Value::Bool(true));
        assert_eq!(Value::infer(""), Value::Null);
        assert_eq!(Value::infer("instrid1"), Value::from("instrid1"));
    }
}
