//! Core value types shared by ingestion, filters and merge.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a stored datamap.
pub type DataMapId = u64;
/// Identifier of an uploaded file.
pub type FileId = u64;
/// Identifier of a sensor record.
pub type SensorId = u64;
/// Identifier of an ingest run (also identifies the resulting dataset).
pub type IngestId = u64;

/// Declared semantic type of a sensor column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// true/false readings.
    #[serde(alias = "bool")]
    Boolean,
    /// 64-bit signed integer readings.
    #[serde(alias = "int")]
    Integer,
    /// 64-bit floating point readings.
    Float,
    /// Free text readings.
    #[serde(alias = "str")]
    String,
    /// A column holding a date/time value.
    Datetime,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Datetime => "datetime",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored (or filtered) sensor value.
///
/// [`Value::Null`] is the explicit "no value" marker used by merged rows and filters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing value.
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Render for CSV output. Missing values render as an empty field.
    pub fn to_csv_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(v) => v.to_string(),
            Value::Integer(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::String(v) => v.clone(),
            Value::DateTime(v) => v.to_rfc3339_opts(SecondsFormat::AutoSi, false),
        }
    }
}

/// A malformed cell: the value could not be converted to the declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellError {
    /// 1-based file line number (the header is line 1).
    pub row: u64,
    /// 0-based column index in the file.
    pub column: usize,
    pub raw: String,
    pub reason: String,
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} column {}: {} (raw='{}')",
            self.row, self.column, self.reason, self.raw
        )
    }
}

/// Result of parsing a single raw cell against its declared [`DataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    /// Empty cell. Not an error.
    NoValue,
    ParseError(CellError),
}

impl TypedValue {
    /// The storable value, or `None` for empty and malformed cells.
    pub fn stored_value(&self) -> Option<Value> {
        match self {
            TypedValue::Bool(v) => Some(Value::Bool(*v)),
            TypedValue::Integer(v) => Some(Value::Integer(*v)),
            TypedValue::Float(v) => Some(Value::Float(*v)),
            TypedValue::String(v) => Some(Value::String(v.clone())),
            TypedValue::DateTime(v) => Some(Value::DateTime(*v)),
            TypedValue::NoValue | TypedValue::ParseError(_) => None,
        }
    }
}

/// One timestamped value of a single sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: Value,
}

impl Sample {
    pub fn new(time: DateTime<Utc>, value: Value) -> Self {
        Self { time, value }
    }
}
