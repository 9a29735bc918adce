//! Typed scalar values and text coercion.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::str::FromStr;

use crate::error::{MalformedSnafu, TypeMismatchSnafu, UnknownDataTypeSnafu, ValueError};

/// Primitive kinds a time-series column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
    Text,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ValueError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_uppercase().as_str() {
            "BOOLEAN" => Ok(DataType::Boolean),
            "INT32" => Ok(DataType::Int32),
            "INT64" => Ok(DataType::Int64),
            "FLOAT" => Ok(DataType::Float),
            "DOUBLE" => Ok(DataType::Double),
            "TEXT" | "STRING" => Ok(DataType::Text),
            _ => UnknownDataTypeSnafu { name }.fail(),
        }
    }
}

/// One scalar cell. `Null` is an absent value, never a zero.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl FieldValue {
    /// Coerce a raw text cell into a value of `data_type`.
    ///
    /// Empty cells are null for every type. TEXT strips one layer of
    /// surrounding double quotes. BOOLEAN accepts exactly `true` or `false`
    /// and maps anything else to null. Numeric kinds fail on malformed input.
    pub fn parse(raw: &str, data_type: DataType) -> Result<Self, ValueError> {
        if raw.is_empty() {
            return Ok(FieldValue::Null);
        }
        let malformed = || {
            MalformedSnafu {
                data_type,
                input: raw,
            }
            .build()
        };
        let value = match data_type {
            DataType::Text => FieldValue::Text(strip_double_quotes(raw).to_string()),
            DataType::Boolean => match raw {
                "true" => FieldValue::Boolean(true),
                "false" => FieldValue::Boolean(false),
                _ => FieldValue::Null,
            },
            DataType::Int32 => FieldValue::Int32(raw.parse().map_err(|_| malformed())?),
            DataType::Int64 => FieldValue::Int64(raw.parse().map_err(|_| malformed())?),
            DataType::Float => FieldValue::Float(raw.parse().map_err(|_| malformed())?),
            DataType::Double => FieldValue::Double(raw.parse().map_err(|_| malformed())?),
        };
        Ok(value)
    }

    /// The live tag, or `None` for null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Boolean(_) => Some(DataType::Boolean),
            FieldValue::Int32(_) => Some(DataType::Int32),
            FieldValue::Int64(_) => Some(DataType::Int64),
            FieldValue::Float(_) => Some(DataType::Float),
            FieldValue::Double(_) => Some(DataType::Double),
            FieldValue::Text(_) => Some(DataType::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            FieldValue::Boolean(v) => Ok(*v),
            other => other.mismatch(DataType::Boolean),
        }
    }

    pub fn as_i32(&self) -> Result<i32, ValueError> {
        match self {
            FieldValue::Int32(v) => Ok(*v),
            other => other.mismatch(DataType::Int32),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            FieldValue::Int64(v) => Ok(*v),
            other => other.mismatch(DataType::Int64),
        }
    }

    pub fn as_f32(&self) -> Result<f32, ValueError> {
        match self {
            FieldValue::Float(v) => Ok(*v),
            other => other.mismatch(DataType::Float),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            FieldValue::Double(v) => Ok(*v),
            other => other.mismatch(DataType::Double),
        }
    }

    pub fn as_text(&self) -> Result<&str, ValueError> {
        match self {
            FieldValue::Text(v) => Ok(v),
            other => other.mismatch(DataType::Text),
        }
    }

    fn mismatch<T>(&self, expected: DataType) -> Result<T, ValueError> {
        let actual = self
            .data_type()
            .map_or_else(|| "NULL".to_string(), |t| t.to_string());
        TypeMismatchSnafu { expected, actual }.fail()
    }

    /// Literal for a query statement, or `None` for null.
    ///
    /// TEXT is double-quoted with backslash escapes; other kinds use their
    /// canonical rendering.
    pub fn to_query_literal(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(v) => {
                let mut out = String::with_capacity(v.len() + 2);
                out.push('"');
                for c in v.chars() {
                    match c {
                        '"' | '\\' => {
                            out.push('\\');
                            out.push(c);
                        }
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
                Some(out)
            }
            other => Some(other.to_string()),
        }
    }

    /// Cell for a delimited file. Null is the empty cell; TEXT is wrapped in
    /// double quotes with inner quotes doubled.
    pub fn to_csv_cell(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Text(v) => format!("\"{}\"", v.replace('"', "\"\"")),
            other => other.to_string(),
        }
    }
}

/// Canonical rendering. Floats use the shortest form that round-trips, so
/// `1.0` renders as `1`.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::Int32(v) => write!(f, "{v}"),
            FieldValue::Int64(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

fn strip_double_quotes(raw: &str) -> &str {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}
