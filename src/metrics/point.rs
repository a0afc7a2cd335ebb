//! Measurement points.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Tag set, ordered by key.
pub type Tags = BTreeMap<String, String>;

/// Field set, ordered by key.
pub type Fields = BTreeMap<String, FieldValue>;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Unsigned(u64),
    Boolean(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Unsigned(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Unsigned(u64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        Self::String(String::from_utf8_lossy(v).into_owned())
    }
}

/// A measurement point: name, tags, fields and an optional timestamp in
/// nanoseconds since the epoch (UTC).
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, tags: Tags, fields: Fields) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
            fields,
            timestamp: None,
        }
    }

    pub fn with_timestamp(
        measurement: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
            fields,
            timestamp: Some(timestamp),
        }
    }
}
