//! Typed row values
//!
//! A row is an ordered list of [`DataCell`]s. Cell values form a closed set of
//! scalar kinds; anything the set does not cover travels as raw bytes.

use crate::error::{StreamError, StreamResult};
use crate::schema::SchemaField;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Name of the derived merge key column appended to every row
pub const MERGE_KEY_FIELD: &str = "MERGE_KEY";

/// Semantic type of a field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Guid,
    Int32,
    Int64,
    Double,
    Decimal { precision: u8, scale: i8 },
    Boolean,
    DateTime,
    DateTimeOffset,
    Date,
    Binary,
    /// Nested record
    Struct(Vec<SchemaField>),
}

/// A single scalar value
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    String(String),
    Int64(i64),
    Double(f64),
    /// Fixed point number stored as `unscaled * 10^-scale`
    Decimal { unscaled: i128, scale: i8 },
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
}

/// One typed value in a row
#[derive(Debug, Clone, PartialEq)]
pub struct DataCell {
    pub field_name: String,
    pub field_type: FieldType,
    pub value: CellValue,
}

/// Ordered sequence of cells, matching the schema field order
pub type Row = Vec<DataCell>;

impl DataCell {
    pub fn new(field_name: impl Into<String>, field_type: FieldType, value: CellValue) -> Self {
        Self {
            field_name: field_name.into(),
            field_type,
            value,
        }
    }

    /// The merge key cell carried at the end of a row
    pub fn merge_key(key: impl Into<String>) -> Self {
        Self::new(MERGE_KEY_FIELD, FieldType::String, CellValue::String(key.into()))
    }
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text form used for merge keys and JSON output
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            Self::Int64(v) => Some(v.to_string()),
            Self::Double(v) => Some(v.to_string()),
            Self::Decimal { unscaled, scale } => Some(format_decimal(*unscaled, *scale)),
            Self::Boolean(v) => Some(v.to_string()),
            Self::DateTime(v) => Some(v.to_rfc3339()),
            Self::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
        }
    }

    /// Parse a textual value (CSV cell, API field) into the given type
    ///
    /// Empty text is `Null` for every type.
    pub fn parse(raw: &str, field_type: &FieldType) -> StreamResult<Self> {
        if raw.is_empty() {
            return Ok(Self::Null);
        }
        let value = match field_type {
            FieldType::String | FieldType::Guid => Self::String(raw.to_string()),
            FieldType::Int32 | FieldType::Int64 => Self::Int64(
                raw.trim()
                    .parse()
                    .map_err(|e| StreamError::parse(format!("invalid integer '{raw}': {e}")))?,
            ),
            FieldType::Double => Self::Double(
                raw.trim()
                    .parse()
                    .map_err(|e| StreamError::parse(format!("invalid double '{raw}': {e}")))?,
            ),
            FieldType::Decimal { scale, .. } => Self::Decimal {
                unscaled: parse_decimal(raw.trim(), *scale)?,
                scale: *scale,
            },
            FieldType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Self::Boolean(true),
                "false" | "0" => Self::Boolean(false),
                other => return Err(StreamError::parse(format!("invalid boolean '{other}'"))),
            },
            FieldType::DateTime | FieldType::DateTimeOffset | FieldType::Date => {
                Self::DateTime(parse_datetime(raw.trim())?)
            }
            FieldType::Binary => Self::Bytes(raw.as_bytes().to_vec()),
            FieldType::Struct(_) => {
                return Err(StreamError::UnsupportedType(
                    "struct values cannot be parsed from text".into(),
                ))
            }
        };
        Ok(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
];

fn parse_datetime(raw: &str) -> StreamResult<DateTime<Utc>> {
    if let Ok(v) = DateTime::parse_from_rfc3339(raw) {
        return Ok(v.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(v) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(v.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(v) = d.and_hms_opt(0, 0, 0) {
            return Ok(v.and_utc());
        }
    }
    Err(StreamError::parse(format!("invalid datetime '{raw}'")))
}

fn parse_decimal(raw: &str, scale: i8) -> StreamResult<i128> {
    let invalid = || StreamError::parse(format!("invalid decimal '{raw}'"));
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let scale = scale.max(0) as usize;
    let (kept, dropped) = if frac_part.len() > scale {
        frac_part.split_at(scale)
    } else {
        (frac_part, "")
    };
    if dropped.chars().any(|c| c != '0') {
        return Err(StreamError::parse(format!(
            "decimal '{raw}' does not fit scale {scale}"
        )));
    }

    let mut text = String::with_capacity(int_part.len() + scale);
    text.push_str(int_part);
    text.push_str(kept);
    text.extend(std::iter::repeat('0').take(scale - kept.len()));
    let unscaled: i128 = if text.is_empty() { 0 } else { text.parse().map_err(|_| invalid())? };
    Ok(if negative { -unscaled } else { unscaled })
}

fn format_decimal(unscaled: i128, scale: i8) -> String {
    if scale <= 0 {
        return unscaled.to_string();
    }
    let scale = scale as usize;
    let digits = unscaled.unsigned_abs().to_string();
    let padded = format!("{digits:0>width$}", width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    let sign = if unscaled < 0 { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}
