//! Typed cell values, rows and row batches.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, btree_map},
    fmt,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use super::{
    DataResult, JsonValueSnafu, NonFiniteSnafu, NullValueSnafu, UnknownColumnSnafu, ValueTypeSnafu,
};
use crate::schema::{LogicalDataType, LogicalSchema, evolution::can_promote};

const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;

/// A single cell value.
///
/// Dates are days since the Unix epoch; timestamps are microseconds since the
/// Unix epoch in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 8-bit integer.
    Int8(i8),
    /// 16-bit integer.
    Int16(i16),
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// 32-bit float.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
}

/// Hashable normal form of a non-null value, used as an equi-join key.
///
/// Values that compare equal map to the same key: integers of every width
/// collapse to `Int`, and integral floats do as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    /// Boolean key.
    Bool(bool),
    /// Integer key, or an integral float.
    Int(i64),
    /// Bit pattern of a non-integral float.
    Float(u64),
    /// String key.
    Str(String),
    /// Byte key.
    Bytes(Vec<u8>),
    /// Timestamp key in microseconds; dates are widened to midnight.
    Micros(i64),
}

impl Value {
    /// Logical type of this value, `None` for null.
    pub fn data_type(&self) -> Option<LogicalDataType> {
        let dt = match self {
            Value::Null => return None,
            Value::Bool(_) => LogicalDataType::Bool,
            Value::Int8(_) => LogicalDataType::Int8,
            Value::Int16(_) => LogicalDataType::Int16,
            Value::Int32(_) => LogicalDataType::Int32,
            Value::Int64(_) => LogicalDataType::Int64,
            Value::Float32(_) => LogicalDataType::Float32,
            Value::Float64(_) => LogicalDataType::Float64,
            Value::Utf8(_) => LogicalDataType::Utf8,
            Value::Binary(_) => LogicalDataType::Binary,
            Value::Date(_) => LogicalDataType::Date,
            Value::Timestamp(_) => LogicalDataType::Timestamp,
        };
        Some(dt)
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(v.into()),
            Value::Float64(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    fn as_micros(&self) -> Option<i64> {
        match *self {
            Value::Date(d) => Some(i64::from(d) * MICROS_PER_DAY),
            Value::Timestamp(t) => Some(t),
            _ => None,
        }
    }

    /// Widen this value to `target` along the schema promotion rules.
    ///
    /// Null casts to any type. Returns `None` if the conversion is not a
    /// promotion.
    pub fn cast_to(&self, target: LogicalDataType) -> Option<Value> {
        let Some(from) = self.data_type() else {
            return Some(Value::Null);
        };
        if from == target {
            return Some(self.clone());
        }
        if !can_promote(from, target) {
            return None;
        }
        self.convert(target)
    }

    /// Convert to `target` whenever no information is lost.
    ///
    /// This accepts promotions plus range-checked integer narrowing and
    /// integer/float conversions that round-trip exactly. It is used for
    /// literal assignments, where an `Int64` literal may target an `Int32`
    /// column.
    pub fn coerce_to(&self, target: LogicalDataType) -> Option<Value> {
        if let Some(v) = self.cast_to(target) {
            return Some(v);
        }
        let converted = self.convert(target)?;
        (converted.compare(self) == Some(Ordering::Equal)).then_some(converted)
    }

    fn convert(&self, target: LogicalDataType) -> Option<Value> {
        let out = match target {
            LogicalDataType::Int8 => Value::Int8(self.integral()?.try_into().ok()?),
            LogicalDataType::Int16 => Value::Int16(self.integral()?.try_into().ok()?),
            LogicalDataType::Int32 => Value::Int32(self.integral()?.try_into().ok()?),
            LogicalDataType::Int64 => Value::Int64(self.integral()?),
            LogicalDataType::Float32 => Value::Float32(self.as_f64()? as f32),
            LogicalDataType::Float64 => Value::Float64(self.as_f64()?),
            LogicalDataType::Timestamp => Value::Timestamp(self.as_micros()?),
            LogicalDataType::Date => match *self {
                Value::Timestamp(t) if t.rem_euclid(MICROS_PER_DAY) == 0 => {
                    Value::Date(t.div_euclid(MICROS_PER_DAY).try_into().ok()?)
                }
                Value::Date(d) => Value::Date(d),
                _ => return None,
            },
            _ => return (self.data_type() == Some(target)).then(|| self.clone()),
        };
        Some(out)
    }

    fn integral(&self) -> Option<i64> {
        if let Some(v) = self.as_i64() {
            return Some(v);
        }
        let f = match *self {
            Value::Float32(v) => f64::from(v),
            Value::Float64(v) => v,
            _ => return None,
        };
        (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
    }

    /// SQL comparison. `None` when either side is null or the types are not
    /// comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Utf8(a), Value::Utf8(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => {
                if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
                    return Some(a.cmp(&b));
                }
                if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
                    return a.partial_cmp(&b);
                }
                if let (Some(a), Some(b)) = (self.as_micros(), other.as_micros()) {
                    return Some(a.cmp(&b));
                }
                None
            }
        }
    }

    /// SQL equality; `None` when the result is unknown.
    pub fn sql_eq(&self, other: &Value) -> Option<bool> {
        self.compare(other).map(|o| o == Ordering::Equal)
    }

    /// Hash key for equi-joins. `None` for null, which never joins.
    pub fn key_part(&self) -> Option<KeyPart> {
        let key = match self {
            Value::Null => return None,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Utf8(s) => KeyPart::Str(s.clone()),
            Value::Binary(b) => KeyPart::Bytes(b.clone()),
            Value::Date(_) | Value::Timestamp(_) => KeyPart::Micros(self.as_micros()?),
            Value::Float32(_) | Value::Float64(_) => match self.integral() {
                Some(i) => KeyPart::Int(i),
                None => KeyPart::Float(self.as_f64()?.to_bits()),
            },
            _ => KeyPart::Int(self.as_i64()?),
        };
        Some(key)
    }

    /// String form used for partition values; `None` for null.
    pub fn partition_string(&self) -> Option<String> {
        let s = match self {
            Value::Null => return None,
            Value::Utf8(s) => s.clone(),
            Value::Binary(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
            Value::Date(d) => format_date(*d),
            Value::Timestamp(t) => format_timestamp(*t),
            other => other.to_string(),
        };
        Some(s)
    }

    /// Convert a JSON value into a value of `target` type.
    ///
    /// Dates accept `YYYY-MM-DD` strings or day numbers; timestamps accept
    /// RFC 3339 strings or microsecond numbers; binary accepts strings
    /// (their UTF-8 bytes) or arrays of bytes.
    pub fn from_json(
        column: &str,
        json: &serde_json::Value,
        target: LogicalDataType,
    ) -> DataResult<Value> {
        use serde_json::Value as J;

        let fail = |reason: String| {
            JsonValueSnafu {
                column,
                reason,
            }
            .fail()
        };

        let value = match (target, json) {
            (_, J::Null) => Value::Null,
            (LogicalDataType::Bool, J::Bool(b)) => Value::Bool(*b),
            (LogicalDataType::Utf8, J::String(s)) => Value::Utf8(s.clone()),
            (LogicalDataType::Binary, J::String(s)) => Value::Binary(s.as_bytes().to_vec()),
            (LogicalDataType::Binary, J::Array(items)) => {
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_u64().and_then(|b| u8::try_from(b).ok()) {
                        Some(b) => bytes.push(b),
                        None => return fail(format!("{item} is not a byte")),
                    }
                }
                Value::Binary(bytes)
            }
            (LogicalDataType::Date, J::String(s)) => match NaiveDate::parse_from_str(s, "%Y-%m-%d")
            {
                Ok(date) => Value::Date(days_since_epoch(date)),
                Err(e) => return fail(format!("invalid date {s:?}: {e}")),
            },
            (LogicalDataType::Timestamp, J::String(s)) => match DateTime::parse_from_rfc3339(s) {
                Ok(ts) => Value::Timestamp(ts.with_timezone(&Utc).timestamp_micros()),
                Err(e) => return fail(format!("invalid timestamp {s:?}: {e}")),
            },
            (_, J::Number(n)) => {
                let raw = if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float64(f)
                } else {
                    return fail(format!("number {n} is out of range"));
                };
                let raw = match (target, raw) {
                    (LogicalDataType::Date, Value::Int64(d)) => match i32::try_from(d) {
                        Ok(d) => Value::Date(d),
                        Err(_) => return fail(format!("day number {d} is out of range")),
                    },
                    (LogicalDataType::Timestamp, Value::Int64(t)) => Value::Timestamp(t),
                    (_, raw) => raw,
                };
                match raw.coerce_to(target) {
                    Some(v) => v,
                    None => return fail(format!("{n} does not fit {target}")),
                }
            }
            (_, other) => return fail(format!("{other} is not a {target}")),
        };
        Ok(value)
    }

    /// Infer a value from JSON when no column type is known.
    ///
    /// Booleans, integers, floats and strings are supported; arrays and
    /// objects are rejected.
    pub fn infer_from_json(column: &str, json: &serde_json::Value) -> DataResult<Value> {
        use serde_json::Value as J;
        match json {
            J::Null => Ok(Value::Null),
            J::Bool(b) => Ok(Value::Bool(*b)),
            J::String(s) => Ok(Value::Utf8(s.clone())),
            J::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Ok(Value::Int64(i)),
                (None, Some(f)) => Ok(Value::Float64(f)),
                _ => JsonValueSnafu {
                    column,
                    reason: format!("number {n} is out of range"),
                }
                .fail(),
            },
            other => JsonValueSnafu {
                column,
                reason: format!("cannot infer a column type from {other}"),
            }
            .fail(),
        }
    }

    /// JSON rendering used for display and export.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int8(v) => J::from(*v),
            Value::Int16(v) => J::from(*v),
            Value::Int32(v) => J::from(*v),
            Value::Int64(v) => J::from(*v),
            Value::Float32(v) => J::from(f64::from(*v)),
            Value::Float64(v) => J::from(*v),
            Value::Utf8(s) => J::String(s.clone()),
            Value::Binary(b) => J::Array(b.iter().map(|x| J::from(*x)).collect()),
            Value::Date(d) => J::String(format_date(*d)),
            Value::Timestamp(t) => J::String(format_timestamp(*t)),
        }
    }

    fn is_finite(&self) -> bool {
        match *self {
            Value::Float32(v) => v.is_finite(),
            Value::Float64(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(s) => write!(f, "{s:?}"),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => f.write_str(&format_date(*d)),
            Value::Timestamp(t) => f.write_str(&format_timestamp(*t)),
        }
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = DateTime::<Utc>::UNIX_EPOCH.date_naive();
    // Every NaiveDate lies within i32 days of the epoch.
    date.signed_duration_since(epoch).num_days() as i32
}

fn format_date(days: i32) -> String {
    DateTime::<Utc>::UNIX_EPOCH
        .date_naive()
        .checked_add_signed(chrono::Duration::days(days.into()))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| format!("date({days})"))
}

fn format_timestamp(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .unwrap_or_else(|| format!("timestamp({micros})"))
}

/// One row: column name to value. Absent columns read as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    /// An empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `column`, or `None` when absent.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Value of `column`, treating absence as null.
    pub fn value(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&Value::Null)
    }

    /// Set `column` to `value`, returning the previous value.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(column.into(), value)
    }

    /// Builder-style [`Row::insert`].
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.insert(column, value);
        self
    }

    /// Iterate over `(column, value)` pairs in column-name order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    /// Number of stored columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the row stores no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reshape this row to `schema`: unknown columns are dropped, missing
    /// columns become null and narrower values are widened.
    pub fn project(&self, schema: &LogicalSchema) -> DataResult<Row> {
        let mut out = BTreeMap::new();
        for field in schema.columns() {
            let value = self.value(&field.name);
            let cast = value
                .cast_to(field.data_type)
                .with_context(|| ValueTypeSnafu {
                    column: field.name.as_str(),
                    expected: field.data_type,
                    found: value.to_string(),
                })?;
            out.insert(field.name.clone(), cast);
        }
        Ok(Row(out))
    }

    /// JSON object rendering of this row.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Rows validated against a schema.
///
/// Every row holds exactly the schema's columns, each value either null (for
/// nullable columns) or of the declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    schema: LogicalSchema,
    rows: Vec<Row>,
}

impl RowBatch {
    /// Validate `rows` against `schema`.
    ///
    /// Missing columns become null, narrower values are widened to the
    /// declared type and non-finite floats are rejected.
    pub fn new(schema: LogicalSchema, rows: Vec<Row>) -> DataResult<Self> {
        let mut normalized = Vec::with_capacity(rows.len());
        for (idx, row) in rows.into_iter().enumerate() {
            for (column, _) in &row {
                ensure!(
                    schema.contains(column),
                    UnknownColumnSnafu {
                        row: idx,
                        column: column.as_str(),
                    }
                );
            }

            let mut out = BTreeMap::new();
            for field in schema.columns() {
                let value = row.value(&field.name);
                ensure!(
                    field.nullable || !value.is_null(),
                    NullValueSnafu {
                        row: idx,
                        column: field.name.as_str(),
                    }
                );
                ensure!(
                    value.is_finite(),
                    NonFiniteSnafu {
                        row: idx,
                        column: field.name.as_str(),
                    }
                );
                let cast = value
                    .cast_to(field.data_type)
                    .with_context(|| ValueTypeSnafu {
                        column: field.name.as_str(),
                        expected: field.data_type,
                        found: value.to_string(),
                    })?;
                out.insert(field.name.clone(), cast);
            }
            normalized.push(Row(out));
        }

        Ok(Self {
            schema,
            rows: normalized,
        })
    }

    /// Schema the rows were validated against.
    pub fn schema(&self) -> &LogicalSchema {
        &self.schema
    }

    /// Borrow the rows.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Take the rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::DataError, schema::LogicalField};

    fn schema() -> LogicalSchema {
        LogicalSchema::new(vec![
            LogicalField::new("id", LogicalDataType::Int64, false),
            LogicalField::new("name", LogicalDataType::Utf8, true),
            LogicalField::new("score", LogicalDataType::Float64, true),
        ])
        .expect("schema")
    }

    #[test]
    fn cast_follows_promotions_only() {
        assert_eq!(
            Value::Int32(7).cast_to(LogicalDataType::Int64),
            Some(Value::Int64(7))
        );
        assert_eq!(
            Value::Int16(3).cast_to(LogicalDataType::Float64),
            Some(Value::Float64(3.0))
        );
        assert_eq!(
            Value::Date(1).cast_to(LogicalDataType::Timestamp),
            Some(Value::Timestamp(MICROS_PER_DAY))
        );
        assert_eq!(Value::Int64(7).cast_to(LogicalDataType::Int32), None);
        assert_eq!(Value::Utf8("7".into()).cast_to(LogicalDataType::Int64), None);
        assert_eq!(Value::Null.cast_to(LogicalDataType::Bool), Some(Value::Null));
    }

    #[test]
    fn coerce_allows_lossless_narrowing() {
        assert_eq!(
            Value::Int64(7).coerce_to(LogicalDataType::Int8),
            Some(Value::Int8(7))
        );
        assert_eq!(Value::Int64(300).coerce_to(LogicalDataType::Int8), None);
        assert_eq!(
            Value::Float64(2.0).coerce_to(LogicalDataType::Int32),
            Some(Value::Int32(2))
        );
        assert_eq!(Value::Float64(2.5).coerce_to(LogicalDataType::Int32), None);
        assert_eq!(Value::Bool(true).coerce_to(LogicalDataType::Int32), None);
    }

    #[test]
    fn comparisons_cross_numeric_widths_and_treat_null_as_unknown() {
        assert_eq!(Value::Int8(5).sql_eq(&Value::Int64(5)), Some(true));
        assert_eq!(Value::Int32(5).sql_eq(&Value::Float64(5.0)), Some(true));
        assert_eq!(
            Value::Int32(4).compare(&Value::Float32(4.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.sql_eq(&Value::Null), None);
        assert_eq!(Value::Utf8("a".into()).compare(&Value::Int64(1)), None);
        assert_eq!(
            Value::Date(1).compare(&Value::Timestamp(MICROS_PER_DAY)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn equal_values_share_a_join_key() {
        assert_eq!(Value::Int8(9).key_part(), Value::Int64(9).key_part());
        assert_eq!(Value::Float64(9.0).key_part(), Value::Int32(9).key_part());
        assert_ne!(Value::Float64(9.5).key_part(), Value::Int32(9).key_part());
        assert_eq!(Value::Null.key_part(), None);
    }

    #[test]
    fn json_conversion_is_typed_by_column() -> Result<(), DataError> {
        let j = serde_json::json!(42);
        assert_eq!(Value::from_json("c", &j, LogicalDataType::Int32)?, Value::Int32(42));
        assert_eq!(
            Value::from_json("c", &j, LogicalDataType::Float64)?,
            Value::Float64(42.0)
        );
        assert_eq!(
            Value::from_json("c", &serde_json::json!("1970-01-02"), LogicalDataType::Date)?,
            Value::Date(1)
        );
        assert_eq!(
            Value::from_json(
                "c",
                &serde_json::json!("1970-01-01T00:00:01Z"),
                LogicalDataType::Timestamp
            )?,
            Value::Timestamp(1_000_000)
        );
        assert!(Value::from_json("c", &serde_json::json!("x"), LogicalDataType::Int64).is_err());
        assert!(Value::from_json("c", &serde_json::json!(1000), LogicalDataType::Int8).is_err());

        let date = Value::Date(19_000);
        assert_eq!(
            Value::from_json("c", &date.to_json(), LogicalDataType::Date)?,
            date
        );
        Ok(())
    }

    #[test]
    fn batch_validation_normalizes_rows() -> Result<(), DataError> {
        let rows = vec![
            Row::new()
                .with("id", Value::Int32(1))
                .with("name", Value::Utf8("a".into())),
        ];
        let batch = RowBatch::new(schema(), rows)?;
        let row = &batch.rows()[0];
        assert_eq!(row.get("id"), Some(&Value::Int64(1)));
        assert_eq!(row.get("score"), Some(&Value::Null));
        assert_eq!(row.len(), 3);
        Ok(())
    }

    #[test]
    fn batch_validation_rejects_bad_rows() {
        let unknown = RowBatch::new(
            schema(),
            vec![Row::new().with("id", Value::Int64(1)).with("x", Value::Null)],
        );
        assert!(matches!(unknown, Err(DataError::UnknownColumn { row: 0, .. })));

        let null_id = RowBatch::new(schema(), vec![Row::new().with("name", Value::Null)]);
        assert!(matches!(null_id, Err(DataError::NullValue { .. })));

        let wrong_type = RowBatch::new(
            schema(),
            vec![Row::new().with("id", Value::Utf8("1".into()))],
        );
        assert!(matches!(wrong_type, Err(DataError::ValueType { .. })));

        let nan = RowBatch::new(
            schema(),
            vec![
                Row::new()
                    .with("id", Value::Int64(1))
                    .with("score", Value::Float64(f64::NAN)),
            ],
        );
        assert!(matches!(nan, Err(DataError::NonFinite { .. })));
    }

    #[test]
    fn project_fills_nulls_and_widens() -> Result<(), DataError> {
        let row = Row::new()
            .with("id", Value::Int32(4))
            .with("dropped", Value::Bool(true));
        let projected = row.project(&schema())?;
        assert_eq!(projected.get("id"), Some(&Value::Int64(4)));
        assert_eq!(projected.get("name"), Some(&Value::Null));
        assert_eq!(projected.get("dropped"), None);
        Ok(())
    }
}
