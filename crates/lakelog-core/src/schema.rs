//! Logical schema definitions stored in table metadata.
//!
//! The log records schemas as an ordered list of [`LogicalField`] values with
//! a small set of primitive [`LogicalDataType`]s. Schemas convert to Arrow so
//! external query engines can plan against them; the evolution rules used
//! by writers live in [`evolution`].
pub mod evolution;

use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Logical data types that can be stored in the table schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LogicalDataType {
    /// Boolean value.
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 encoded string.
    Utf8,
    /// Variable-length binary data.
    Binary,
    /// Calendar date, days since the Unix epoch.
    Date,
    /// UTC timestamp with microsecond precision.
    Timestamp,
}

impl LogicalDataType {
    /// Arrow type used when exposing the schema to query engines.
    pub fn to_arrow_datatype(self) -> DataType {
        match self {
            LogicalDataType::Bool => DataType::Boolean,
            LogicalDataType::Int8 => DataType::Int8,
            LogicalDataType::Int16 => DataType::Int16,
            LogicalDataType::Int32 => DataType::Int32,
            LogicalDataType::Int64 => DataType::Int64,
            LogicalDataType::Float32 => DataType::Float32,
            LogicalDataType::Float64 => DataType::Float64,
            LogicalDataType::Utf8 => DataType::Utf8,
            LogicalDataType::Binary => DataType::Binary,
            LogicalDataType::Date => DataType::Date32,
            LogicalDataType::Timestamp => {
                DataType::Timestamp(TimeUnit::Microsecond, Some(Arc::from("UTC")))
            }
        }
    }

    /// True for the integer and floating point types.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            LogicalDataType::Int8
                | LogicalDataType::Int16
                | LogicalDataType::Int32
                | LogicalDataType::Int64
                | LogicalDataType::Float32
                | LogicalDataType::Float64
        )
    }
}

impl fmt::Display for LogicalDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalDataType::Bool => "bool",
            LogicalDataType::Int8 => "int8",
            LogicalDataType::Int16 => "int16",
            LogicalDataType::Int32 => "int32",
            LogicalDataType::Int64 => "int64",
            LogicalDataType::Float32 => "float32",
            LogicalDataType::Float64 => "float64",
            LogicalDataType::Utf8 => "utf8",
            LogicalDataType::Binary => "binary",
            LogicalDataType::Date => "date",
            LogicalDataType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Error returned when a type name cannot be parsed.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(display("Unknown data type {name:?}"))]
pub struct ParseDataTypeError {
    /// The unrecognised name.
    pub name: String,
}

impl FromStr for LogicalDataType {
    type Err = ParseDataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => LogicalDataType::Bool,
            "int8" | "tinyint" | "byte" => LogicalDataType::Int8,
            "int16" | "smallint" | "short" => LogicalDataType::Int16,
            "int32" | "int" | "integer" => LogicalDataType::Int32,
            "int64" | "bigint" | "long" => LogicalDataType::Int64,
            "float32" | "float" | "real" => LogicalDataType::Float32,
            "float64" | "double" => LogicalDataType::Float64,
            "utf8" | "string" | "varchar" => LogicalDataType::Utf8,
            "binary" | "bytes" => LogicalDataType::Binary,
            "date" => LogicalDataType::Date,
            "timestamp" => LogicalDataType::Timestamp,
            _ => {
                return ParseDataTypeSnafu {
                    name: s.to_string(),
                }
                .fail();
            }
        };
        Ok(dt)
    }
}

/// Logical column definition in a schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogicalField {
    /// Column name as stored in the schema.
    pub name: String,
    /// Logical data type for the column.
    pub data_type: LogicalDataType,
    /// Whether the column allows null values.
    #[serde(default)]
    pub nullable: bool,
}

impl LogicalField {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, data_type: LogicalDataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    fn to_arrow_field(&self) -> Field {
        Field::new(
            self.name.clone(),
            self.data_type.to_arrow_datatype(),
            self.nullable,
        )
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?: {}", self.name, self.data_type)
        } else {
            write!(f, "{}: {}", self.name, self.data_type)
        }
    }
}

/// Ordered collection of logical columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<LogicalField>", into = "Vec<LogicalField>")]
pub struct LogicalSchema {
    columns: Vec<LogicalField>,
}

/// Errors that can occur while constructing a logical schema.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum LogicalSchemaError {
    /// Duplicate column names are not allowed.
    #[snafu(display("Duplicate column name: {column}"))]
    DuplicateColumn {
        /// The duplicate column name.
        column: String,
    },

    /// Column names must be non-empty.
    #[snafu(display("Column name must be non-empty"))]
    EmptyColumnName,
}

impl LogicalSchema {
    /// Construct a validated logical schema.
    pub fn new(columns: Vec<LogicalField>) -> Result<Self, LogicalSchemaError> {
        let mut seen = HashSet::new();
        for col in &columns {
            ensure!(!col.name.trim().is_empty(), EmptyColumnNameSnafu);
            if !seen.insert(col.name.clone()) {
                return DuplicateColumnSnafu {
                    column: col.name.clone(),
                }
                .fail();
            }
        }

        Ok(Self { columns })
    }

    /// A schema with no columns.
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Borrow the logical columns.
    pub fn columns(&self) -> &[LogicalField] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn field(&self, name: &str) -> Option<&LogicalField> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True if a column with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Column names in schema order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True if the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Convert this logical schema to an owned Arrow [`Schema`].
    pub fn to_arrow_schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(LogicalField::to_arrow_field)
                .collect::<Vec<_>>(),
        )
    }

    /// Convert this logical schema to a shared Arrow [`SchemaRef`].
    pub fn to_arrow_schema_ref(&self) -> SchemaRef {
        Arc::new(self.to_arrow_schema())
    }
}

impl TryFrom<Vec<LogicalField>> for LogicalSchema {
    type Error = LogicalSchemaError;

    fn try_from(columns: Vec<LogicalField>) -> Result<Self, Self::Error> {
        LogicalSchema::new(columns)
    }
}

impl From<LogicalSchema> for Vec<LogicalField> {
    fn from(schema: LogicalSchema) -> Self {
        schema.columns
    }
}

impl fmt::Display for LogicalSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{col}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogicalSchema {
        LogicalSchema::new(vec![
            LogicalField::new("customerId", LogicalDataType::Int64, false),
            LogicalField::new("name", LogicalDataType::Utf8, true),
            LogicalField::new("signup", LogicalDataType::Date, true),
        ])
        .expect("valid schema")
    }

    #[test]
    fn rejects_duplicate_and_empty_names() {
        let dup = LogicalSchema::new(vec![
            LogicalField::new("a", LogicalDataType::Int32, false),
            LogicalField::new("a", LogicalDataType::Int64, false),
        ]);
        assert_eq!(
            dup.expect_err("duplicate"),
            LogicalSchemaError::DuplicateColumn {
                column: "a".to_string()
            }
        );

        let empty = LogicalSchema::new(vec![LogicalField::new(" ", LogicalDataType::Bool, true)]);
        assert_eq!(
            empty.expect_err("empty"),
            LogicalSchemaError::EmptyColumnName
        );
    }

    #[test]
    fn json_is_a_plain_field_list_and_validates_on_read() {
        let json = serde_json::to_string(&sample()).expect("serialize");
        assert!(json.starts_with('['));

        let bad = r#"[{"name":"a","data_type":"Int32"},{"name":"a","data_type":"Utf8"}]"#;
        assert!(serde_json::from_str::<LogicalSchema>(bad).is_err());

        let nullable_default = r#"[{"name":"a","data_type":"Int32"}]"#;
        let schema: LogicalSchema = serde_json::from_str(nullable_default).expect("deserialize");
        assert!(!schema.columns()[0].nullable);
    }

    #[test]
    fn converts_to_arrow() {
        let arrow = sample().to_arrow_schema();
        assert_eq!(arrow.fields().len(), 3);
        assert_eq!(arrow.field(0).data_type(), &DataType::Int64);
        assert!(!arrow.field(0).is_nullable());
        assert_eq!(arrow.field(2).data_type(), &DataType::Date32);
    }

    #[test]
    fn parses_type_names() {
        assert_eq!("BIGINT".parse::<LogicalDataType>(), Ok(LogicalDataType::Int64));
        assert_eq!("string".parse::<LogicalDataType>(), Ok(LogicalDataType::Utf8));
        assert!("decimal".parse::<LogicalDataType>().is_err());
        for dt in [
            LogicalDataType::Bool,
            LogicalDataType::Int8,
            LogicalDataType::Float32,
            LogicalDataType::Timestamp,
        ] {
            assert_eq!(dt.to_string().parse::<LogicalDataType>(), Ok(dt));
        }
    }
}
