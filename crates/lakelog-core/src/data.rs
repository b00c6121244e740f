//! Row-level data handled by writers, merge and compaction.
//!
//! - [`value`]: typed cell values, rows and validated row batches.
//! - [`row_file`]: the built-in JSON-lines data file format.
//!
//! The transaction log never looks inside data files; it only references
//! them by path, size, row count and partition values.
pub mod row_file;
pub mod value;

pub use row_file::{
    partition_values_of, read_row_file, read_row_files, write_partitioned, write_row_file,
};
pub use value::{Row, RowBatch, Value};

use snafu::prelude::*;

use crate::{schema::LogicalDataType, storage::StorageError};

/// Errors raised while validating, encoding or decoding rows.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DataError {
    /// A row carries a column that the batch schema does not declare.
    #[snafu(display("Row {row} has column {column} which is not in the schema"))]
    UnknownColumn {
        /// Index of the offending row.
        row: usize,
        /// The undeclared column.
        column: String,
    },

    /// A non-nullable column is null or absent.
    #[snafu(display("Row {row}: column {column} is not nullable"))]
    NullValue {
        /// Index of the offending row.
        row: usize,
        /// The column name.
        column: String,
    },

    /// A value does not fit the declared column type.
    #[snafu(display("Column {column}: expected {expected}, found {found}"))]
    ValueType {
        /// The column name.
        column: String,
        /// Declared type.
        expected: LogicalDataType,
        /// Description of the offending value.
        found: String,
    },

    /// Floating point values must be finite.
    #[snafu(display("Row {row}: column {column} holds a non-finite float"))]
    NonFinite {
        /// Index of the offending row.
        row: usize,
        /// The column name.
        column: String,
    },

    /// A JSON value could not be converted into a cell value.
    #[snafu(display("Cannot convert JSON value for column {column}: {reason}"))]
    JsonValue {
        /// The column name.
        column: String,
        /// Why the conversion failed.
        reason: String,
    },

    /// Encoding rows for a data file failed.
    #[snafu(display("Failed to encode rows: {source}"))]
    Encode {
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// A data file contains an undecodable line.
    #[snafu(display("Failed to decode {path} line {line}: {source}"))]
    Decode {
        /// Data file path.
        path: String,
        /// 1-based line number.
        line: usize,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Reading or writing a data file failed.
    #[snafu(display("Data file I/O failed: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Result alias for row-level operations.
pub type DataResult<T> = Result<T, DataError>;
