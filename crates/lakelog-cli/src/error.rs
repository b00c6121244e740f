use std::path::PathBuf;

use lakelog_core::{TableError, data::DataError, schema::LogicalSchemaError, storage::StorageError};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid table location {location}: {source}"))]
    Location {
        location: String,
        source: StorageError,
    },

    #[snafu(display("Invalid --column '{spec}': expected NAME:TYPE or NAME:TYPE:not-null"))]
    InvalidColumn { spec: String },

    #[snafu(display("Invalid --{flag} '{spec}': expected KEY=VALUE"))]
    InvalidKeyValue { flag: String, spec: String },

    #[snafu(display("Invalid schema: {source}"))]
    InvalidSchema { source: LogicalSchemaError },

    #[snafu(display("Invalid --timestamp '{spec}': expected an RFC 3339 timestamp"))]
    InvalidTimestamp {
        spec: String,
        source: chrono::ParseError,
    },

    #[snafu(display("Failed to read rows from {}", path.display()))]
    ReadInput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Line {line} of {} is not a JSON object", path.display()))]
    NotAnObject { path: PathBuf, line: usize },

    #[snafu(display("Line {line} of {} is not valid JSON: {source}", path.display()))]
    ParseLine {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("Line {line} of {}: {source}", path.display()))]
    ConvertLine {
        path: PathBuf,
        line: usize,
        source: DataError,
    },

    #[snafu(display("Rows do not fit the table schema: {source}"))]
    BuildBatch { source: DataError },

    #[snafu(display("merge needs at least one --on column"))]
    MissingJoinColumns,

    #[snafu(display(
        "Failed to create table at {table}: {source}. \
         Ensure the directory is writable and not already a table."
    ))]
    CreateTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Failed to open table at {table}: {source}"))]
    OpenTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("{operation} failed for table {table}: {source}"))]
    Operation {
        operation: String,
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Failed to write output: {source}"))]
    WriteOutput { source: std::io::Error },

    #[snafu(display("Failed to encode output: {source}"))]
    EncodeOutput { source: serde_json::Error },
}
