//! Error types and SNAFU context selectors for the table API.
//!
//! This module centralizes the `TableError` enum used by the public API and
//! exposes context selectors (via `#[snafu(visibility(pub(crate)))]`) so
//! the transaction, merge and maintenance modules can attach context without
//! re-exporting everything at the crate root. Keep new variants here to
//! ensure consistent user-facing messages.

use snafu::prelude::*;

use crate::{
    data::DataError,
    schema::evolution::SchemaCompatibilityError,
    storage::StorageError,
    transaction_log::{
        CommitError, SnapshotSpec, snapshot::SnapshotError, table_config::TableConfigError,
    },
};

/// Errors from table operations.
///
/// Each variant carries enough context for callers to surface actionable
/// messages to users or decide whether to retry (see
/// [`TableError::is_retryable`]).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// A concurrent commit invalidated this transaction.
    #[snafu(display(
        "Concurrent modification: transaction read version {read_version}, {reason}"
    ))]
    ConcurrentModification {
        /// The snapshot version the transaction started from.
        read_version: u64,
        /// The first intervening version that conflicted, if any.
        conflicting_version: Option<u64>,
        /// What conflicted.
        reason: String,
    },

    /// The incoming schema cannot be reconciled with the table schema.
    #[snafu(display("Schema mismatch: {source}"))]
    SchemaMismatch {
        /// Underlying schema compatibility error.
        source: SchemaCompatibilityError,
    },

    /// A merge would modify one target row from several source rows.
    #[snafu(display("Ambiguous merge: {reason}"))]
    AmbiguousMerge {
        /// Which rows collided.
        reason: String,
    },

    /// The requested version is not readable.
    #[snafu(display(
        "Version not found: cannot read {requested}; readable versions are {earliest} through {latest}"
    ))]
    VersionNotFound {
        /// What was requested.
        requested: SnapshotSpec,
        /// Oldest readable version.
        earliest: u64,
        /// Latest committed version.
        latest: u64,
    },

    /// The table requires a newer reader or writer.
    #[snafu(display(
        "Unsupported protocol: table requires {kind} version {required}, supported is {supported}"
    ))]
    ProtocolUnsupported {
        /// `reader` or `writer`.
        kind: &'static str,
        /// Required version.
        required: u32,
        /// Supported version.
        supported: u32,
    },

    /// Storage error while accessing table data.
    #[snafu(display("I/O failure while accessing table data: {source}"))]
    IoFailure {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Any error coming from the transaction log.
    #[snafu(display("Transaction log error: {source}"))]
    TransactionLog {
        /// Underlying transaction log / commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// The log holds something this implementation cannot interpret.
    #[snafu(display("Corrupt table log: {reason}"))]
    CorruptLog {
        /// What is wrong.
        reason: String,
    },

    /// Attempt to create a table where commits already exist.
    #[snafu(display("Table already exists at {location} (latest version {version})"))]
    AlreadyExists {
        /// Table root.
        location: String,
        /// Latest existing version.
        version: u64,
    },

    /// Opening a location that holds no table log.
    #[snafu(display("No table found at {location}"))]
    NotATable {
        /// Table root.
        location: String,
    },

    /// A recognised configuration key holds an invalid value.
    #[snafu(display("Invalid table configuration: {source}"))]
    InvalidConfig {
        /// Underlying configuration error.
        source: TableConfigError,
    },

    /// Vacuum retention is below the safety threshold.
    #[snafu(display(
        "Retention of {requested_hours}h is shorter than the safe minimum of {minimum_hours}h; \
         disable retentionDurationCheck.enabled to override"
    ))]
    RetentionTooShort {
        /// Requested retention in hours.
        requested_hours: i64,
        /// Minimum allowed with the check enabled.
        minimum_hours: u64,
    },

    /// Rows failed validation or could not be decoded.
    #[snafu(display("Invalid data: {source}"))]
    InvalidData {
        /// Underlying row error.
        source: DataError,
    },

    /// A merge expression refers to something that does not exist.
    #[snafu(display("Invalid expression: {reason}"))]
    InvalidExpression {
        /// What is wrong.
        reason: String,
    },

    /// The request is not valid for this table or transaction.
    #[snafu(display("Invalid operation: {reason}"))]
    InvalidOperation {
        /// What is wrong.
        reason: String,
    },

    /// The commit was cancelled before it could be written.
    #[snafu(display("Commit cancelled after {attempts} attempt(s)"))]
    Cancelled {
        /// How many attempts were made.
        attempts: u32,
    },
}

impl TableError {
    /// True when retrying the whole operation on a fresh snapshot may
    /// succeed: concurrent modifications and transient I/O failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            TableError::ConcurrentModification { .. } | TableError::IoFailure { .. } => true,
            TableError::TransactionLog { source, .. } => {
                matches!(source, CommitError::Storage { .. })
            }
            _ => false,
        }
    }
}

impl From<SnapshotError> for TableError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::EmptyLog => TableError::CorruptLog {
                reason: "the table log has no commits".to_string(),
            },
            SnapshotError::VersionNotFound {
                requested,
                earliest,
                latest,
            } => TableError::VersionNotFound {
                requested,
                earliest,
                latest,
            },
            SnapshotError::ProtocolUnsupported {
                required,
                supported,
            } => TableError::ProtocolUnsupported {
                kind: "reader",
                required,
                supported,
            },
            SnapshotError::MissingTableState { .. } => TableError::CorruptLog {
                reason: err.to_string(),
            },
            SnapshotError::InvalidConfig { source } => TableError::InvalidConfig { source },
            SnapshotError::Log { source } => log_error(source),
        }
    }
}

/// Map a log error, reporting malformed commits as [`TableError::CorruptLog`].
pub(crate) fn log_error(source: CommitError) -> TableError {
    match source {
        CommitError::CorruptState { msg, .. } => TableError::CorruptLog { reason: msg },
        other => TableError::TransactionLog { source: other },
    }
}

impl From<DataError> for TableError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::Storage { source } => TableError::IoFailure { source },
            other => TableError::InvalidData { source: other },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendError;
    use snafu::Backtrace;

    fn io() -> StorageError {
        StorageError::OtherIo {
            path: "data/part-1.jsonl".to_string(),
            source: BackendError::Local(std::io::Error::other("boom")),
            backtrace: Backtrace::capture(),
        }
    }

    #[test]
    fn retryable_errors() {
        assert!(
            ConcurrentModificationSnafu {
                read_version: 1u64,
                conflicting_version: Some(2u64),
                reason: "x",
            }
            .build()
            .is_retryable()
        );
        assert!(TableError::IoFailure { source: io() }.is_retryable());
        assert!(log_error(CommitError::Storage { source: io() }).is_retryable());

        assert!(!AmbiguousMergeSnafu { reason: "x" }.build().is_retryable());
        assert!(!CancelledSnafu { attempts: 1u32 }.build().is_retryable());
    }

    #[test]
    fn snapshot_errors_map_onto_table_errors() {
        let err: TableError = SnapshotError::VersionNotFound {
            requested: SnapshotSpec::Version(9),
            earliest: 0,
            latest: 3,
        }
        .into();
        assert!(matches!(
            err,
            TableError::VersionNotFound {
                requested: SnapshotSpec::Version(9),
                ..
            }
        ));

        let err: TableError = SnapshotError::Log {
            source: CommitError::CorruptState {
                msg: "bad".to_string(),
                backtrace: Backtrace::capture(),
            },
        }
        .into();
        assert!(matches!(err, TableError::CorruptLog { .. }));

        let err: TableError = DataError::Storage { source: io() }.into();
        assert!(matches!(err, TableError::IoFailure { .. }));
    }
}
