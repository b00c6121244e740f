//! Append-only transaction log and the state derived from it.
//!
//! This module implements the metadata layer of a table and defines the
//! logical model written to and read from the `_table_log/` directory.
//!
//! - An append-only commit log stored as one JSON file per version under
//!   `_table_log/` (for example, `_table_log/00000000000000000000.json`).
//!   Versions are gap-free and start at 0, the creating commit.
//! - An advisory `CURRENT` hint that lets readers skip most of the listing,
//!   and a `_history_floor` pointer raised by vacuum.
//! - Strongly typed actions ([`Action`], [`AddFile`], [`RemoveFile`],
//!   [`Metadata`], [`Protocol`], [`CommitInfo`]).
//! - [`Snapshot`], the table state materialized by replaying commits.
//! - [`TableConfig`], the typed view of `Metadata.configuration`.
//!
//! The log is designed to be:
//!
//! - **Append-only**: commits never mutate existing files.
//! - **Exclusive per version**: a version file is created with
//!   create-if-absent semantics, so at most one writer owns each version.
//! - **Human-inspectable**: JSON commits make it easy to debug with basic
//!   tools.
//!
//! Each `*.json` file contains a single [`CommitRecord`], for example:
//!
//! ```json
//! {
//!   "version": 1,
//!   "readVersion": 0,
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "operation": "WRITE",
//!   "actions": [
//!     { "add": { "path": "data/part-4f1c.jsonl", "size": 120, "rowCount": 3,
//!                "modificationTime": "2025-01-01T00:00:00Z",
//!                "dataChange": true, "partitionValues": {} } },
//!     { "commitInfo": { "timestamp": "2025-01-01T00:00:00Z",
//!                       "operation": "WRITE", "isBlindAppend": true } }
//!   ]
//! }
//! ```
pub mod actions;
pub mod log_store;
pub mod snapshot;
pub mod table_config;

pub use actions::{
    Action, AddFile, CommitInfo, CommitRecord, Metadata, OperationKind, PartitionValues, Protocol,
    RemoveFile,
};
pub use log_store::TransactionLogStore;
pub use snapshot::{Snapshot, SnapshotSpec};
pub use table_config::TableConfig;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the commit log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// Another writer already created this version.
    #[snafu(display("Commit version {version} already exists"))]
    VersionExists {
        /// The version that was lost.
        version: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The requested version has no commit file.
    #[snafu(display("Commit version {version} does not exist"))]
    MissingVersion {
        /// The version that was requested.
        version: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the log.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log is in an unexpected / malformed state.
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendError;
    use std::error::Error;

    #[test]
    fn storage_errors_keep_their_source() {
        let storage = StorageError::OtherIo {
            path: "_table_log/00000000000000000001.json".to_string(),
            source: BackendError::Local(std::io::Error::other("disk on fire")),
            backtrace: Backtrace::capture(),
        };
        let err = CommitError::Storage { source: storage };

        assert!(err.to_string().contains("commit log"));
        let source = err.source().expect("source");
        assert!(source.to_string().contains("00000000000000000001.json"));
    }

    #[test]
    fn version_errors_name_the_version() {
        let err = VersionExistsSnafu { version: 7u64 }.build();
        assert_eq!(err.to_string(), "Commit version 7 already exists");
        let err = MissingVersionSnafu { version: 9u64 }.build();
        assert_eq!(err.to_string(), "Commit version 9 does not exist");
    }
}
