//! Log actions and commit payload definitions.
//!
//! Each commit file stores a [`CommitRecord`] containing ordered [`Action`]
//! values: file additions and removals, metadata and protocol replacements,
//! and a [`CommitInfo`] audit entry.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::LogicalSchema;

/// Highest `min_reader_version` this implementation can read.
pub const SUPPORTED_READER_VERSION: u32 = 1;

/// Highest `min_writer_version` this implementation can write.
pub const SUPPORTED_WRITER_VERSION: u32 = 2;

/// Partition column to string value; `None` encodes a null partition.
pub type PartitionValues = BTreeMap<String, Option<String>>;

/// Reference to a data file that becomes part of the table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    /// Path relative to the table root.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Number of rows, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// When the file was written.
    pub modification_time: DateTime<Utc>,
    /// False for rearrangements such as compaction that leave the logical
    /// table contents unchanged.
    pub data_change: bool,
    /// Partition values of every row in the file.
    #[serde(default)]
    pub partition_values: PartitionValues,
}

impl AddFile {
    /// The matching removal for this file.
    pub fn to_remove(&self, deletion_timestamp: DateTime<Utc>, data_change: bool) -> RemoveFile {
        RemoveFile {
            path: self.path.clone(),
            deletion_timestamp,
            data_change,
            size: Some(self.size),
            partition_values: self.partition_values.clone(),
        }
    }
}

/// Logical deletion of a data file. The physical file stays until vacuum.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    /// Path relative to the table root.
    pub path: String,
    /// When the file was logically removed.
    pub deletion_timestamp: DateTime<Utc>,
    /// False for rearrangements such as compaction.
    pub data_change: bool,
    /// File size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Partition values of the removed file.
    #[serde(default)]
    pub partition_values: PartitionValues,
}

/// Table-level metadata. A new value replaces the previous one entirely.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Stable identity of the table.
    pub id: Uuid,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current logical schema.
    pub schema: LogicalSchema,
    /// Columns the table is partitioned by, in order.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Table configuration; see [`crate::transaction_log::TableConfig`].
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    /// When the table was created.
    pub created_time: DateTime<Utc>,
}

impl Metadata {
    /// Metadata for a brand new table.
    pub fn new(
        schema: LogicalSchema,
        partition_columns: Vec<String>,
        configuration: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            description: None,
            schema,
            partition_columns,
            configuration,
            created_time: Utc::now(),
        }
    }

    /// Copy of this metadata with a different schema.
    pub fn with_schema(&self, schema: LogicalSchema) -> Self {
        Self {
            schema,
            ..self.clone()
        }
    }
}

/// Minimum reader and writer versions required to access the table.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Readers below this version must refuse the table.
    pub min_reader_version: u32,
    /// Writers below this version must refuse to commit.
    pub min_writer_version: u32,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            min_reader_version: SUPPORTED_READER_VERSION,
            min_writer_version: SUPPORTED_WRITER_VERSION,
        }
    }
}

/// What kind of operation produced a commit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Table creation (version 0).
    Create,
    /// Append or overwrite.
    Write,
    /// Merge of a source batch into the table.
    Merge,
    /// Compaction of small files.
    Optimize,
    /// Physical deletion of expired files.
    Vacuum,
    /// Low-level commit of caller-supplied actions.
    Commit,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Create => "CREATE",
            OperationKind::Write => "WRITE",
            OperationKind::Merge => "MERGE",
            OperationKind::Optimize => "OPTIMIZE",
            OperationKind::Vacuum => "VACUUM",
            OperationKind::Commit => "COMMIT",
        };
        f.write_str(name)
    }
}

/// Audit information recorded with every commit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Commit timestamp (same as the record's).
    pub timestamp: DateTime<Utc>,
    /// Operation that produced the commit.
    pub operation: OperationKind,
    /// Operation parameters, for example the write mode.
    #[serde(default)]
    pub operation_parameters: BTreeMap<String, String>,
    /// Counters such as rows written or files removed.
    #[serde(default)]
    pub operation_metrics: BTreeMap<String, u64>,
    /// Version the writer read before committing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<u64>,
    /// True when the commit only adds data without reading any.
    #[serde(default)]
    pub is_blind_append: bool,
    /// Writer identification.
    #[serde(default)]
    pub engine_info: String,
}

/// Engine identification written into every [`CommitInfo`].
pub fn engine_info() -> String {
    format!("lakelog/{}", env!("CARGO_PKG_VERSION"))
}

/// An action recorded in a commit.
///
/// Actions within a commit are applied in order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// A data file becomes live.
    Add(AddFile),
    /// A data file is logically deleted.
    Remove(RemoveFile),
    /// Table metadata is replaced.
    Metadata(Metadata),
    /// Protocol versions are replaced.
    Protocol(Protocol),
    /// Audit entry.
    CommitInfo(CommitInfo),
}

/// A single, immutable commit in the log.
///
/// Commits are written to files such as
/// `_table_log/00000000000000000001.json`. The version field must match the
/// file name; `read_version` records the snapshot the writer started from
/// (`None` for the creating commit).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    /// Version number of this commit, gap-free from 0.
    pub version: u64,
    /// Version the writer read before preparing the commit.
    pub read_version: Option<u64>,
    /// Commit creation timestamp, stored as RFC3339 UTC.
    pub timestamp: DateTime<Utc>,
    /// Operation that produced the commit.
    pub operation: OperationKind,
    /// Ordered actions.
    pub actions: Vec<Action>,
}

impl CommitRecord {
    /// File additions in this commit.
    pub fn adds(&self) -> impl Iterator<Item = &AddFile> {
        self.actions.iter().filter_map(|a| match a {
            Action::Add(add) => Some(add),
            _ => None,
        })
    }

    /// File removals in this commit.
    pub fn removes(&self) -> impl Iterator<Item = &RemoveFile> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove(rm) => Some(rm),
            _ => None,
        })
    }

    /// The last metadata action, if any.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.actions.iter().rev().find_map(|a| match a {
            Action::Metadata(m) => Some(m),
            _ => None,
        })
    }

    /// The last protocol action, if any.
    pub fn protocol(&self) -> Option<&Protocol> {
        self.actions.iter().rev().find_map(|a| match a {
            Action::Protocol(p) => Some(p),
            _ => None,
        })
    }

    /// The audit entry, if any.
    pub fn commit_info(&self) -> Option<&CommitInfo> {
        self.actions.iter().find_map(|a| match a {
            Action::CommitInfo(info) => Some(info),
            _ => None,
        })
    }

    /// Every path this commit adds or removes.
    pub fn touched_paths(&self) -> BTreeSet<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Add(add) => Some(add.path.as_str()),
                Action::Remove(rm) => Some(rm.path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// True if the commit replaces metadata or protocol.
    pub fn changes_metadata(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, Action::Metadata(_) | Action::Protocol(_)))
    }
}
