//! Reconstructing table state at a version by replaying log commits.
//!
//! A [`Snapshot`] is a pure function of the commits `0..=version`: replaying
//! them in order folds `add` actions into the live file set, moves removed
//! files into tombstones and keeps the last metadata and protocol. Two
//! builds of the same version are always equal, which is what makes
//! historical reads repeatable.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use snafu::prelude::*;

use crate::schema::LogicalSchema;
use crate::transaction_log::{
    Action, AddFile, CommitError, CommitRecord, Metadata, Protocol, RemoveFile, TableConfig,
    TransactionLogStore, actions::SUPPORTED_READER_VERSION,
    table_config::TableConfigError,
};

/// Which version of the table to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSpec {
    /// The latest committed version.
    Latest,
    /// An exact version.
    Version(u64),
    /// The latest version whose commit timestamp is at or before this time.
    Timestamp(DateTime<Utc>),
}

impl std::fmt::Display for SnapshotSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotSpec::Latest => f.write_str("latest"),
            SnapshotSpec::Version(v) => write!(f, "version {v}"),
            SnapshotSpec::Timestamp(ts) => write!(f, "timestamp {}", ts.to_rfc3339()),
        }
    }
}

/// Errors raised while building a snapshot.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SnapshotError {
    /// The log has no commits at all.
    #[snafu(display("No commits found in the table log"))]
    EmptyLog,

    /// The requested version is not readable.
    #[snafu(display(
        "Cannot read {requested}: readable versions are {earliest} through {latest}"
    ))]
    VersionNotFound {
        /// What was requested.
        requested: SnapshotSpec,
        /// Oldest readable version (the history floor).
        earliest: u64,
        /// Latest committed version.
        latest: u64,
    },

    /// The table requires a newer reader.
    #[snafu(display(
        "Table requires reader version {required}, this reader supports {supported}"
    ))]
    ProtocolUnsupported {
        /// The table's `min_reader_version`.
        required: u32,
        /// What this implementation supports.
        supported: u32,
    },

    /// The replayed commits never set metadata or protocol.
    #[snafu(display("No {what} found in commits up to version {version}"))]
    MissingTableState {
        /// `metadata` or `protocol`.
        what: &'static str,
        /// The version replayed to.
        version: u64,
    },

    /// The table configuration holds an invalid value.
    #[snafu(display("Invalid table configuration: {source}"))]
    InvalidConfig {
        /// Underlying configuration error.
        source: TableConfigError,
    },

    /// Reading the log failed.
    #[snafu(display("Failed to read the table log: {source}"))]
    Log {
        /// Underlying log error.
        source: CommitError,
    },
}

/// A removed file together with the version that removed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// The remove action.
    pub remove: RemoveFile,
    /// Version of the commit that carried the removal.
    pub removed_in_version: u64,
}

/// In-memory view of the table at one version, reconstructed from the log.
///
/// Invariants:
/// - `files` holds at most one [`AddFile`] per path: exactly the files added
///   and not subsequently removed in commits `0..=version`.
/// - A path is never both live and tombstoned.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Version this snapshot reflects.
    pub version: u64,
    /// Timestamp of the commit at `version`.
    pub timestamp: DateTime<Utc>,
    /// Latest metadata at `version`.
    pub metadata: Metadata,
    /// Latest protocol at `version`.
    pub protocol: Protocol,
    /// Live data files keyed by path.
    pub files: BTreeMap<String, AddFile>,
    /// Removed files keyed by path.
    pub tombstones: BTreeMap<String, Tombstone>,
    config: TableConfig,
}

/// Partial state accumulated while replaying.
#[derive(Default)]
struct Replay {
    version: u64,
    timestamp: Option<DateTime<Utc>>,
    metadata: Option<Metadata>,
    protocol: Option<Protocol>,
    files: BTreeMap<String, AddFile>,
    tombstones: BTreeMap<String, Tombstone>,
}

impl Replay {
    fn apply(&mut self, commit: CommitRecord) {
        self.version = commit.version;
        self.timestamp = Some(commit.timestamp);
        for action in commit.actions {
            match action {
                Action::Add(add) => {
                    self.tombstones.remove(&add.path);
                    self.files.insert(add.path.clone(), add);
                }
                Action::Remove(remove) => {
                    self.files.remove(&remove.path);
                    self.tombstones.insert(
                        remove.path.clone(),
                        Tombstone {
                            remove,
                            removed_in_version: commit.version,
                        },
                    );
                }
                Action::Metadata(meta) => self.metadata = Some(meta),
                Action::Protocol(protocol) => self.protocol = Some(protocol),
                Action::CommitInfo(_) => {}
            }
        }
    }

    fn finish(self) -> Result<Snapshot, SnapshotError> {
        let version = self.version;
        let metadata = self.metadata.context(MissingTableStateSnafu {
            what: "metadata",
            version,
        })?;
        let protocol = self.protocol.context(MissingTableStateSnafu {
            what: "protocol",
            version,
        })?;
        let timestamp = self.timestamp.unwrap_or(metadata.created_time);
        let config = TableConfig::from_configuration(&metadata.configuration)
            .context(InvalidConfigSnafu)?;

        ensure_readable(&protocol)?;

        Ok(Snapshot {
            version,
            timestamp,
            metadata,
            protocol,
            files: self.files,
            tombstones: self.tombstones,
            config,
        })
    }
}

fn ensure_readable(protocol: &Protocol) -> Result<(), SnapshotError> {
    ensure!(
        protocol.min_reader_version <= SUPPORTED_READER_VERSION,
        ProtocolUnsupportedSnafu {
            required: protocol.min_reader_version,
            supported: SUPPORTED_READER_VERSION,
        }
    );
    Ok(())
}

impl Snapshot {
    /// Build the snapshot selected by `spec`.
    ///
    /// Versions above the latest commit or below the history floor, and
    /// timestamps earlier than the creating commit, fail with
    /// [`SnapshotError::VersionNotFound`].
    pub async fn build(
        store: &TransactionLogStore,
        spec: SnapshotSpec,
    ) -> Result<Snapshot, SnapshotError> {
        let latest = store
            .latest_version()
            .await
            .context(LogSnafu)?
            .context(EmptyLogSnafu)?;
        let floor = store.load_history_floor().await.context(LogSnafu)?;

        let not_found = || {
            VersionNotFoundSnafu {
                requested: spec,
                earliest: floor,
                latest,
            }
            .build()
        };

        let target = match spec {
            SnapshotSpec::Latest => latest,
            SnapshotSpec::Version(v) => v,
            SnapshotSpec::Timestamp(ts) => resolve_timestamp(store, ts, latest)
                .await?
                .ok_or_else(not_found)?,
        };
        if target > latest || target < floor {
            return Err(not_found());
        }

        debug!("building snapshot at version {target} ({spec})");
        Self::replay_to(store, target).await
    }

    /// Replay commits `0..=version` without consulting the history floor.
    pub(crate) async fn replay_to(
        store: &TransactionLogStore,
        version: u64,
    ) -> Result<Snapshot, SnapshotError> {
        let mut replay = Replay::default();
        for commit in store.read_commits(0, version).await.context(LogSnafu)? {
            replay.apply(commit);
        }
        replay.finish()
    }

    /// Fold commits newer than this snapshot into it, up to the latest
    /// version. Returns how many commits were applied.
    pub async fn advance(&mut self, store: &TransactionLogStore) -> Result<usize, SnapshotError> {
        let Some(latest) = store.latest_version().await.context(LogSnafu)? else {
            return Ok(0);
        };
        if latest <= self.version {
            return Ok(0);
        }

        let commits = store
            .read_commits(self.version + 1, latest)
            .await
            .context(LogSnafu)?;
        let applied = commits.len();

        let mut replay = Replay {
            version: self.version,
            timestamp: Some(self.timestamp),
            metadata: Some(self.metadata.clone()),
            protocol: Some(self.protocol),
            files: self.files.clone(),
            tombstones: self.tombstones.clone(),
        };
        for commit in commits {
            replay.apply(commit);
        }

        *self = replay.finish()?;
        Ok(applied)
    }

    /// The table schema.
    pub fn schema(&self) -> &LogicalSchema {
        &self.metadata.schema
    }

    /// Partition columns, in order.
    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// Parsed table configuration.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Number of live files.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Total size of the live files in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Total row count of the live files, where known.
    pub fn total_rows(&self) -> u64 {
        self.files.values().filter_map(|f| f.row_count).sum()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        metadata: Metadata,
        files: BTreeMap<String, AddFile>,
        config: TableConfig,
    ) -> Self {
        Self {
            version: 0,
            timestamp: metadata.created_time,
            metadata,
            protocol: Protocol::default(),
            files,
            tombstones: BTreeMap::new(),
            config,
        }
    }
}

/// Latest version whose commit timestamp is `<= ts`, or `None` when `ts`
/// precedes the creating commit.
///
/// Commit timestamps are strictly increasing, so a binary search over point
/// reads suffices.
async fn resolve_timestamp(
    store: &TransactionLogStore,
    ts: DateTime<Utc>,
    latest: u64,
) -> Result<Option<u64>, SnapshotError> {
    let (mut lo, mut hi) = (0u64, latest);
    let mut found = None;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let commit = store.read_commit(mid).await.context(LogSnafu)?;
        if commit.timestamp <= ts {
            found = Some(mid);
            lo = mid + 1;
        } else if mid == 0 {
            break;
        } else {
            hi = mid - 1;
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LogicalDataType, LogicalField};
    use crate::storage::TableLocation;
    use crate::transaction_log::{CommitInfo, OperationKind};
    use chrono::Duration;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_log_store() -> (TempDir, TransactionLogStore) {
        let tmp = TempDir::new().expect("create temp dir");
        let store = TransactionLogStore::new(TableLocation::local(tmp.path()));
        (tmp, store)
    }

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn add(path: &str) -> Action {
        Action::Add(AddFile {
            path: path.to_string(),
            size: 100,
            row_count: Some(1),
            modification_time: base_time(),
            data_change: true,
            partition_values: BTreeMap::new(),
        })
    }

    fn remove(path: &str) -> Action {
        Action::Remove(RemoveFile {
            path: path.to_string(),
            deletion_timestamp: base_time(),
            data_change: true,
            size: Some(100),
            partition_values: BTreeMap::new(),
        })
    }

    fn metadata() -> Metadata {
        let schema = LogicalSchema::new(vec![LogicalField::new(
            "id",
            LogicalDataType::Int64,
            false,
        )])
        .expect("schema");
        Metadata::new(schema, vec![], BTreeMap::new())
    }

    async fn commit(
        store: &TransactionLogStore,
        version: u64,
        mut actions: Vec<Action>,
    ) -> Result<(), CommitError> {
        let timestamp = base_time() + Duration::minutes(version as i64);
        actions.push(Action::CommitInfo(CommitInfo {
            timestamp,
            operation: OperationKind::Commit,
            operation_parameters: BTreeMap::new(),
            operation_metrics: BTreeMap::new(),
            read_version: version.checked_sub(1),
            is_blind_append: false,
            engine_info: "test".to_string(),
        }));
        store
            .write_commit(&CommitRecord {
                version,
                read_version: version.checked_sub(1),
                timestamp,
                operation: OperationKind::Commit,
                actions,
            })
            .await
    }

    async fn seed(store: &TransactionLogStore) -> Result<(), CommitError> {
        commit(
            store,
            0,
            vec![
                Action::Metadata(metadata()),
                Action::Protocol(Protocol::default()),
            ],
        )
        .await?;
        commit(store, 1, vec![add("a"), add("b")]).await?;
        commit(store, 2, vec![remove("a"), add("c")]).await?;
        commit(store, 3, vec![add("a")]).await
    }

    #[tokio::test]
    async fn replay_folds_adds_and_removes() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        seed(&store).await?;

        let v2 = Snapshot::build(&store, SnapshotSpec::Version(2)).await?;
        assert_eq!(v2.files.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(v2.tombstones["a"].removed_in_version, 2);
        assert_eq!(v2.total_bytes(), 200);

        // Re-adding a path clears its tombstone.
        let latest = Snapshot::build(&store, SnapshotSpec::Latest).await?;
        assert_eq!(latest.version, 3);
        assert_eq!(latest.files.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert!(latest.tombstones.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn builds_are_repeatable() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        seed(&store).await?;

        let first = Snapshot::build(&store, SnapshotSpec::Version(2)).await?;
        commit(&store, 4, vec![remove("b")]).await?;
        let second = Snapshot::build(&store, SnapshotSpec::Version(2)).await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn timestamps_resolve_to_latest_version_at_or_before() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        seed(&store).await?;

        let at = |mins: i64| SnapshotSpec::Timestamp(base_time() + Duration::minutes(mins));
        let exact = Snapshot::build(&store, at(2)).await?;
        assert_eq!(exact.version, 2);
        let later = Snapshot::build(
            &store,
            SnapshotSpec::Timestamp(base_time() + Duration::seconds(150)),
        )
        .await?;
        assert_eq!(later.version, 2);
        let future = Snapshot::build(&store, at(600)).await?;
        assert_eq!(future.version, 3);

        let err = Snapshot::build(&store, at(-1))
            .await
            .expect_err("before creation");
        assert!(matches!(err, SnapshotError::VersionNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_versions_are_not_found() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        seed(&store).await?;

        let err = Snapshot::build(&store, SnapshotSpec::Version(9))
            .await
            .expect_err("beyond latest");
        assert!(matches!(
            err,
            SnapshotError::VersionNotFound { latest: 3, .. }
        ));

        store.raise_history_floor(2).await?;
        let err = Snapshot::build(&store, SnapshotSpec::Version(1))
            .await
            .expect_err("below floor");
        assert!(matches!(
            err,
            SnapshotError::VersionNotFound { earliest: 2, .. }
        ));
        assert_eq!(
            Snapshot::build(&store, SnapshotSpec::Version(2)).await?.version,
            2
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_log_and_newer_protocol_are_rejected() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        let err = Snapshot::build(&store, SnapshotSpec::Latest)
            .await
            .expect_err("empty");
        assert!(matches!(err, SnapshotError::EmptyLog));

        commit(
            &store,
            0,
            vec![
                Action::Metadata(metadata()),
                Action::Protocol(Protocol {
                    min_reader_version: SUPPORTED_READER_VERSION + 1,
                    min_writer_version: 5,
                }),
            ],
        )
        .await?;
        let err = Snapshot::build(&store, SnapshotSpec::Latest)
            .await
            .expect_err("protocol");
        assert!(matches!(
            err,
            SnapshotError::ProtocolUnsupported { required: 2, .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn advance_matches_a_fresh_build() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        seed(&store).await?;

        let mut snapshot = Snapshot::build(&store, SnapshotSpec::Version(1)).await?;
        assert_eq!(snapshot.advance(&store).await?, 2);
        let fresh = Snapshot::build(&store, SnapshotSpec::Latest).await?;
        assert_eq!(snapshot, fresh);
        assert_eq!(snapshot.advance(&store).await?, 0);
        Ok(())
    }
}
