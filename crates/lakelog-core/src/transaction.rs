//! Optimistic transaction coordinator.
//!
//! A [`Transaction`] starts from a [`Snapshot`] (its *read version*), stages
//! actions, and on [`Transaction::commit`] claims the next log version with
//! create-if-absent semantics:
//!
//! 1. Validate the protocol and the staged schema change against the read
//!    snapshot. A schema change becomes an implicit `Metadata` action.
//! 2. Find the latest version. Every commit that landed after the versions
//!    already checked is inspected: touching a path this transaction touches,
//!    or replacing metadata or protocol, is a conflict. Transactions that
//!    read the whole table (overwrite, merge) also conflict with any
//!    concurrent data-changing add.
//! 3. Propose `latest + 1`. Losing the race for that version loops back to
//!    step 2; exhausting [`CommitOptions::max_attempts`] is reported as a
//!    concurrent modification.
//!
//! Data files are written before commit. If the commit fails they are left
//! behind as untracked files for vacuum to reclaim.
use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::{
    schema::{LogicalSchema, evolution::evolve_schema},
    table::error::{
        CancelledSnafu, ConcurrentModificationSnafu, InvalidOperationSnafu,
        ProtocolUnsupportedSnafu, SchemaMismatchSnafu, TableError, log_error,
    },
    transaction_log::{
        Action, CommitError, CommitInfo, CommitRecord, OperationKind, Snapshot,
        TransactionLogStore,
        actions::{SUPPORTED_WRITER_VERSION, engine_info},
    },
};

/// Default number of attempts to claim a version before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Knobs for [`Transaction::commit`].
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// How many times to retry after losing a version race.
    pub max_attempts: u32,
    /// Checked before every attempt; cancellation aborts the commit.
    pub cancel: Option<CancellationToken>,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cancel: None,
        }
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Collecting actions.
    Staged,
    /// Inside [`Transaction::commit`].
    Validating,
    /// Written as the given version.
    Committed(u64),
    /// Rejected because of a concurrent commit.
    Conflicted,
    /// Abandoned by the caller, cancelled or failed.
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Staged => f.write_str("staged"),
            TransactionState::Validating => f.write_str("validating"),
            TransactionState::Committed(v) => write!(f, "committed({v})"),
            TransactionState::Conflicted => f.write_str("conflicted"),
            TransactionState::Aborted => f.write_str("aborted"),
        }
    }
}

/// A set of staged changes against one read snapshot.
#[derive(Debug)]
pub struct Transaction {
    store: TransactionLogStore,
    read_snapshot: Snapshot,
    actions: Vec<Action>,
    schema_change: Option<LogicalSchema>,
    operation: OperationKind,
    parameters: BTreeMap<String, String>,
    metrics: BTreeMap<String, u64>,
    reads_all_data: bool,
    options: CommitOptions,
    state: TransactionState,
}

impl Transaction {
    /// Start a transaction whose read version is `snapshot.version`.
    pub fn begin(store: TransactionLogStore, snapshot: Snapshot) -> Self {
        Self {
            store,
            read_snapshot: snapshot,
            actions: Vec::new(),
            schema_change: None,
            operation: OperationKind::Commit,
            parameters: BTreeMap::new(),
            metrics: BTreeMap::new(),
            reads_all_data: false,
            options: CommitOptions::default(),
            state: TransactionState::Staged,
        }
    }

    /// Replace the commit options.
    pub fn with_options(mut self, options: CommitOptions) -> Self {
        self.options = options;
        self
    }

    /// Record the operation kind and its parameters in the commit info.
    pub fn with_operation(
        mut self,
        operation: OperationKind,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        self.operation = operation;
        self.parameters = parameters;
        self
    }

    /// Mark this transaction as depending on every live file of the read
    /// snapshot, so any concurrent data-changing add conflicts with it.
    pub fn reading_all_data(mut self) -> Self {
        self.reads_all_data = true;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Version this transaction read.
    pub fn read_version(&self) -> u64 {
        self.read_snapshot.version
    }

    /// The snapshot this transaction read.
    pub fn read_snapshot(&self) -> &Snapshot {
        &self.read_snapshot
    }

    /// Actions staged so far (without the implicit metadata and commit info).
    pub fn staged_actions(&self) -> &[Action] {
        &self.actions
    }

    /// Schema the commit will leave the table with.
    pub fn effective_schema(&self) -> &LogicalSchema {
        self.schema_change
            .as_ref()
            .unwrap_or_else(|| self.read_snapshot.schema())
    }

    fn transition(&mut self, next: TransactionState) {
        debug!(
            "transaction on {} (read version {}): {} -> {next}",
            self.store.location(),
            self.read_version(),
            self.state
        );
        self.state = next;
    }

    fn ensure_open(&self) -> Result<(), TableError> {
        ensure!(
            self.state == TransactionState::Staged,
            InvalidOperationSnafu {
                reason: format!("transaction is already {}", self.state),
            }
        );
        Ok(())
    }

    /// Stage actions, in order.
    pub fn stage(&mut self, actions: impl IntoIterator<Item = Action>) -> Result<(), TableError> {
        self.ensure_open()?;
        self.actions.extend(actions);
        Ok(())
    }

    /// Add to a counter recorded in the commit info.
    pub fn record_metric(&mut self, key: &str, value: u64) {
        *self.metrics.entry(key.to_string()).or_insert(0) += value;
    }

    /// Reconcile `incoming` with the schema this transaction will commit.
    ///
    /// `merge_schema` overrides the table's `schema.autoMerge.enabled`. When
    /// the schema must evolve the new schema is staged and committed as a
    /// `Metadata` action. Returns the resulting table schema.
    pub fn stage_schema_change(
        &mut self,
        incoming: &LogicalSchema,
        merge_schema: Option<bool>,
    ) -> Result<LogicalSchema, TableError> {
        self.ensure_open()?;
        let auto_merge = merge_schema.unwrap_or(self.read_snapshot.config().auto_merge);
        let current = self.effective_schema().clone();
        let evolved = evolve_schema(
            &current,
            incoming,
            self.read_snapshot.partition_columns(),
            auto_merge,
        )
        .context(SchemaMismatchSnafu)?;

        match evolved {
            Some(schema) => {
                debug!(
                    "staging schema change on {}: {current} -> {schema}",
                    self.store.location()
                );
                self.schema_change = Some(schema.clone());
                Ok(schema)
            }
            None => Ok(current),
        }
    }

    /// Abandon the transaction. Nothing is written.
    pub fn abort(&mut self) {
        if self.state == TransactionState::Staged {
            self.transition(TransactionState::Aborted);
        }
    }

    fn validate(&self) -> Result<(), TableError> {
        let protocol = &self.read_snapshot.protocol;
        ensure!(
            protocol.min_writer_version <= SUPPORTED_WRITER_VERSION,
            ProtocolUnsupportedSnafu {
                kind: "writer",
                required: protocol.min_writer_version,
                supported: SUPPORTED_WRITER_VERSION,
            }
        );

        let mut added = BTreeMap::new();
        for action in &self.actions {
            match action {
                Action::Protocol(p) => ensure!(
                    p.min_writer_version <= SUPPORTED_WRITER_VERSION,
                    ProtocolUnsupportedSnafu {
                        kind: "writer",
                        required: p.min_writer_version,
                        supported: SUPPORTED_WRITER_VERSION,
                    }
                ),
                Action::Add(add) => {
                    let live = self.read_snapshot.files.contains_key(&add.path);
                    let removed_here = self
                        .actions
                        .iter()
                        .any(|a| matches!(a, Action::Remove(rm) if rm.path == add.path));
                    ensure!(
                        (!live || removed_here) && added.insert(add.path.as_str(), ()).is_none(),
                        InvalidOperationSnafu {
                            reason: format!("file {} would be added twice", add.path),
                        }
                    );
                }
                Action::CommitInfo(_) => {
                    return InvalidOperationSnafu {
                        reason: "commit info is generated by the transaction",
                    }
                    .fail();
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether anything staged was validated against the read metadata.
    /// Commits that carry only commit info, like vacuum's audit entry, do not.
    fn depends_on_metadata(&self) -> bool {
        self.schema_change.is_some() || self.reads_all_data || !self.actions.is_empty()
    }

    /// Inspect one intervening commit for conflicts with this transaction.
    fn check_conflict(&self, other: &CommitRecord) -> Result<(), TableError> {
        let conflict = |reason: String| {
            ConcurrentModificationSnafu {
                read_version: self.read_version(),
                conflicting_version: Some(other.version),
                reason,
            }
            .fail()
        };

        if other.changes_metadata() && self.depends_on_metadata() {
            return conflict(format!(
                "version {} ({}) changed table metadata or protocol",
                other.version, other.operation
            ));
        }

        let ours: Vec<&str> = self
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::Add(add) => Some(add.path.as_str()),
                Action::Remove(rm) => Some(rm.path.as_str()),
                _ => None,
            })
            .collect();
        let theirs = other.touched_paths();
        if let Some(path) = ours.iter().find(|p| theirs.contains(*p)) {
            return conflict(format!(
                "version {} ({}) also modified {path}",
                other.version, other.operation
            ));
        }

        if self.reads_all_data && other.adds().any(|a| a.data_change) {
            return conflict(format!(
                "version {} ({}) added data this transaction read",
                other.version, other.operation
            ));
        }
        Ok(())
    }

    fn build_record(&self, version: u64, timestamp: DateTime<Utc>) -> CommitRecord {
        let mut actions = Vec::with_capacity(self.actions.len() + 2);
        if let Some(schema) = &self.schema_change {
            actions.push(Action::Metadata(
                self.read_snapshot.metadata.with_schema(schema.clone()),
            ));
        }
        actions.extend(self.actions.iter().cloned());

        let is_blind_append = self.schema_change.is_none()
            && !self.reads_all_data
            && !self.actions.is_empty()
            && self.actions.iter().all(|a| matches!(a, Action::Add(add) if add.data_change));

        actions.push(Action::CommitInfo(CommitInfo {
            timestamp,
            operation: self.operation,
            operation_parameters: self.parameters.clone(),
            operation_metrics: self.metrics.clone(),
            read_version: Some(self.read_version()),
            is_blind_append,
            engine_info: engine_info(),
        }));

        CommitRecord {
            version,
            read_version: Some(self.read_version()),
            timestamp,
            operation: self.operation,
            actions,
        }
    }

    fn fail<T>(&mut self, next: TransactionState, err: TableError) -> Result<T, TableError> {
        self.transition(next);
        Err(err)
    }

    /// Validate and write the staged changes. Returns the committed version.
    pub async fn commit(&mut self) -> Result<u64, TableError> {
        self.ensure_open()?;
        self.transition(TransactionState::Validating);

        if let Err(e) = self.validate() {
            return self.fail(TransactionState::Aborted, e);
        }

        let mut checked = self.read_version();
        let mut last_timestamp = self.read_snapshot.timestamp;
        let max_attempts = self.options.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self
                .options
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                let err = CancelledSnafu {
                    attempts: attempt - 1,
                }
                .build();
                return self.fail(TransactionState::Aborted, err);
            }

            let latest = match self.store.latest_version().await {
                Ok(latest) => latest.unwrap_or(checked),
                Err(e) => return self.fail(TransactionState::Aborted, log_error(e)),
            };

            if latest > checked {
                let intervening = match self.store.read_commits(checked + 1, latest).await {
                    Ok(commits) => commits,
                    Err(e) => return self.fail(TransactionState::Aborted, log_error(e)),
                };
                for other in &intervening {
                    if let Err(e) = self.check_conflict(other) {
                        return self.fail(TransactionState::Conflicted, e);
                    }
                    last_timestamp = other.timestamp;
                }
                checked = latest;
            }

            let version = latest + 1;
            let timestamp = Utc::now().max(last_timestamp + Duration::milliseconds(1));
            let record = self.build_record(version, timestamp);

            debug!(
                "attempt {attempt}/{max_attempts}: proposing version {version} for {} on {}",
                self.operation,
                self.store.location()
            );
            match self.store.write_commit(&record).await {
                Ok(()) => {
                    info!(
                        "committed version {version} ({}) on {}",
                        self.operation,
                        self.store.location()
                    );
                    self.transition(TransactionState::Committed(version));
                    return Ok(version);
                }
                Err(CommitError::VersionExists { .. }) => {
                    debug!("lost the race for version {version}; re-checking");
                }
                Err(e) => return self.fail(TransactionState::Aborted, log_error(e)),
            }
        }

        let err = ConcurrentModificationSnafu {
            read_version: self.read_version(),
            conflicting_version: None,
            reason: format!("could not claim a version after {max_attempts} attempts"),
        }
        .build();
        self.fail(TransactionState::Conflicted, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LogicalDataType, LogicalField};
    use crate::storage::TableLocation;
    use crate::transaction_log::{AddFile, Metadata, Protocol, SnapshotSpec};
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn add(path: &str) -> Action {
        Action::Add(AddFile {
            path: path.to_string(),
            size: 1,
            row_count: Some(1),
            modification_time: Utc::now(),
            data_change: true,
            partition_values: BTreeMap::new(),
        })
    }

    fn remove(path: &str) -> Action {
        Action::Remove(crate::transaction_log::RemoveFile {
            path: path.to_string(),
            deletion_timestamp: Utc::now(),
            data_change: true,
            size: None,
            partition_values: BTreeMap::new(),
        })
    }

    async fn create_table() -> Result<(TempDir, TransactionLogStore), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let store = TransactionLogStore::new(TableLocation::local(tmp.path()));
        let schema = LogicalSchema::new(vec![LogicalField::new(
            "id",
            LogicalDataType::Int64,
            false,
        )])?;
        let now = Utc::now();
        store
            .write_commit(&CommitRecord {
                version: 0,
                read_version: None,
                timestamp: now,
                operation: OperationKind::Create,
                actions: vec![
                    Action::Metadata(Metadata::new(schema, vec![], BTreeMap::new())),
                    Action::Protocol(Protocol::default()),
                ],
            })
            .await?;
        Ok((tmp, store))
    }

    async fn begin(store: &TransactionLogStore) -> Result<Transaction, TableError> {
        let snapshot = Snapshot::build(store, SnapshotSpec::Latest).await?;
        Ok(Transaction::begin(store.clone(), snapshot))
    }

    #[tokio::test]
    async fn commit_writes_next_version_with_commit_info() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut txn = begin(&store).await?.with_operation(
            OperationKind::Write,
            BTreeMap::from([("mode".to_string(), "Append".to_string())]),
        );
        txn.stage([add("data/a")])?;
        txn.record_metric("numFiles", 1);

        assert_eq!(txn.commit().await?, 1);
        assert_eq!(txn.state(), TransactionState::Committed(1));

        let record = store.read_commit(1).await?;
        let info = record.commit_info().expect("commit info");
        assert_eq!(info.operation, OperationKind::Write);
        assert_eq!(info.read_version, Some(0));
        assert!(info.is_blind_append);
        assert_eq!(info.operation_metrics.get("numFiles"), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn disjoint_concurrent_commits_both_succeed() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut first = begin(&store).await?;
        let mut second = begin(&store).await?;
        first.stage([add("data/a")])?;
        second.stage([add("data/b")])?;

        assert_eq!(first.commit().await?, 1);
        assert_eq!(second.commit().await?, 2);

        let snapshot = Snapshot::build(&store, SnapshotSpec::Latest).await?;
        assert_eq!(snapshot.num_files(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_paths_conflict() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut seed = begin(&store).await?;
        seed.stage([add("data/a")])?;
        seed.commit().await?;

        let mut first = begin(&store).await?;
        let mut second = begin(&store).await?;
        first.stage([remove("data/a"), add("data/a2")])?;
        second.stage([remove("data/a"), add("data/a3")])?;

        assert_eq!(first.commit().await?, 2);
        let err = second.commit().await.expect_err("conflict");
        assert!(matches!(
            err,
            TableError::ConcurrentModification {
                read_version: 1,
                conflicting_version: Some(2),
                ..
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(second.state(), TransactionState::Conflicted);
        assert_eq!(store.latest_version().await?, Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn metadata_changes_conflict_with_staged_work() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut evolve = begin(&store).await?;
        let mut append = begin(&store).await?;

        let wider = LogicalSchema::new(vec![
            LogicalField::new("id", LogicalDataType::Int64, false),
            LogicalField::new("extra", LogicalDataType::Utf8, true),
        ])?;
        let schema = evolve.stage_schema_change(&wider, Some(true))?;
        assert_eq!(schema.len(), 2);
        assert_eq!(evolve.commit().await?, 1);

        append.stage([add("data/x")])?;
        let err = append.commit().await.expect_err("conflict");
        assert!(matches!(err, TableError::ConcurrentModification { .. }));

        let snapshot = Snapshot::build(&store, SnapshotSpec::Latest).await?;
        assert_eq!(snapshot.schema().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn audit_only_commits_survive_metadata_changes() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut audit = begin(&store)
            .await?
            .with_operation(OperationKind::Vacuum, BTreeMap::new());
        audit.record_metric("numFilesDeleted", 3);

        let mut evolve = begin(&store).await?;
        let wider = LogicalSchema::new(vec![
            LogicalField::new("id", LogicalDataType::Int64, false),
            LogicalField::new("note", LogicalDataType::Utf8, true),
        ])?;
        evolve.stage_schema_change(&wider, Some(true))?;
        assert_eq!(evolve.commit().await?, 1);

        assert_eq!(audit.commit().await?, 2);
        let record = store.read_commit(2).await?;
        assert_eq!(record.operation, OperationKind::Vacuum);
        assert!(!record.changes_metadata());

        let snapshot = Snapshot::build(&store, SnapshotSpec::Latest).await?;
        assert_eq!(snapshot.schema().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn whole_table_readers_conflict_with_concurrent_appends() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut overwrite = begin(&store).await?.reading_all_data();
        let mut append = begin(&store).await?;

        append.stage([add("data/new")])?;
        append.commit().await?;

        overwrite.stage([add("data/replacement")])?;
        assert!(matches!(
            overwrite.commit().await,
            Err(TableError::ConcurrentModification { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn schema_change_respects_auto_merge_setting() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut txn = begin(&store).await?;
        let wider = LogicalSchema::new(vec![
            LogicalField::new("id", LogicalDataType::Int64, false),
            LogicalField::new("extra", LogicalDataType::Utf8, true),
        ])?;

        let err = txn
            .stage_schema_change(&wider, None)
            .expect_err("auto-merge is off by default");
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        assert!(!err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_commit_writes_nothing() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let token = CancellationToken::new();
        let mut txn = begin(&store).await?.with_options(CommitOptions {
            cancel: Some(token.clone()),
            ..CommitOptions::default()
        });
        txn.stage([add("data/a")])?;
        token.cancel();

        let err = txn.commit().await.expect_err("cancelled");
        assert!(matches!(err, TableError::Cancelled { attempts: 0 }));
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(store.latest_version().await?, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn aborted_and_committed_transactions_are_closed() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut txn = begin(&store).await?;
        txn.abort();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(matches!(
            txn.stage([add("data/a")]),
            Err(TableError::InvalidOperation { .. })
        ));
        assert!(txn.commit().await.is_err());
        assert_eq!(store.latest_version().await?, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_adds_are_rejected() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let mut txn = begin(&store).await?;
        txn.stage([add("data/a"), add("data/a")])?;
        assert!(matches!(
            txn.commit().await,
            Err(TableError::InvalidOperation { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn commit_timestamps_increase_strictly() -> TestResult {
        let (_tmp, store) = create_table().await?;
        for i in 0..5 {
            let mut txn = begin(&store).await?;
            txn.stage([add(&format!("data/{i}"))])?;
            txn.commit().await?;
        }
        let commits = store.read_commits(0, 5).await?;
        for pair in commits.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_disjoint_writers_produce_gap_free_versions() -> TestResult {
        let (_tmp, store) = create_table().await?;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let snapshot = Snapshot::build(&store, SnapshotSpec::Latest).await?;
                let mut txn = Transaction::begin((*store).clone(), snapshot).with_options(
                    CommitOptions {
                        max_attempts: 64,
                        cancel: None,
                    },
                );
                txn.stage([add(&format!("data/w{i}"))])?;
                Ok::<u64, TableError>(txn.commit().await?)
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await??);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<u64>>());

        let snapshot = Snapshot::build(&store, SnapshotSpec::Latest).await?;
        assert_eq!(snapshot.version, 8);
        assert_eq!(snapshot.num_files(), 8);
        Ok(())
    }
}
