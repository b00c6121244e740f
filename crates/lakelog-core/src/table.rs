//! Table layer.
//!
//! This is the user-facing API surface: create/open, write, merge, history,
//! time-travel reads and maintenance. A [`Table`] is a handle on one table
//! root; it holds no cached state beyond the location, so handles are cheap
//! to clone and safe to use from several tasks. Every operation starts from
//! a fresh snapshot of the log and goes through one [`Transaction`].
pub mod error;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::info;
use snafu::prelude::*;

use crate::{
    data::{self, Row, RowBatch},
    maintenance::{
        OptimizeMetrics, OptimizeOptions, VacuumOptions, VacuumReport, optimize::run_optimize,
        vacuum::run_vacuum,
    },
    merge::{MergeMetrics, MergeRequest, execute_merge, merge_parameters},
    schema::LogicalSchema,
    storage::TableLocation,
    transaction::{CommitOptions, Transaction},
    transaction_log::{
        Action, CommitError, CommitInfo, CommitRecord, Metadata, OperationKind, Protocol,
        Snapshot, SnapshotSpec, TableConfig, TransactionLogStore, actions::engine_info,
    },
};

use self::error::{
    AlreadyExistsSnafu, InvalidConfigSnafu, InvalidOperationSnafu, NotATableSnafu, TableError,
    log_error,
};

/// Options for [`Table::create`].
#[derive(Debug, Clone)]
pub struct CreateTableOptions {
    /// Initial schema.
    pub schema: LogicalSchema,
    /// Partition columns; each must be a column of `schema`.
    pub partition_columns: Vec<String>,
    /// Table configuration, see [`TableConfig`].
    pub configuration: BTreeMap<String, String>,
    /// Optional table name.
    pub name: Option<String>,
    /// Optional description.
    pub description: Option<String>,
}

impl CreateTableOptions {
    /// Unpartitioned table with default configuration.
    pub fn new(schema: LogicalSchema) -> Self {
        Self {
            schema,
            partition_columns: Vec::new(),
            configuration: BTreeMap::new(),
            name: None,
            description: None,
        }
    }

    /// Set the partition columns.
    pub fn with_partition_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set one configuration key.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Set the table name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// How [`Table::write`] combines new rows with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Add rows.
    #[default]
    Append,
    /// Replace all rows.
    Overwrite,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Append => f.write_str("Append"),
            WriteMode::Overwrite => f.write_str("Overwrite"),
        }
    }
}

/// Options for [`Table::write`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Append or overwrite.
    pub mode: WriteMode,
    /// Overrides `schema.autoMerge.enabled` for this write.
    pub merge_schema: Option<bool>,
}

/// One entry of [`Table::describe_history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Commit version.
    pub version: u64,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Operation that produced it.
    pub operation: OperationKind,
    /// Operation parameters.
    pub operation_parameters: BTreeMap<String, String>,
    /// Operation metrics.
    pub operation_metrics: BTreeMap<String, u64>,
    /// Version the writer read.
    pub read_version: Option<u64>,
    /// Whether the commit only appended data.
    pub is_blind_append: bool,
}

impl CommitSummary {
    fn from_record(record: &CommitRecord) -> Self {
        let info = record.commit_info();
        Self {
            version: record.version,
            timestamp: record.timestamp,
            operation: record.operation,
            operation_parameters: info
                .map(|i| i.operation_parameters.clone())
                .unwrap_or_default(),
            operation_metrics: info
                .map(|i| i.operation_metrics.clone())
                .unwrap_or_default(),
            read_version: record.read_version,
            is_blind_append: info.is_some_and(|i| i.is_blind_append),
        }
    }
}

/// Result of [`Table::describe_detail`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableDetail {
    /// Table root.
    pub location: String,
    /// Latest version.
    pub version: u64,
    /// Timestamp of the latest commit.
    pub last_modified: DateTime<Utc>,
    /// Current metadata.
    pub metadata: Metadata,
    /// Current protocol.
    pub protocol: Protocol,
    /// Parsed configuration.
    pub config: TableConfig,
    /// Live files.
    pub num_files: usize,
    /// Bytes of the live files.
    pub size_in_bytes: u64,
    /// Rows of the live files, where known.
    pub num_rows: u64,
    /// Oldest readable version.
    pub history_floor: u64,
}

/// Handle on one table.
#[derive(Debug, Clone)]
pub struct Table {
    store: TransactionLogStore,
    commit_options: CommitOptions,
}

impl Table {
    /// Create a new table at `location` and return a handle on it.
    ///
    /// Version 0 carries the metadata and protocol. Fails with
    /// [`TableError::AlreadyExists`] if a log exists, including when another
    /// creator wins the race for version 0.
    pub async fn create(
        location: TableLocation,
        options: CreateTableOptions,
    ) -> Result<Self, TableError> {
        let store = TransactionLogStore::new(location);

        // 1) Validate the definition before touching storage.
        TableConfig::from_configuration(&options.configuration).context(InvalidConfigSnafu)?;
        validate_partition_columns(&options.schema, &options.partition_columns)?;

        if let Some(version) = store.latest_version().await.map_err(log_error)? {
            return AlreadyExistsSnafu {
                location: store.location().to_string(),
                version,
            }
            .fail();
        }

        // 2) Claim version 0.
        let mut metadata = Metadata::new(
            options.schema,
            options.partition_columns,
            options.configuration,
        );
        metadata.name = options.name;
        metadata.description = options.description;
        let timestamp = Utc::now();
        let record = CommitRecord {
            version: 0,
            read_version: None,
            timestamp,
            operation: OperationKind::Create,
            actions: vec![
                Action::Metadata(metadata),
                Action::Protocol(Protocol::default()),
                Action::CommitInfo(CommitInfo {
                    timestamp,
                    operation: OperationKind::Create,
                    operation_parameters: BTreeMap::new(),
                    operation_metrics: BTreeMap::new(),
                    read_version: None,
                    is_blind_append: false,
                    engine_info: engine_info(),
                }),
            ],
        };

        match store.write_commit(&record).await {
            Ok(()) => {}
            Err(CommitError::VersionExists { .. }) => {
                return AlreadyExistsSnafu {
                    location: store.location().to_string(),
                    version: 0u64,
                }
                .fail();
            }
            Err(e) => return Err(log_error(e)),
        }

        info!("created table at {}", store.location());
        Ok(Self {
            store,
            commit_options: CommitOptions::default(),
        })
    }

    /// Open an existing table, validating its protocol and configuration.
    pub async fn open(location: TableLocation) -> Result<Self, TableError> {
        let store = TransactionLogStore::new(location);
        if store.latest_version().await.map_err(log_error)?.is_none() {
            return NotATableSnafu {
                location: store.location().to_string(),
            }
            .fail();
        }

        Snapshot::build(&store, SnapshotSpec::Latest).await?;
        Ok(Self {
            store,
            commit_options: CommitOptions::default(),
        })
    }

    /// Use `options` for every commit made through this handle.
    pub fn with_commit_options(mut self, options: CommitOptions) -> Self {
        self.commit_options = options;
        self
    }

    /// Table root.
    pub fn location(&self) -> &TableLocation {
        self.store.location()
    }

    /// The underlying log store.
    pub fn log_store(&self) -> &TransactionLogStore {
        &self.store
    }

    /// Materialize the table at `spec`.
    pub async fn snapshot(&self, spec: SnapshotSpec) -> Result<Snapshot, TableError> {
        Ok(Snapshot::build(&self.store, spec).await?)
    }

    /// Latest committed version.
    pub async fn version(&self) -> Result<u64, TableError> {
        Ok(self.snapshot(SnapshotSpec::Latest).await?.version)
    }

    /// Start a transaction on the latest snapshot.
    pub async fn begin(&self) -> Result<Transaction, TableError> {
        let snapshot = self.snapshot(SnapshotSpec::Latest).await?;
        Ok(Transaction::begin(self.store.clone(), snapshot)
            .with_options(self.commit_options.clone()))
    }

    /// Write `batch`, returning the committed version.
    ///
    /// The batch schema is reconciled with the table schema first (see
    /// [`Transaction::stage_schema_change`]); rows are then widened to the
    /// resulting schema and written one file per partition.
    pub async fn write(&self, batch: RowBatch, options: WriteOptions) -> Result<u64, TableError> {
        let parameters = BTreeMap::from([("mode".to_string(), options.mode.to_string())]);
        let mut txn = self
            .begin()
            .await?
            .with_operation(OperationKind::Write, parameters);
        if options.mode == WriteMode::Overwrite {
            txn = txn.reading_all_data();
        }

        // 1) Schema policy.
        let schema = txn.stage_schema_change(batch.schema(), options.merge_schema)?;
        let rows = RowBatch::new(schema, batch.into_rows())?;
        let num_rows = rows.len() as u64;

        // 2) Data files.
        let partition_columns = txn.read_snapshot().partition_columns().to_vec();
        let adds = if rows.is_empty() {
            Vec::new()
        } else {
            data::write_partitioned(self.location(), rows.into_rows(), &partition_columns, true)
                .await?
        };

        // 3) Actions.
        let now = Utc::now();
        let removes: Vec<Action> = match options.mode {
            WriteMode::Append => Vec::new(),
            WriteMode::Overwrite => txn
                .read_snapshot()
                .files
                .values()
                .map(|f| Action::Remove(f.to_remove(now, true)))
                .collect(),
        };
        txn.record_metric("numFiles", adds.len() as u64);
        txn.record_metric("numOutputRows", num_rows);
        txn.record_metric(
            "numOutputBytes",
            adds.iter().map(|a| a.size).sum::<u64>(),
        );
        if options.mode == WriteMode::Overwrite {
            txn.record_metric("numRemovedFiles", removes.len() as u64);
        }
        txn.stage(removes.into_iter().chain(adds.into_iter().map(Action::Add)))?;

        txn.commit().await
    }

    /// Commit caller-supplied actions.
    ///
    /// `schema_change`, when given, is reconciled with the table schema like
    /// a write's batch schema. The actions go through the same conflict
    /// checks as every other commit.
    pub async fn commit_actions(
        &self,
        actions: Vec<Action>,
        schema_change: Option<(&LogicalSchema, Option<bool>)>,
        operation: OperationKind,
    ) -> Result<u64, TableError> {
        ensure!(
            operation != OperationKind::Create,
            InvalidOperationSnafu {
                reason: "CREATE commits are only written by Table::create",
            }
        );
        let mut txn = self.begin().await?.with_operation(operation, BTreeMap::new());
        if let Some((schema, merge_schema)) = schema_change {
            txn.stage_schema_change(schema, merge_schema)?;
        }
        txn.stage(actions)?;
        txn.commit().await
    }

    /// Merge a source batch into the table in one transaction.
    pub async fn merge(&self, request: MergeRequest) -> Result<(u64, MergeMetrics), TableError> {
        let mut txn = self
            .begin()
            .await?
            .with_operation(OperationKind::Merge, merge_parameters(&request))
            .reading_all_data();
        let metrics = execute_merge(&mut txn, self.location(), request).await?;
        let version = txn.commit().await?;
        Ok((version, metrics))
    }

    /// Commits newest first, at most `limit` of them.
    ///
    /// Commits below the history floor are still listed; they only become
    /// unreadable as snapshots.
    pub async fn describe_history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<CommitSummary>, TableError> {
        let Some(latest) = self.store.latest_version().await.map_err(log_error)? else {
            return Ok(Vec::new());
        };
        let count = limit.map_or(latest + 1, |l| (l as u64).min(latest + 1));
        if count == 0 {
            return Ok(Vec::new());
        }
        let from = latest + 1 - count;
        let records = self
            .store
            .read_commits(from, latest)
            .await
            .map_err(log_error)?;
        Ok(records.iter().rev().map(CommitSummary::from_record).collect())
    }

    /// Current metadata, protocol and size statistics.
    pub async fn describe_detail(&self) -> Result<TableDetail, TableError> {
        let snapshot = self.snapshot(SnapshotSpec::Latest).await?;
        let history_floor = self
            .store
            .load_history_floor()
            .await
            .map_err(log_error)?;
        Ok(TableDetail {
            location: self.location().to_string(),
            version: snapshot.version,
            last_modified: snapshot.timestamp,
            num_files: snapshot.num_files(),
            size_in_bytes: snapshot.total_bytes(),
            num_rows: snapshot.total_rows(),
            config: *snapshot.config(),
            metadata: snapshot.metadata,
            protocol: snapshot.protocol,
            history_floor,
        })
    }

    /// Every row of `snapshot`, projected onto its schema.
    ///
    /// Columns added after a file was written read as null and values
    /// written before a promotion are widened. Rows come back in file path
    /// order, then file order.
    pub async fn read_rows(&self, snapshot: &Snapshot) -> Result<Vec<Row>, TableError> {
        let files = data::read_row_files(
            self.location(),
            snapshot.files.keys().map(String::as_str),
        )
        .await?;
        let mut rows = Vec::new();
        for (_, file_rows) in files {
            for row in file_rows {
                rows.push(row.project(snapshot.schema())?);
            }
        }
        Ok(rows)
    }

    /// Compact small files.
    pub async fn optimize(&self, options: OptimizeOptions) -> Result<OptimizeMetrics, TableError> {
        run_optimize(&self.store, &options, &self.commit_options).await
    }

    /// Delete files no retained version needs.
    pub async fn vacuum(&self, options: VacuumOptions) -> Result<VacuumReport, TableError> {
        run_vacuum(&self.store, &options, &self.commit_options).await
    }
}

fn validate_partition_columns(
    schema: &LogicalSchema,
    partition_columns: &[String],
) -> Result<(), TableError> {
    for (idx, column) in partition_columns.iter().enumerate() {
        ensure!(
            schema.contains(column),
            InvalidOperationSnafu {
                reason: format!("partition column {column} is not in the schema"),
            }
        );
        ensure!(
            !partition_columns[..idx].contains(column),
            InvalidOperationSnafu {
                reason: format!("partition column {column} is listed twice"),
            }
        );
    }
    Ok(())
}
