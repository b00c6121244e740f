//! Small-file compaction.
//!
//! Candidates are live files smaller than `optimize.minFileSize` that match
//! the partition filter. They are grouped by partition, sorted by size and
//! packed greedily into bins of at most the target size; bins holding fewer
//! than two files are left alone. Every bin becomes one new file, committed
//! with `data_change = false` on both the removes and the add.
//!
//! A concurrent commit touching one of the planned files makes the commit
//! fail with a conflict; compaction then re-plans on a fresh snapshot.
use std::collections::BTreeMap;

use chrono::Utc;
use log::{debug, info};
use snafu::prelude::*;

use crate::{
    data::{self, Row},
    table::error::{InvalidOperationSnafu, TableError},
    transaction::{CommitOptions, Transaction},
    transaction_log::{
        Action, AddFile, OperationKind, PartitionValues, Snapshot, SnapshotSpec,
        TransactionLogStore,
    },
};

/// Default number of plan-and-commit rounds before a conflict is returned.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Knobs for [`run_optimize`].
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    /// Only compact files whose partition values equal these.
    pub partition_filter: PartitionValues,
    /// Upper bound for output files; defaults to `optimize.maxFileSize`.
    pub target_size: Option<u64>,
    /// Files below this size are candidates; defaults to
    /// `optimize.minFileSize`.
    pub min_file_size: Option<u64>,
    /// How many times to re-plan after a conflict.
    pub max_rounds: u32,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            partition_filter: BTreeMap::new(),
            target_size: None,
            min_file_size: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

/// Result of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeMetrics {
    /// Version committed, `None` when there was nothing to compact.
    pub version: Option<u64>,
    /// Bins rewritten.
    pub num_bins: u64,
    /// Files removed.
    pub num_files_removed: u64,
    /// Files added.
    pub num_files_added: u64,
    /// Bytes of the removed files.
    pub bytes_removed: u64,
    /// Bytes of the added files.
    pub bytes_added: u64,
    /// Rows rewritten.
    pub rows_rewritten: u64,
    /// Partitions with at least one bin.
    pub partitions_optimized: u64,
    /// Plan-and-commit rounds used.
    pub rounds: u32,
}

/// Files of one partition that will be rewritten into a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bin {
    pub(crate) partition_values: PartitionValues,
    pub(crate) files: Vec<AddFile>,
}

impl Bin {
    fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Plan the bins for `snapshot`.
pub(crate) fn plan_bins(
    snapshot: &Snapshot,
    options: &OptimizeOptions,
) -> Result<Vec<Bin>, TableError> {
    for column in options.partition_filter.keys() {
        ensure!(
            snapshot.partition_columns().contains(column),
            InvalidOperationSnafu {
                reason: format!("{column} is not a partition column"),
            }
        );
    }

    let config = snapshot.config();
    let target = options
        .target_size
        .unwrap_or(config.optimize_max_file_size)
        .max(1);
    let min_size = options
        .min_file_size
        .unwrap_or(config.optimize_min_file_size);

    let mut by_partition: BTreeMap<&PartitionValues, Vec<&AddFile>> = BTreeMap::new();
    for file in snapshot.files.values() {
        let selected = file.size < min_size
            && options
                .partition_filter
                .iter()
                .all(|(k, v)| file.partition_values.get(k) == Some(v));
        if selected {
            by_partition
                .entry(&file.partition_values)
                .or_default()
                .push(file);
        }
    }

    let mut bins = Vec::new();
    for (partition_values, mut files) in by_partition {
        files.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path)));

        let mut current = Bin {
            partition_values: partition_values.clone(),
            files: Vec::new(),
        };
        for file in files {
            if !current.files.is_empty() && current.size() + file.size > target {
                let full = std::mem::replace(
                    &mut current,
                    Bin {
                        partition_values: partition_values.clone(),
                        files: Vec::new(),
                    },
                );
                bins.push(full);
            }
            current.files.push(file.clone());
        }
        bins.push(current);
    }

    bins.retain(|bin| bin.files.len() >= 2);
    Ok(bins)
}

/// Compact small files, re-planning after conflicts.
pub(crate) async fn run_optimize(
    store: &TransactionLogStore,
    options: &OptimizeOptions,
    commit: &CommitOptions,
) -> Result<OptimizeMetrics, TableError> {
    let max_rounds = options.max_rounds.max(1);
    let mut round = 0;
    loop {
        round += 1;
        let snapshot = Snapshot::build(store, SnapshotSpec::Latest).await?;
        match optimize_once(store, snapshot, options, commit).await {
            Ok(mut metrics) => {
                metrics.rounds = round;
                return Ok(metrics);
            }
            Err(e @ TableError::ConcurrentModification { .. }) if round < max_rounds => {
                debug!("optimize round {round} conflicted, re-planning: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn optimize_once(
    store: &TransactionLogStore,
    snapshot: Snapshot,
    options: &OptimizeOptions,
    commit: &CommitOptions,
) -> Result<OptimizeMetrics, TableError> {
    let bins = plan_bins(&snapshot, options)?;
    let mut metrics = OptimizeMetrics::default();
    if bins.is_empty() {
        debug!("optimize on {}: nothing to compact", store.location());
        return Ok(metrics);
    }

    let location = store.location().clone();
    let schema = snapshot.schema().clone();
    let mut parameters = BTreeMap::from([(
        "targetSize".to_string(),
        options
            .target_size
            .unwrap_or(snapshot.config().optimize_max_file_size)
            .to_string(),
    )]);
    if !options.partition_filter.is_empty() {
        let filter = options
            .partition_filter
            .iter()
            .map(|(k, v)| format!("{k}={}", v.as_deref().unwrap_or("NULL")))
            .collect::<Vec<_>>()
            .join(",");
        parameters.insert("partitionFilter".to_string(), filter);
    }

    let mut txn = Transaction::begin(store.clone(), snapshot)
        .with_operation(OperationKind::Optimize, parameters)
        .with_options(commit.clone());

    let mut partitions = std::collections::BTreeSet::new();
    let now = Utc::now();
    for bin in &bins {
        let files =
            data::read_row_files(&location, bin.files.iter().map(|f| f.path.as_str())).await?;
        let mut rows: Vec<Row> = Vec::new();
        for (_, file_rows) in files {
            for row in file_rows {
                rows.push(row.project(&schema)?);
            }
        }

        let add =
            data::write_row_file(&location, &rows, bin.partition_values.clone(), false).await?;
        debug!(
            "compacted {} file(s) ({} bytes) into {} ({} bytes)",
            bin.files.len(),
            bin.size(),
            add.path,
            add.size
        );

        metrics.num_bins += 1;
        metrics.num_files_removed += bin.files.len() as u64;
        metrics.num_files_added += 1;
        metrics.bytes_removed += bin.size();
        metrics.bytes_added += add.size;
        metrics.rows_rewritten += rows.len() as u64;
        partitions.insert(&bin.partition_values);

        txn.stage(
            bin.files
                .iter()
                .map(|f| Action::Remove(f.to_remove(now, false)))
                .chain(std::iter::once(Action::Add(add))),
        )?;
    }
    metrics.partitions_optimized = partitions.len() as u64;

    for (key, value) in [
        ("numBins", metrics.num_bins),
        ("numRemovedFiles", metrics.num_files_removed),
        ("numAddedFiles", metrics.num_files_added),
        ("numRemovedBytes", metrics.bytes_removed),
        ("numAddedBytes", metrics.bytes_added),
        ("numRowsRewritten", metrics.rows_rewritten),
    ] {
        txn.record_metric(key, value);
    }

    let version = txn.commit().await?;
    info!(
        "optimize on {location} committed version {version}: {} file(s) into {}",
        metrics.num_files_removed, metrics.num_files_added
    );
    metrics.version = Some(version);
    Ok(metrics)
}
