//! Retention-based physical cleanup.
//!
//! A file is a vacuum candidate when it still exists on storage and either
//!
//! - it is tombstoned, its deletion timestamp is older than the retention
//!   cutoff, it is not live, and no commit newer than the cutoff added it; or
//! - it lives under `data/`, no commit ever referenced it, and it was last
//!   modified before the cutoff (leftovers of failed or abandoned writes).
//!
//! Deletions are best-effort: failures are logged and counted, never raised.
//! Versions that still referenced a deleted file become unreadable, so the
//! history floor is raised to the newest version that removed one. A
//! `VACUUM` commit records the run.
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    layout,
    storage::{self, ListedFile},
    table::error::{
        InvalidOperationSnafu, IoFailureSnafu, RetentionTooShortSnafu, TableError, log_error,
    },
    transaction::{CommitOptions, Transaction},
    transaction_log::{
        OperationKind, Snapshot, SnapshotSpec, TransactionLogStore,
        table_config::{MIN_SAFE_RETENTION_HOURS, hours},
    },
};

/// How many deletions run concurrently.
const DELETE_CONCURRENCY: usize = 8;

/// Knobs for [`run_vacuum`].
#[derive(Debug, Clone, Default)]
pub struct VacuumOptions {
    /// Retention window; defaults to `vacuum.retentionHours`.
    pub retention: Option<Duration>,
    /// Report candidates without deleting or committing.
    pub dry_run: bool,
    /// Overrides `retentionDurationCheck.enabled` for this call.
    pub enforce_retention_check: Option<bool>,
}

/// Outcome of a vacuum run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Paths selected for deletion, sorted.
    pub candidates: Vec<String>,
    /// Files deleted.
    pub deleted: u64,
    /// Deletions that failed.
    pub failed: u64,
    /// History floor after the run.
    pub history_floor: u64,
    /// Version of the `VACUUM` commit, `None` for dry runs.
    pub version: Option<u64>,
}

/// Why a file was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    /// Tombstoned by the given version.
    Removed(u64),
    /// Never referenced by the log.
    Untracked,
}

/// Delete expired files and record a `VACUUM` commit.
pub(crate) async fn run_vacuum(
    store: &TransactionLogStore,
    options: &VacuumOptions,
    commit: &CommitOptions,
) -> Result<VacuumReport, TableError> {
    let snapshot = Snapshot::build(store, SnapshotSpec::Latest).await?;
    let config = *snapshot.config();

    let retention = options.retention.unwrap_or_else(|| config.vacuum_retention());
    ensure!(
        retention >= Duration::zero(),
        InvalidOperationSnafu {
            reason: "vacuum retention cannot be negative",
        }
    );
    let enforce = options
        .enforce_retention_check
        .unwrap_or(config.retention_check);
    ensure!(
        !enforce || retention >= hours(MIN_SAFE_RETENTION_HOURS),
        RetentionTooShortSnafu {
            requested_hours: retention.num_hours(),
            minimum_hours: MIN_SAFE_RETENTION_HOURS,
        }
    );

    let location = store.location().clone();
    let cutoff = Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    // Every path the log ever referenced, and those added after the cutoff.
    let commits = store
        .read_commits(0, snapshot.version)
        .await
        .map_err(log_error)?;
    let mut referenced = BTreeSet::new();
    let mut recently_added = BTreeSet::new();
    for commit in &commits {
        for path in commit.touched_paths() {
            referenced.insert(path.to_string());
        }
        if commit.timestamp >= cutoff {
            recently_added.extend(commit.adds().map(|a| a.path.clone()));
        }
    }

    let physical: BTreeMap<String, ListedFile> =
        storage::list_files(&location, &layout::data_rel_dir())
            .await
            .context(IoFailureSnafu)?
            .into_iter()
            .map(|f| (f.rel_path.clone(), f))
            .collect();

    let mut selected: BTreeMap<String, Reason> = BTreeMap::new();
    for (path, tombstone) in &snapshot.tombstones {
        let expired = tombstone.remove.deletion_timestamp < cutoff
            && !snapshot.files.contains_key(path)
            && !recently_added.contains(path);
        if !expired {
            continue;
        }
        let exists = if physical.contains_key(path) {
            true
        } else {
            match storage::stat(&location, Path::new(path)).await {
                Ok(_) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(TableError::IoFailure { source: e }),
            }
        };
        if exists {
            selected.insert(path.clone(), Reason::Removed(tombstone.removed_in_version));
        }
    }
    for (path, file) in &physical {
        if !referenced.contains(path) && file.stat.modified < cutoff {
            selected.insert(path.clone(), Reason::Untracked);
        }
    }

    let mut report = VacuumReport {
        candidates: selected.keys().cloned().collect(),
        ..VacuumReport::default()
    };
    debug!(
        "vacuum on {location}: {} candidate(s) with cutoff {cutoff}",
        report.candidates.len()
    );

    if options.dry_run {
        report.history_floor = store.load_history_floor().await.map_err(log_error)?;
        return Ok(report);
    }

    let outcomes: Vec<(Reason, bool)> = stream::iter(selected)
        .map(|(path, reason)| {
            let location = &location;
            async move {
                match storage::delete_file(location, Path::new(&path)).await {
                    Ok(()) => (reason, true),
                    // Someone else got there first.
                    Err(e) if e.is_not_found() => (reason, true),
                    Err(e) => {
                        warn!("vacuum could not delete {path}: {e}");
                        (reason, false)
                    }
                }
            }
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .collect()
        .await;

    let mut floor_target = None;
    for (reason, ok) in outcomes {
        if !ok {
            report.failed += 1;
            continue;
        }
        report.deleted += 1;
        if let Reason::Removed(version) = reason {
            floor_target = floor_target.max(Some(version));
        }
    }

    report.history_floor = match floor_target {
        Some(version) => store
            .raise_history_floor(version)
            .await
            .map_err(log_error)?,
        None => store.load_history_floor().await.map_err(log_error)?,
    };

    let parameters = BTreeMap::from([
        ("retentionHours".to_string(), retention.num_hours().to_string()),
        ("retentionCheckEnabled".to_string(), enforce.to_string()),
    ]);
    let mut txn = Transaction::begin(store.clone(), snapshot)
        .with_operation(OperationKind::Vacuum, parameters)
        .with_options(commit.clone());
    txn.record_metric("numFilesDeleted", report.deleted);
    txn.record_metric("numDeletionsFailed", report.failed);
    txn.record_metric("historyFloor", report.history_floor);
    report.version = Some(txn.commit().await?);

    info!(
        "vacuum on {location}: deleted {} file(s), {} failure(s), history floor {}",
        report.deleted, report.failed, report.history_floor
    );
    Ok(report)
}
