//! Async helpers for persisting and reading the commit log.
//!
//! This module owns all on-disk interactions with `_table_log/`:
//! - Writing zero-padded commit files with create-if-absent semantics so each
//!   version is created exactly once.
//! - Reading commits back and validating that payload and file name agree.
//! - Discovering the latest version from the advisory `CURRENT` hint, the
//!   directory listing and forward point reads.
//! - Maintaining the `_history_floor` pointer written by vacuum.
//!
//! Storage failures are mapped into [`CommitError`] variants so callers can
//! tell lost races, missing versions, storage errors and corrupt state apart.
//! Nothing here retries; retry policy belongs to the transaction coordinator.
use std::path::Path;

use futures::{StreamExt, TryStreamExt, stream};
use log::{debug, warn};
use snafu::prelude::*;

use crate::layout;
use crate::storage::{self, StorageError, TableLocation};
use crate::transaction_log::{
    CommitError, CommitRecord, CorruptStateSnafu, MissingVersionSnafu, StorageSnafu,
    VersionExistsSnafu,
};

/// How many commit files are read concurrently during replay.
const READ_CONCURRENCY: usize = 16;

/// Helper for reading and writing the commit log under a table root.
///
/// Layout:
///   <root>/_table_log/00000000000000000000.json
///   <root>/_table_log/00000000000000000001.json
///   <root>/_table_log/CURRENT
///   <root>/_table_log/_history_floor
#[derive(Debug, Clone)]
pub struct TransactionLogStore {
    location: TableLocation,
}

impl TransactionLogStore {
    /// Create a new store rooted at a table directory.
    pub fn new(location: TableLocation) -> Self {
        Self { location }
    }

    /// Get the TableLocation of the store.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// Write `record` as version `record.version`.
    ///
    /// Fails with [`CommitError::VersionExists`] when another writer already
    /// owns the version; nothing is modified in that case. After the commit
    /// file exists the `CURRENT` hint is refreshed. A failed hint write is
    /// logged and ignored, because readers never trust the hint alone.
    pub async fn write_commit(&self, record: &CommitRecord) -> Result<(), CommitError> {
        let version = record.version;
        let json = serde_json::to_vec(record).map_err(|e| {
            CorruptStateSnafu {
                msg: format!("failed to serialize commit {version}: {e}"),
            }
            .build()
        })?;

        let rel = layout::commit_rel_path(version);
        match storage::write_new(&self.location, &rel, &json).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return VersionExistsSnafu { version }.fail();
            }
            Err(source) => return Err(CommitError::Storage { source }),
        }

        let hint = format!("{version}\n");
        if let Err(e) =
            storage::write_atomic(&self.location, &layout::current_rel_path(), hint.as_bytes())
                .await
        {
            warn!(
                "committed version {version} at {} but failed to update CURRENT: {e}",
                self.location
            );
        }
        Ok(())
    }

    /// Load a single commit by version.
    ///
    /// - A missing file returns [`CommitError::MissingVersion`].
    /// - Other storage failures return [`CommitError::Storage`].
    /// - Unparseable JSON, or a payload whose version disagrees with the file
    ///   name, returns [`CommitError::CorruptState`].
    pub async fn read_commit(&self, version: u64) -> Result<CommitRecord, CommitError> {
        let rel = layout::commit_rel_path(version);
        let json = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return MissingVersionSnafu { version }.fail(),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let record: CommitRecord = serde_json::from_str(&json).map_err(|e| {
            CorruptStateSnafu {
                msg: format!("failed to parse commit {version}: {e}"),
            }
            .build()
        })?;

        ensure!(
            record.version == version,
            CorruptStateSnafu {
                msg: format!(
                    "commit file for version {version} carries version {}",
                    record.version
                ),
            }
        );
        Ok(record)
    }

    /// Read commits `from..=to` in ascending order.
    ///
    /// Files are fetched concurrently but returned in version order. Any
    /// missing version in the range is an error.
    pub async fn read_commits(&self, from: u64, to: u64) -> Result<Vec<CommitRecord>, CommitError> {
        if from > to {
            return Ok(Vec::new());
        }
        stream::iter(from..=to)
            .map(|v| self.read_commit(v))
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn commit_exists(&self, version: u64) -> Result<bool, CommitError> {
        match storage::stat(&self.location, &layout::commit_rel_path(version)).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(source) => Err(CommitError::Storage { source }),
        }
    }

    /// Versions present in the log directory listing, ascending, restricted
    /// to `from..=to` (unbounded above when `to` is `None`).
    ///
    /// The listing may lag behind recent commits; use
    /// [`TransactionLogStore::latest_version`] to find the true head.
    pub async fn list_versions(&self, from: u64, to: Option<u64>) -> Result<Vec<u64>, CommitError> {
        let listed = storage::list_files(&self.location, &layout::log_rel_dir())
            .await
            .context(StorageSnafu)?;

        let mut versions: Vec<u64> = listed
            .iter()
            .filter_map(|f| {
                let name = Path::new(&f.rel_path).file_name()?.to_str()?;
                layout::parse_commit_file_name(name)
            })
            .filter(|v| *v >= from && to.is_none_or(|to| *v <= to))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Read the advisory `CURRENT` hint.
    ///
    /// A missing or unparseable hint yields `None`; it is only ever a
    /// starting point for probing.
    pub async fn load_current_hint(&self) -> Result<Option<u64>, CommitError> {
        let rel = layout::current_rel_path();
        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        match contents.trim().parse::<u64>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(
                    "ignoring unreadable CURRENT hint {:?} at {}: {e}",
                    contents.trim(),
                    self.location
                );
                Ok(None)
            }
        }
    }

    /// The latest committed version, or `None` if the log is empty.
    ///
    /// Starts from the `CURRENT` hint (falling back to the listing when the
    /// hint is absent or points at a missing file) and probes forward with
    /// point reads until a version is missing. Stale hints and stale listings
    /// therefore never hide a committed version.
    pub async fn latest_version(&self) -> Result<Option<u64>, CommitError> {
        let mut start = None;
        if let Some(hint) = self.load_current_hint().await? {
            if self.commit_exists(hint).await? {
                start = Some(hint);
            } else {
                debug!("CURRENT hint {hint} has no commit file; falling back to listing");
            }
        }
        if start.is_none() {
            start = self.list_versions(0, None).await?.last().copied();
        }
        let mut latest = match start {
            Some(v) => v,
            None => {
                if !self.commit_exists(0).await? {
                    return Ok(None);
                }
                0
            }
        };

        while self.commit_exists(latest + 1).await? {
            latest += 1;
        }
        Ok(Some(latest))
    }

    /// Oldest version that can still be read after vacuum. `0` when no
    /// vacuum has raised it.
    pub async fn load_history_floor(&self) -> Result<u64, CommitError> {
        let rel = layout::history_floor_rel_path();
        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };
        let trimmed = contents.trim();
        trimmed.parse::<u64>().map_err(|e| {
            CorruptStateSnafu {
                msg: format!("history floor has invalid content {trimmed:?}: {e}"),
            }
            .build()
        })
    }

    /// Raise the history floor to at least `version` and return the
    /// resulting floor. The floor never moves backwards.
    pub async fn raise_history_floor(&self, version: u64) -> Result<u64, CommitError> {
        let rel = layout::history_floor_rel_path();
        loop {
            let current = self.load_history_floor().await?;
            if current >= version {
                return Ok(current);
            }
            storage::write_atomic(&self.location, &rel, format!("{version}\n").as_bytes())
                .await
                .context(StorageSnafu)?;
            // A concurrent raise may have written a lower value over ours.
            let stored = self.load_history_floor().await?;
            if stored >= version {
                return Ok(stored);
            }
        }
    }
}
