//! Storage backend primitives.
//!
//! Everything above this module talks to the underlying store through a
//! handful of operations on paths relative to a table root:
//!
//! - [`write_new`]: atomic "create only if absent". This is the single
//!   primitive the commit protocol relies on for mutual exclusion between
//!   writers racing for the same log version.
//! - [`write_atomic`]: write-then-rename replacement, used for advisory
//!   pointer files that may be overwritten.
//! - Reads ([`read_to_string`], [`read_all_bytes`]), [`stat`],
//!   [`delete_file`] and a recursive [`list_files`].
//!
//! Listing is treated as eventually consistent: callers may use it to
//! discover files, but never to decide whether a commit succeeded.
//!
//! Only the local filesystem is implemented. The API is shaped so that an
//! object-store backend with conditional puts can be added behind
//! [`TableLocation`] without touching the log or table logic.

use chrono::{DateTime, Utc};
use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root location of a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableLocation {
    /// A table stored on the local filesystem at the given path.
    Local(PathBuf),
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// Parse a user-facing location string.
    ///
    /// Plain paths and `file://` URLs map to [`TableLocation::Local`]; any other
    /// scheme is rejected.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return UnsupportedLocationSnafu {
                spec: spec.to_string(),
                reason: "location is empty",
            }
            .fail();
        }

        if let Some(path) = trimmed.strip_prefix("file://") {
            return Ok(TableLocation::local(path));
        }

        if let Some((scheme, _)) = trimmed.split_once("://") {
            return UnsupportedLocationSnafu {
                spec: spec.to_string(),
                reason: format!("scheme {scheme:?} is not supported"),
            }
            .fail();
        }

        Ok(TableLocation::local(trimmed))
    }

    /// Root path of a local table.
    pub fn root(&self) -> &Path {
        match self {
            TableLocation::Local(root) => root,
        }
    }
}

impl fmt::Display for TableLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Errors produced by the storage backend implementation.
///
/// Backend-specific I/O errors are wrapped here so higher layers can map
/// them into [`StorageError`] variants with additional context.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other I/O failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The location string could not be mapped to a supported backend.
    #[snafu(display("Unsupported table location {spec:?}: {reason}"))]
    UnsupportedLocation {
        /// The location string supplied by the caller.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl StorageError {
    /// True when the error reports a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Size and modification time of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Length in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// One entry returned by [`list_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    /// Path relative to the table root, always `/`-separated.
    pub rel_path: String,
    /// Size and modification time.
    pub stat: FileStat,
}

fn join_local(location: &TableLocation, rel: &Path) -> PathBuf {
    match location {
        TableLocation::Local(root) => root.join(rel),
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn temp_sibling(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Write `contents` to `rel_path` with write-then-rename semantics.
///
/// The payload is written and synced to a uniquely named temporary sibling
/// and then renamed over the target, so readers observe either the old or
/// the new contents. Existing files are replaced.
pub async fn write_atomic(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = temp_sibling(&abs);
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .map_err(|e| classify(&tmp_path, e))?;
                file.write_all(contents)
                    .await
                    .map_err(|e| classify(&tmp_path, e))?;
                file.sync_all()
                    .await
                    .map_err(|e| classify(&tmp_path, e))?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();
            Ok(())
        }
    }
}

/// Create a *new* file at `rel_path` holding `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file is already present.
///
/// The payload is written and synced to a temporary sibling first and then
/// published with a hard link. Linking refuses an existing target, so exactly
/// one of several racing callers wins, and the target never becomes visible
/// before its full contents are on disk.
pub async fn write_new(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = temp_sibling(&abs);
            let _guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&tmp_path)
                    .await
                    .map_err(|e| classify(&tmp_path, e))?;
                file.write_all(contents)
                    .await
                    .map_err(|e| classify(&tmp_path, e))?;
                file.sync_all()
                    .await
                    .map_err(|e| classify(&tmp_path, e))?;
            }

            // The guard unlinks the staging name on every path; the published
            // link keeps the data alive.
            fs::hard_link(&tmp_path, &abs)
                .await
                .map_err(|e| classify(&abs, e))
        }
    }
}

/// Read the file at `rel_path` as UTF-8 text.
pub async fn read_to_string(location: &TableLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read_to_string(&abs)
                .await
                .map_err(|e| classify(&abs, e))
        }
    }
}

/// Read the full contents of the file at `rel_path`.
pub async fn read_all_bytes(location: &TableLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read(&abs).await.map_err(|e| classify(&abs, e))
        }
    }
}

fn to_utc(time: io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Size and modification time of the file at `rel_path`.
pub async fn stat(location: &TableLocation, rel_path: &Path) -> StorageResult<FileStat> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let meta = fs::metadata(&abs).await.map_err(|e| classify(&abs, e))?;
            Ok(FileStat {
                size: meta.len(),
                modified: to_utc(meta.modified()),
            })
        }
    }
}

/// Delete the file at `rel_path`.
///
/// A missing file is reported as [`StorageError::NotFound`]; callers that
/// treat deletion as idempotent can match on it.
pub async fn delete_file(location: &TableLocation, rel_path: &Path) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::remove_file(&abs).await.map_err(|e| classify(&abs, e))
        }
    }
}

/// Recursively list regular files below `rel_dir`.
///
/// A missing directory yields an empty listing. Results are sorted by path.
/// Temporary files staged by [`write_atomic`] and [`write_new`] are skipped.
pub async fn list_files(
    location: &TableLocation,
    rel_dir: &Path,
) -> StorageResult<Vec<ListedFile>> {
    match location {
        TableLocation::Local(root) => {
            let mut out = Vec::new();
            let mut pending = vec![rel_dir.to_path_buf()];

            while let Some(dir) = pending.pop() {
                let abs_dir = root.join(&dir);
                let mut entries = match fs::read_dir(&abs_dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(classify(&abs_dir, e)),
                };

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| classify(&abs_dir, e))?
                {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let rel = dir.join(&name);
                    let file_type = entry
                        .file_type()
                        .await
                        .map_err(|e| classify(&entry.path(), e))?;

                    if file_type.is_dir() {
                        pending.push(rel);
                    } else if file_type.is_file() && !name.ends_with(".tmp") {
                        let meta = entry
                            .metadata()
                            .await
                            .map_err(|e| classify(&entry.path(), e))?;
                        out.push(ListedFile {
                            rel_path: rel_to_string(&rel),
                            stat: FileStat {
                                size: meta.len(),
                                modified: to_utc(meta.modified()),
                            },
                        });
                    }
                }
            }

            out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
            Ok(out)
        }
    }
}

/// Render a relative path with `/` separators regardless of platform.
pub fn rel_to_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_and_overwrites() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let rel_path = Path::new("nested/dir/pointer");

        write_atomic(&location, rel_path, b"original").await?;
        write_atomic(&location, rel_path, b"updated").await?;

        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "updated");

        // No temporary siblings are left behind.
        let listed = list_files(&location, Path::new("nested")).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].rel_path, "nested/dir/pointer");
        Ok(())
    }

    #[tokio::test]
    async fn write_new_fails_if_file_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let rel_path = Path::new("log/0001.json");

        write_new(&location, rel_path, b"first").await?;
        let err = write_new(&location, rel_path, b"second")
            .await
            .expect_err("expected AlreadyExists error");
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "first");
        Ok(())
    }

    #[tokio::test]
    async fn racing_write_new_has_exactly_one_winner() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let location = location.clone();
            handles.push(tokio::spawn(async move {
                write_new(&location, Path::new("race/target"), &[i]).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await? {
                Ok(()) => winners += 1,
                Err(StorageError::AlreadyExists { .. }) => {}
                Err(other) => return Err(other.into()),
            }
        }
        assert_eq!(winners, 1);

        // Winners and losers alike clean up their staging files.
        let entries = std::fs::read_dir(tmp.path().join("race"))?.count();
        assert_eq!(entries, 1);
        let published = read_all_bytes(&location, Path::new("race/target")).await?;
        assert_eq!(published.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        let err = read_to_string(&location, Path::new("missing.txt"))
            .await
            .expect_err("expected NotFound");
        assert!(err.is_not_found());

        let err = delete_file(&location, Path::new("missing.txt"))
            .await
            .expect_err("expected NotFound");
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn list_files_recurses_and_tolerates_missing_dir() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        assert!(list_files(&location, Path::new("data")).await?.is_empty());

        write_new(&location, Path::new("data/a=1/part-1"), b"abc").await?;
        write_new(&location, Path::new("data/part-0"), b"x").await?;

        let listed = list_files(&location, Path::new("data")).await?;
        let paths: Vec<_> = listed.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["data/a=1/part-1", "data/part-0"]);
        assert_eq!(listed[0].stat.size, 3);

        let st = stat(&location, Path::new("data/part-0")).await?;
        assert_eq!(st.size, 1);
        Ok(())
    }

    #[test]
    fn parse_location_accepts_paths_and_file_urls() -> TestResult {
        assert_eq!(
            TableLocation::parse("/tmp/t")?,
            TableLocation::local("/tmp/t")
        );
        assert_eq!(
            TableLocation::parse("file:///tmp/t")?,
            TableLocation::local("/tmp/t")
        );
        assert!(matches!(
            TableLocation::parse("s3://bucket/t"),
            Err(StorageError::UnsupportedLocation { .. })
        ));
        assert!(TableLocation::parse("  ").is_err());
        Ok(())
    }
}
