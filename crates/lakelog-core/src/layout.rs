//! On-disk layout helpers for a table root.
//!
//! All functions return paths *relative* to the table root. Callers join
//! them with a [`crate::storage::TableLocation`] before doing IO.
//!
//! ```text
//! table_root/
//!   _table_log/
//!     CURRENT                        # advisory hint: latest version ("3\n")
//!     _history_floor                 # oldest version still readable after vacuum
//!     00000000000000000000.json      # version 0 (CREATE)
//!     00000000000000000001.json
//!   data/
//!     part-<uuid>.jsonl              # unpartitioned data file
//!     country=US/part-<uuid>.jsonl   # partitioned data file
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Name of the subdirectory containing the commit log.
pub const LOG_DIR_NAME: &str = "_table_log";

/// Name of the advisory pointer to the latest committed version.
pub const CURRENT_FILE_NAME: &str = "CURRENT";

/// Name of the pointer recording the oldest version readable after vacuum.
pub const HISTORY_FLOOR_FILE_NAME: &str = "_history_floor";

/// Number of digits used in zero-padded commit file names.
pub const COMMIT_FILENAME_DIGITS: usize = 20;

/// Conventional directory where data files are stored.
pub const DATA_DIR_NAME: &str = "data";

/// Extension of data files written by the built-in row file format.
pub const DATA_FILE_EXT: &str = "jsonl";

/// Partition directory value used for null partition values.
pub const NULL_PARTITION_VALUE: &str = "__NULL__";

/// Relative path: `_table_log/`
pub fn log_rel_dir() -> PathBuf {
    PathBuf::from(LOG_DIR_NAME)
}

/// Relative path: `_table_log/CURRENT`
pub fn current_rel_path() -> PathBuf {
    log_rel_dir().join(CURRENT_FILE_NAME)
}

/// Relative path: `_table_log/_history_floor`
pub fn history_floor_rel_path() -> PathBuf {
    log_rel_dir().join(HISTORY_FLOOR_FILE_NAME)
}

/// Relative path: `_table_log/<zero-padded>.json`
pub fn commit_rel_path(version: u64) -> PathBuf {
    let file_name = format!("{:0width$}.json", version, width = COMMIT_FILENAME_DIGITS);
    log_rel_dir().join(file_name)
}

/// Parse a commit file name (`00000000000000000007.json`) into its version.
///
/// Anything that is not exactly a zero-padded number with a `.json`
/// extension is rejected, including pointer and temporary files.
pub fn parse_commit_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".json")?;
    if stem.len() != COMMIT_FILENAME_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Relative path: `data/`
pub fn data_rel_dir() -> PathBuf {
    PathBuf::from(DATA_DIR_NAME)
}

/// Relative path of a fresh data file for the given partition.
///
/// Partition columns are laid out as `col=value` directories sorted by
/// column name. The directory structure is informational only: readers take
/// partition values from the log, never from the path.
pub fn new_data_file_rel_path(partition_values: &BTreeMap<String, Option<String>>) -> String {
    let mut parts = vec![DATA_DIR_NAME.to_string()];
    for (column, value) in partition_values {
        let value = value.as_deref().unwrap_or(NULL_PARTITION_VALUE);
        parts.push(format!(
            "{}={}",
            escape_partition_component(column),
            escape_partition_component(value)
        ));
    }
    parts.push(format!(
        "part-{}.{DATA_FILE_EXT}",
        uuid::Uuid::new_v4().simple()
    ));
    parts.join("/")
}

fn escape_partition_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '/' | '\\' | '=' | '%' | ':' => out.push_str(&format!("%{:02X}", ch as u32)),
            c if c.is_control() => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
