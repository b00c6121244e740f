//! Typed view of the recognised keys in `Metadata.configuration`.
//!
//! Unknown keys are preserved in the metadata and ignored here. Invalid
//! values for recognised keys are rejected when a table is created or
//! opened, not when the value is first used.
use std::collections::BTreeMap;

use chrono::Duration;
use snafu::prelude::*;

/// Allow writers to evolve the schema automatically.
pub const AUTO_MERGE_KEY: &str = "schema.autoMerge.enabled";
/// Refuse vacuum retentions shorter than [`MIN_SAFE_RETENTION_HOURS`].
pub const RETENTION_CHECK_KEY: &str = "retentionDurationCheck.enabled";
/// Target upper bound for compacted files, in bytes.
pub const OPTIMIZE_MAX_FILE_SIZE_KEY: &str = "optimize.maxFileSize";
/// Files below this size are compaction candidates, in bytes.
pub const OPTIMIZE_MIN_FILE_SIZE_KEY: &str = "optimize.minFileSize";
/// Default vacuum retention, in hours.
pub const VACUUM_RETENTION_HOURS_KEY: &str = "vacuum.retentionHours";

/// Retention below this many hours needs the safety check disabled.
pub const MIN_SAFE_RETENTION_HOURS: u64 = 168;

const MIB: u64 = 1024 * 1024;

/// Invalid value for a recognised configuration key.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(display("Invalid value {value:?} for {key}: expected {expected}"))]
pub struct TableConfigError {
    /// The configuration key.
    pub key: String,
    /// The rejected value.
    pub value: String,
    /// What the key accepts.
    pub expected: String,
}

/// Parsed table configuration with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// `schema.autoMerge.enabled`, default false.
    pub auto_merge: bool,
    /// `retentionDurationCheck.enabled`, default true.
    pub retention_check: bool,
    /// `optimize.maxFileSize`, default 128 MiB.
    pub optimize_max_file_size: u64,
    /// `optimize.minFileSize`, default 32 MiB.
    pub optimize_min_file_size: u64,
    /// `vacuum.retentionHours`, default 168.
    pub vacuum_retention_hours: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            auto_merge: false,
            retention_check: true,
            optimize_max_file_size: 128 * MIB,
            optimize_min_file_size: 32 * MIB,
            vacuum_retention_hours: MIN_SAFE_RETENTION_HOURS,
        }
    }
}

impl TableConfig {
    /// Parse the recognised keys out of a metadata configuration map.
    pub fn from_configuration(
        configuration: &BTreeMap<String, String>,
    ) -> Result<Self, TableConfigError> {
        let mut config = TableConfig::default();

        if let Some(v) = configuration.get(AUTO_MERGE_KEY) {
            config.auto_merge = parse_bool(AUTO_MERGE_KEY, v)?;
        }
        if let Some(v) = configuration.get(RETENTION_CHECK_KEY) {
            config.retention_check = parse_bool(RETENTION_CHECK_KEY, v)?;
        }
        if let Some(v) = configuration.get(OPTIMIZE_MAX_FILE_SIZE_KEY) {
            config.optimize_max_file_size = parse_bytes(OPTIMIZE_MAX_FILE_SIZE_KEY, v)?;
        }
        if let Some(v) = configuration.get(OPTIMIZE_MIN_FILE_SIZE_KEY) {
            config.optimize_min_file_size = parse_bytes(OPTIMIZE_MIN_FILE_SIZE_KEY, v)?;
        }
        if let Some(v) = configuration.get(VACUUM_RETENTION_HOURS_KEY) {
            config.vacuum_retention_hours = v.trim().parse().ok().context(TableConfigSnafu {
                key: VACUUM_RETENTION_HOURS_KEY,
                value: v.as_str(),
                expected: "a whole number of hours",
            })?;
        }

        ensure!(
            config.optimize_max_file_size > 0,
            TableConfigSnafu {
                key: OPTIMIZE_MAX_FILE_SIZE_KEY,
                value: config.optimize_max_file_size.to_string(),
                expected: "a positive size",
            }
        );
        ensure!(
            config.optimize_min_file_size <= config.optimize_max_file_size,
            TableConfigSnafu {
                key: OPTIMIZE_MIN_FILE_SIZE_KEY,
                value: config.optimize_min_file_size.to_string(),
                expected: format!(
                    "a size no larger than {OPTIMIZE_MAX_FILE_SIZE_KEY} ({})",
                    config.optimize_max_file_size
                ),
            }
        );

        Ok(config)
    }

    /// Default vacuum retention as a duration.
    pub fn vacuum_retention(&self) -> Duration {
        hours(self.vacuum_retention_hours)
    }
}

/// Convert hours to a [`Duration`], saturating for absurd values.
pub fn hours(h: u64) -> Duration {
    Duration::try_hours(i64::try_from(h).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, TableConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => TableConfigSnafu {
            key,
            value,
            expected: "true or false",
        }
        .fail(),
    }
}

/// Parse a byte count: a plain integer, optionally suffixed with `KiB`,
/// `MiB` or `GiB`.
fn parse_bytes(key: &str, value: &str) -> Result<u64, TableConfigError> {
    let trimmed = value.trim();
    let (digits, multiplier) = [("KiB", 1024), ("MiB", MIB), ("GiB", 1024 * MIB)]
        .iter()
        .find_map(|(suffix, m)| trimmed.strip_suffix(suffix).map(|d| (d.trim(), *m)))
        .unwrap_or((trimmed, 1));

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .context(TableConfigSnafu {
            key,
            value,
            expected: "a byte count such as 1048576 or 64MiB",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let config = TableConfig::from_configuration(&conf(&[("some.other", "x")]))
            .expect("defaults");
        assert_eq!(config, TableConfig::default());
        assert!(!config.auto_merge);
        assert!(config.retention_check);
        assert_eq!(config.optimize_max_file_size, 128 * MIB);
        assert_eq!(config.optimize_min_file_size, 32 * MIB);
        assert_eq!(config.vacuum_retention(), Duration::hours(168));
    }

    #[test]
    fn parses_recognised_keys() {
        let config = TableConfig::from_configuration(&conf(&[
            (AUTO_MERGE_KEY, "TRUE"),
            (RETENTION_CHECK_KEY, "false"),
            (OPTIMIZE_MAX_FILE_SIZE_KEY, "64MiB"),
            (OPTIMIZE_MIN_FILE_SIZE_KEY, "1024"),
            (VACUUM_RETENTION_HOURS_KEY, "0"),
        ]))
        .expect("valid");
        assert!(config.auto_merge);
        assert!(!config.retention_check);
        assert_eq!(config.optimize_max_file_size, 64 * MIB);
        assert_eq!(config.optimize_min_file_size, 1024);
        assert_eq!(config.vacuum_retention_hours, 0);
    }

    #[test]
    fn rejects_invalid_values() {
        for pairs in [
            vec![(AUTO_MERGE_KEY, "yes")],
            vec![(OPTIMIZE_MAX_FILE_SIZE_KEY, "big")],
            vec![(OPTIMIZE_MAX_FILE_SIZE_KEY, "0")],
            vec![(VACUUM_RETENTION_HOURS_KEY, "-1")],
            vec![
                (OPTIMIZE_MAX_FILE_SIZE_KEY, "10"),
                (OPTIMIZE_MIN_FILE_SIZE_KEY, "20"),
            ],
        ] {
            let err = TableConfig::from_configuration(&conf(&pairs));
            assert!(err.is_err(), "{pairs:?} should be rejected");
        }
    }
}
