//! Built-in JSON-lines data file format.
//!
//! Each line holds one [`Row`] with type-tagged values, so files stay
//! readable after later schema promotions: a reader widens the stored values
//! to the current schema with [`Row::project`]. Partition columns are stored
//! in the rows as well; the partition directory in the path is cosmetic.
//!
//! Files are written with create-if-absent semantics under a fresh random
//! name and are never modified afterwards.
use std::{collections::BTreeMap, path::Path};

use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use snafu::prelude::*;

use super::{DataResult, DecodeSnafu, EncodeSnafu, Row, StorageSnafu};
use crate::{
    layout,
    storage::{self, TableLocation},
    transaction_log::{AddFile, PartitionValues},
};

/// How many data files are read concurrently.
const READ_CONCURRENCY: usize = 8;

/// Partition values of `row` for the given partition columns.
pub fn partition_values_of(row: &Row, partition_columns: &[String]) -> PartitionValues {
    partition_columns
        .iter()
        .map(|c| (c.clone(), row.value(c).partition_string()))
        .collect()
}

/// Encode `rows` into a new data file and describe it as an [`AddFile`].
pub async fn write_row_file(
    location: &TableLocation,
    rows: &[Row],
    partition_values: PartitionValues,
    data_change: bool,
) -> DataResult<AddFile> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row).context(EncodeSnafu)?;
        buf.push(b'\n');
    }

    let path = layout::new_data_file_rel_path(&partition_values);
    storage::write_new(location, Path::new(&path), &buf)
        .await
        .context(StorageSnafu)?;

    Ok(AddFile {
        path,
        size: buf.len() as u64,
        row_count: Some(rows.len() as u64),
        modification_time: Utc::now(),
        data_change,
        partition_values,
    })
}

/// Group `rows` by partition and write one file per non-empty partition.
///
/// Files come back ordered by partition values.
pub async fn write_partitioned(
    location: &TableLocation,
    rows: Vec<Row>,
    partition_columns: &[String],
    data_change: bool,
) -> DataResult<Vec<AddFile>> {
    let mut groups: BTreeMap<PartitionValues, Vec<Row>> = BTreeMap::new();
    for row in rows {
        groups
            .entry(partition_values_of(&row, partition_columns))
            .or_default()
            .push(row);
    }

    let mut adds = Vec::with_capacity(groups.len());
    for (partition_values, rows) in groups {
        adds.push(write_row_file(location, &rows, partition_values, data_change).await?);
    }
    Ok(adds)
}

/// Decode every row of the data file at `path`.
pub async fn read_row_file(location: &TableLocation, path: &str) -> DataResult<Vec<Row>> {
    let text = storage::read_to_string(location, Path::new(path))
        .await
        .context(StorageSnafu)?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).context(DecodeSnafu {
                path,
                line: idx + 1,
            })
        })
        .collect()
}

/// Read several data files concurrently, preserving input order.
pub async fn read_row_files<'a, I>(
    location: &TableLocation,
    paths: I,
) -> DataResult<Vec<(String, Vec<Row>)>>
where
    I: IntoIterator<Item = &'a str>,
{
    let paths: Vec<String> = paths.into_iter().map(str::to_string).collect();
    stream::iter(paths)
        .map(|path: String| async move {
            let rows = read_row_file(location, &path).await?;
            Ok::<_, super::DataError>((path, rows))
        })
        .buffered(READ_CONCURRENCY)
        .try_collect()
        .await
}
