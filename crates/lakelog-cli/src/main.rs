//! CLI tool for managing lakelog tables.

mod error;
mod rows;

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use lakelog_core::{
    Table,
    maintenance::{OptimizeOptions, VacuumOptions},
    merge::{Expr, MatchedAction, MergeRequest, NotMatchedAction},
    schema::{LogicalDataType, LogicalField, LogicalSchema},
    storage::TableLocation,
    table::{CreateTableOptions, WriteMode, WriteOptions},
    transaction_log::SnapshotSpec,
};
use log::debug;
use serde_json::json;
use snafu::{OptionExt, ResultExt};

use crate::{
    error::{
        CliResult, CreateTableSnafu, InvalidColumnSnafu, InvalidSchemaSnafu, InvalidTimestampSnafu,
        LocationSnafu, MissingJoinColumnsSnafu, OpenTableSnafu, OperationSnafu,
    },
    rows::{load_batch, parse_key_values, print_json, print_json_lines},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Append,
    Overwrite,
}

impl From<ModeArg> for WriteMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Append => WriteMode::Append,
            ModeArg::Overwrite => WriteMode::Overwrite,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatchedArg {
    Update,
    Delete,
    Ignore,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NotMatchedArg {
    Insert,
    Ignore,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty table at version 0
    Create {
        #[arg(long)]
        table: PathBuf,

        /// Repeatable NAME:TYPE or NAME:TYPE:not-null, e.g. id:int64:not-null
        #[arg(long = "column", required = true)]
        columns: Vec<String>,

        /// Repeatable partition column names
        #[arg(long = "partition")]
        partitions: Vec<String>,

        /// Repeatable KEY=VALUE table configuration
        #[arg(long = "config")]
        config: Vec<String>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Append or overwrite rows read as JSON lines
    Insert {
        #[arg(long)]
        table: PathBuf,

        /// JSON-lines file, `-` for stdin
        #[arg(long)]
        input: PathBuf,

        #[arg(long, value_enum, default_value_t = ModeArg::Append)]
        mode: ModeArg,

        /// Allow new columns and type widening for this write
        #[arg(long, default_value_t = false)]
        merge_schema: bool,
    },

    /// Merge JSON-lines rows into the table on equal key columns
    Merge {
        #[arg(long)]
        table: PathBuf,

        /// JSON-lines file, `-` for stdin
        #[arg(long)]
        input: PathBuf,

        /// Repeatable key columns joined as target.col = source.col
        #[arg(long = "on")]
        on: Vec<String>,

        #[arg(long, value_enum, default_value_t = MatchedArg::Update)]
        when_matched: MatchedArg,

        #[arg(long, value_enum, default_value_t = NotMatchedArg::Insert)]
        when_not_matched: NotMatchedArg,

        /// Allow new columns and type widening for this merge
        #[arg(long, default_value_t = false)]
        merge_schema: bool,
    },

    /// Print commits, newest first, as JSON lines
    History {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print table details as JSON
    Detail {
        #[arg(long)]
        table: PathBuf,
    },

    /// Print the rows of a version as JSON lines
    Read {
        #[arg(long)]
        table: PathBuf,

        #[arg(long, conflicts_with = "timestamp")]
        version: Option<u64>,

        /// RFC 3339 timestamp; reads the latest version committed at or before it
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// Compact small files
    Optimize {
        #[arg(long)]
        table: PathBuf,

        /// Repeatable KEY=VALUE partition filter
        #[arg(long = "partition")]
        partitions: Vec<String>,

        #[arg(long)]
        target_size: Option<u64>,

        #[arg(long)]
        min_file_size: Option<u64>,
    },

    /// Delete files no longer referenced within the retention window
    Vacuum {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        retention_hours: Option<u64>,

        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Allow retentions below the safety minimum
        #[arg(long, default_value_t = false)]
        no_retention_check: bool,
    },
}

#[derive(Debug, Parser)]
#[command(name = "lakelog", version, about = "Transactional tables over a commit log")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

fn location_of(table: &Path) -> CliResult<TableLocation> {
    let spec = table.to_string_lossy();
    TableLocation::parse(spec.as_ref()).context(LocationSnafu {
        location: spec.to_string(),
    })
}

fn parse_column(spec: &str) -> CliResult<LogicalField> {
    let invalid = || InvalidColumnSnafu { spec }.build();
    let mut parts = spec.split(':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
    let data_type = parts
        .next()
        .and_then(|t| t.parse::<LogicalDataType>().ok())
        .ok_or_else(invalid)?;
    let nullable = match parts.next() {
        None => true,
        Some("not-null") => false,
        Some(_) => return Err(invalid()),
    };
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(LogicalField::new(name, data_type, nullable))
}

async fn open_table(table: &Path) -> CliResult<Table> {
    Table::open(location_of(table)?)
        .await
        .context(OpenTableSnafu {
            table: table.display().to_string(),
        })
}

async fn cmd_create(
    table: &Path,
    columns: &[String],
    partitions: Vec<String>,
    config: &[String],
    name: Option<String>,
    description: Option<String>,
) -> CliResult<()> {
    let fields = columns
        .iter()
        .map(|c| parse_column(c))
        .collect::<CliResult<Vec<_>>>()?;
    let schema = LogicalSchema::new(fields).context(InvalidSchemaSnafu)?;

    let mut options = CreateTableOptions::new(schema).with_partition_columns(partitions);
    for (key, value) in parse_key_values("config", config)? {
        options = options.with_config(key, value);
    }
    if let Some(name) = name {
        options = options.with_name(name);
    }
    options.description = description;

    Table::create(location_of(table)?, options)
        .await
        .context(CreateTableSnafu {
            table: table.display().to_string(),
        })?;

    println!("Created table at {}", table.display());
    Ok(())
}

async fn cmd_insert(table: &Path, input: &Path, mode: ModeArg, merge_schema: bool) -> CliResult<()> {
    let t = open_table(table).await?;
    let snapshot = t
        .snapshot(SnapshotSpec::Latest)
        .await
        .context(OperationSnafu {
            operation: "insert",
            table: table.display().to_string(),
        })?;
    let batch = load_batch(input, &snapshot.metadata.schema).await?;
    debug!("loaded {} rows from {}", batch.len(), input.display());

    let options = WriteOptions {
        mode: mode.into(),
        merge_schema: merge_schema.then_some(true),
    };
    let version = t.write(batch, options).await.context(OperationSnafu {
        operation: "insert",
        table: table.display().to_string(),
    })?;

    println!("Committed version {version}");
    Ok(())
}

struct MergeArgs {
    table: PathBuf,
    input: PathBuf,
    on: Vec<String>,
    when_matched: MatchedArg,
    when_not_matched: NotMatchedArg,
    merge_schema: bool,
}

async fn cmd_merge(args: MergeArgs) -> CliResult<()> {
    let predicate = Expr::join_on(args.on.as_slice()).context(MissingJoinColumnsSnafu)?;
    let t = open_table(&args.table).await?;
    let snapshot = t
        .snapshot(SnapshotSpec::Latest)
        .await
        .context(OperationSnafu {
            operation: "merge",
            table: args.table.display().to_string(),
        })?;
    let source = load_batch(&args.input, &snapshot.metadata.schema).await?;
    debug!("loaded {} source rows from {}", source.len(), args.input.display());

    let mut request = MergeRequest::new(source, predicate);
    request = match args.when_matched {
        MatchedArg::Update => request.when_matched(None, MatchedAction::UpdateAll),
        MatchedArg::Delete => request.when_matched(None, MatchedAction::Delete),
        MatchedArg::Ignore => request,
    };
    request = match args.when_not_matched {
        NotMatchedArg::Insert => request.when_not_matched(None, NotMatchedAction::InsertAll),
        NotMatchedArg::Ignore => request,
    };
    if args.merge_schema {
        request = request.with_merge_schema(true);
    }

    let (version, metrics) = t.merge(request).await.context(OperationSnafu {
        operation: "merge",
        table: args.table.display().to_string(),
    })?;

    print_json(&json!({
        "version": version,
        "numSourceRows": metrics.num_source_rows,
        "numTargetRowsUpdated": metrics.num_target_rows_updated,
        "numTargetRowsDeleted": metrics.num_target_rows_deleted,
        "numTargetRowsInserted": metrics.num_target_rows_inserted,
        "numTargetRowsCopied": metrics.num_target_rows_copied,
        "numTargetFilesAdded": metrics.num_target_files_added,
        "numTargetFilesRemoved": metrics.num_target_files_removed,
    }))
}

async fn cmd_history(table: &Path, limit: Option<usize>) -> CliResult<()> {
    let t = open_table(table).await?;
    let history = t.describe_history(limit).await.context(OperationSnafu {
        operation: "history",
        table: table.display().to_string(),
    })?;

    print_json_lines(history.iter().map(|c| {
        json!({
            "version": c.version,
            "timestamp": c.timestamp.to_rfc3339(),
            "operation": c.operation.to_string(),
            "operationParameters": c.operation_parameters,
            "operationMetrics": c.operation_metrics,
            "readVersion": c.read_version,
            "isBlindAppend": c.is_blind_append,
        })
    }))
}

/// Arrow view of the table schema, for engines that read the data files.
fn arrow_fields(schema: &LogicalSchema) -> Vec<serde_json::Value> {
    schema
        .to_arrow_schema()
        .fields()
        .iter()
        .map(|f| {
            json!({
                "name": f.name(),
                "type": f.data_type().to_string(),
                "nullable": f.is_nullable(),
            })
        })
        .collect()
}

async fn cmd_detail(table: &Path) -> CliResult<()> {
    let t = open_table(table).await?;
    let detail = t.describe_detail().await.context(OperationSnafu {
        operation: "detail",
        table: table.display().to_string(),
    })?;

    print_json(&json!({
        "location": detail.location,
        "id": detail.metadata.id,
        "name": detail.metadata.name,
        "description": detail.metadata.description,
        "version": detail.version,
        "lastModified": detail.last_modified.to_rfc3339(),
        "createdTime": detail.metadata.created_time.to_rfc3339(),
        "schema": detail.metadata.schema,
        "arrowSchema": arrow_fields(&detail.metadata.schema),
        "partitionColumns": detail.metadata.partition_columns,
        "configuration": detail.metadata.configuration,
        "protocol": detail.protocol,
        "numFiles": detail.num_files,
        "sizeInBytes": detail.size_in_bytes,
        "numRows": detail.num_rows,
        "historyFloor": detail.history_floor,
    }))
}

async fn cmd_read(table: &Path, version: Option<u64>, timestamp: Option<String>) -> CliResult<()> {
    let spec = match (version, timestamp) {
        (Some(v), _) => SnapshotSpec::Version(v),
        (None, Some(ts)) => {
            let at = DateTime::parse_from_rfc3339(&ts)
                .context(InvalidTimestampSnafu { spec: ts.clone() })?;
            SnapshotSpec::Timestamp(at.with_timezone(&Utc))
        }
        (None, None) => SnapshotSpec::Latest,
    };

    let t = open_table(table).await?;
    let context = || OperationSnafu {
        operation: "read",
        table: table.display().to_string(),
    };
    let snapshot = t.snapshot(spec).await.with_context(|_| context())?;
    let rows = t.read_rows(&snapshot).await.with_context(|_| context())?;
    debug!("read {} rows at version {}", rows.len(), snapshot.version);

    print_json_lines(rows.iter().map(|r| r.to_json()))
}

async fn cmd_optimize(
    table: &Path,
    partitions: &[String],
    target_size: Option<u64>,
    min_file_size: Option<u64>,
) -> CliResult<()> {
    let t = open_table(table).await?;
    let options = OptimizeOptions {
        partition_filter: parse_key_values("partition", partitions)?
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect(),
        target_size,
        min_file_size,
        ..OptimizeOptions::default()
    };
    let metrics = t.optimize(options).await.context(OperationSnafu {
        operation: "optimize",
        table: table.display().to_string(),
    })?;

    print_json(&json!({
        "version": metrics.version,
        "numBins": metrics.num_bins,
        "numFilesRemoved": metrics.num_files_removed,
        "numFilesAdded": metrics.num_files_added,
        "bytesRemoved": metrics.bytes_removed,
        "bytesAdded": metrics.bytes_added,
        "rowsRewritten": metrics.rows_rewritten,
        "partitionsOptimized": metrics.partitions_optimized,
        "rounds": metrics.rounds,
    }))
}

async fn cmd_vacuum(
    table: &Path,
    retention_hours: Option<u64>,
    dry_run: bool,
    no_retention_check: bool,
) -> CliResult<()> {
    let t = open_table(table).await?;
    let options = VacuumOptions {
        retention: retention_hours.map(|h| {
            i64::try_from(h)
                .ok()
                .and_then(TimeDelta::try_hours)
                .unwrap_or(TimeDelta::MAX)
        }),
        dry_run,
        enforce_retention_check: no_retention_check.then_some(false),
    };
    let report = t.vacuum(options).await.context(OperationSnafu {
        operation: "vacuum",
        table: table.display().to_string(),
    })?;

    print_json(&json!({
        "version": report.version,
        "dryRun": dry_run,
        "candidates": report.candidates,
        "deleted": report.deleted,
        "failed": report.failed,
        "historyFloor": report.history_floor,
    }))
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Create {
            table,
            columns,
            partitions,
            config,
            name,
            description,
        } => cmd_create(&table, &columns, partitions, &config, name, description).await,

        Command::Insert {
            table,
            input,
            mode,
            merge_schema,
        } => cmd_insert(&table, &input, mode, merge_schema).await,

        Command::Merge {
            table,
            input,
            on,
            when_matched,
            when_not_matched,
            merge_schema,
        } => {
            cmd_merge(MergeArgs {
                table,
                input,
                on,
                when_matched,
                when_not_matched,
                merge_schema,
            })
            .await
        }

        Command::History { table, limit } => cmd_history(&table, limit).await,

        Command::Detail { table } => cmd_detail(&table).await,

        Command::Read {
            table,
            version,
            timestamp,
        } => cmd_read(&table, version, timestamp).await,

        Command::Optimize {
            table,
            partitions,
            target_size,
            min_file_size,
        } => cmd_optimize(&table, &partitions, target_size, min_file_size).await,

        Command::Vacuum {
            table,
            retention_hours,
            dry_run,
            no_retention_check,
        } => cmd_vacuum(&table, retention_hours, dry_run, no_retention_check).await,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
