//! Merge (upsert) of a source batch into a table.
//!
//! The merge joins every live target row with the source rows on a
//! predicate, applies the first matching clause of each kind, and rewrites
//! the touched files copy-on-write:
//!
//! - a target file with at least one updated or deleted row is removed and
//!   its surviving rows are written into new files, per partition;
//! - source rows that match nothing and pass a not-matched clause are
//!   inserted into new files, per partition.
//!
//! When the predicate has top-level `target.a = source.b` conjuncts the
//! source is indexed on them and each target row only checks the source rows
//! with equal keys; the full predicate is re-checked on every candidate.
//! A source row matching more than one target row, or a target row matched
//! by more than one source row, fails with
//! [`TableError::AmbiguousMerge`].
pub mod expr;

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use log::{debug, info};
use snafu::prelude::*;

pub use expr::{CompareOp, EvalRow, Expr, Side};

use crate::{
    data::{self, Row, RowBatch, value::KeyPart},
    schema::LogicalSchema,
    storage::TableLocation,
    table::error::{AmbiguousMergeSnafu, InvalidExpressionSnafu, TableError},
    transaction::Transaction,
    transaction_log::Action,
};

/// What to do with a target row matched by a source row.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchedAction {
    /// Overwrite every target column present in the source.
    UpdateAll,
    /// Set the listed columns to expressions over both rows.
    Update(Vec<(String, Expr)>),
    /// Delete the target row.
    Delete,
}

/// What to do with a source row that matched no target row.
#[derive(Debug, Clone, PartialEq)]
pub enum NotMatchedAction {
    /// Insert the source row as-is.
    InsertAll,
    /// Insert a row built from expressions over the source row.
    Insert(Vec<(String, Expr)>),
}

/// `WHEN MATCHED [AND condition] THEN action`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedClause {
    /// Extra condition; the clause applies only when it holds.
    pub condition: Option<Expr>,
    /// Action to take.
    pub action: MatchedAction,
}

/// `WHEN NOT MATCHED [AND condition] THEN action`.
#[derive(Debug, Clone, PartialEq)]
pub struct NotMatchedClause {
    /// Extra condition over the source row.
    pub condition: Option<Expr>,
    /// Action to take.
    pub action: NotMatchedAction,
}

/// A merge of `source` into a table.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    /// Incoming rows.
    pub source: RowBatch,
    /// Join predicate between target and source rows.
    pub predicate: Expr,
    /// Matched clauses, first applicable wins.
    pub matched: Vec<MatchedClause>,
    /// Not-matched clauses, first applicable wins.
    pub not_matched: Vec<NotMatchedClause>,
    /// Overrides `schema.autoMerge.enabled` for this merge.
    pub merge_schema: Option<bool>,
}

impl MergeRequest {
    /// A merge with no clauses yet.
    pub fn new(source: RowBatch, predicate: Expr) -> Self {
        Self {
            source,
            predicate,
            matched: Vec::new(),
            not_matched: Vec::new(),
            merge_schema: None,
        }
    }

    /// Append a matched clause.
    pub fn when_matched(mut self, condition: Option<Expr>, action: MatchedAction) -> Self {
        self.matched.push(MatchedClause { condition, action });
        self
    }

    /// Append a not-matched clause.
    pub fn when_not_matched(mut self, condition: Option<Expr>, action: NotMatchedAction) -> Self {
        self.not_matched.push(NotMatchedClause { condition, action });
        self
    }

    /// Shorthand for an unconditional `UPDATE SET *`.
    pub fn when_matched_update_all(self) -> Self {
        self.when_matched(None, MatchedAction::UpdateAll)
    }

    /// Shorthand for an unconditional `DELETE`.
    pub fn when_matched_delete(self) -> Self {
        self.when_matched(None, MatchedAction::Delete)
    }

    /// Shorthand for an unconditional `INSERT *`.
    pub fn when_not_matched_insert_all(self) -> Self {
        self.when_not_matched(None, NotMatchedAction::InsertAll)
    }

    /// Override the table's schema auto-merge setting.
    pub fn with_merge_schema(mut self, merge_schema: bool) -> Self {
        self.merge_schema = Some(merge_schema);
        self
    }

    fn uses_star_actions(&self) -> bool {
        self.matched
            .iter()
            .any(|c| c.action == MatchedAction::UpdateAll)
            || self
                .not_matched
                .iter()
                .any(|c| c.action == NotMatchedAction::InsertAll)
    }
}

/// Counters reported by a merge and recorded in its commit info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeMetrics {
    /// Rows in the source batch.
    pub num_source_rows: u64,
    /// Target rows rewritten with new values.
    pub num_target_rows_updated: u64,
    /// Target rows deleted.
    pub num_target_rows_deleted: u64,
    /// Source rows inserted.
    pub num_target_rows_inserted: u64,
    /// Unchanged target rows rewritten because they share a file with a
    /// changed row.
    pub num_target_rows_copied: u64,
    /// Files added.
    pub num_target_files_added: u64,
    /// Files removed.
    pub num_target_files_removed: u64,
}

impl MergeMetrics {
    fn record(&self, txn: &mut Transaction) {
        for (key, value) in [
            ("numSourceRows", self.num_source_rows),
            ("numTargetRowsUpdated", self.num_target_rows_updated),
            ("numTargetRowsDeleted", self.num_target_rows_deleted),
            ("numTargetRowsInserted", self.num_target_rows_inserted),
            ("numTargetRowsCopied", self.num_target_rows_copied),
            ("numTargetFilesAdded", self.num_target_files_added),
            ("numTargetFilesRemoved", self.num_target_files_removed),
        ] {
            txn.record_metric(key, value);
        }
    }
}

/// Index of source rows by their equi-join key values.
struct SourceIndex<'a> {
    target_keys: Vec<&'a str>,
    buckets: Option<HashMap<Vec<KeyPart>, Vec<usize>>>,
    len: usize,
}

impl<'a> SourceIndex<'a> {
    fn build(predicate: &'a Expr, source: &[Row]) -> Self {
        let keys = predicate.equi_join_keys();
        if keys.is_empty() {
            return Self {
                target_keys: Vec::new(),
                buckets: None,
                len: source.len(),
            };
        }

        let mut buckets: HashMap<Vec<KeyPart>, Vec<usize>> = HashMap::new();
        for (idx, row) in source.iter().enumerate() {
            // Null keys never join.
            let key: Option<Vec<KeyPart>> =
                keys.iter().map(|(_, s)| row.value(s).key_part()).collect();
            if let Some(key) = key {
                buckets.entry(key).or_default().push(idx);
            }
        }
        Self {
            target_keys: keys.iter().map(|(t, _)| *t).collect(),
            buckets: Some(buckets),
            len: source.len(),
        }
    }

    fn candidates(&self, target: &Row) -> Vec<usize> {
        let Some(buckets) = &self.buckets else {
            return (0..self.len).collect();
        };
        let key: Option<Vec<KeyPart>> = self
            .target_keys
            .iter()
            .map(|t| target.value(t).key_part())
            .collect();
        key.and_then(|k| buckets.get(&k).cloned())
            .unwrap_or_default()
    }
}

fn check_expr(
    expr: &Expr,
    target: Option<&LogicalSchema>,
    source: &LogicalSchema,
) -> Result<(), TableError> {
    expr.check_columns(target, source)
        .map_err(|reason| InvalidExpressionSnafu { reason }.build())
}

fn check_assignments(
    assignments: &[(String, Expr)],
    target: Option<&LogicalSchema>,
    source: &LogicalSchema,
    output: &LogicalSchema,
) -> Result<(), TableError> {
    for (column, expr) in assignments {
        ensure!(
            output.contains(column),
            InvalidExpressionSnafu {
                reason: format!("cannot assign to unknown column {column}"),
            }
        );
        check_expr(expr, target, source)?;
    }
    Ok(())
}

/// Evaluate `assignments` on top of `base`, coercing each value to its
/// column type.
fn assign(
    mut base: Row,
    assignments: &[(String, Expr)],
    row: EvalRow<'_>,
    output: &LogicalSchema,
) -> Result<Row, TableError> {
    for (column, expr) in assignments {
        let value = expr.eval(row);
        let Some(field) = output.field(column) else {
            continue;
        };
        let coerced = value.coerce_to(field.data_type).with_context(|| {
            InvalidExpressionSnafu {
                reason: format!(
                    "{expr} produced {value}, which does not fit {column} ({})",
                    field.data_type
                ),
            }
        })?;
        base.insert(column.clone(), coerced);
    }
    Ok(base)
}

/// Copy every source column onto `target`.
fn overlay(mut target: Row, source: &Row) -> Row {
    for (column, value) in source {
        target.insert(column.clone(), value.clone());
    }
    target
}

/// Run `request` against the transaction's read snapshot and stage the
/// resulting actions on `txn`. The caller commits.
pub(crate) async fn execute_merge(
    txn: &mut Transaction,
    location: &TableLocation,
    request: MergeRequest,
) -> Result<MergeMetrics, TableError> {
    let snapshot = txn.read_snapshot().clone();
    let target_schema = snapshot.schema().clone();
    let partition_columns = snapshot.partition_columns().to_vec();
    let source_schema = request.source.schema().clone();

    let output_schema = if request.uses_star_actions() {
        txn.stage_schema_change(&source_schema, request.merge_schema)?
    } else {
        target_schema.clone()
    };

    check_expr(&request.predicate, Some(&target_schema), &source_schema)?;
    for clause in &request.matched {
        if let Some(cond) = &clause.condition {
            check_expr(cond, Some(&target_schema), &source_schema)?;
        }
        if let MatchedAction::Update(assignments) = &clause.action {
            check_assignments(assignments, Some(&target_schema), &source_schema, &output_schema)?;
        }
    }
    for clause in &request.not_matched {
        if let Some(cond) = &clause.condition {
            check_expr(cond, None, &source_schema)?;
        }
        if let NotMatchedAction::Insert(assignments) = &clause.action {
            check_assignments(assignments, None, &source_schema, &output_schema)?;
        }
    }

    let source_rows = request.source.rows();
    let mut metrics = MergeMetrics {
        num_source_rows: source_rows.len() as u64,
        ..MergeMetrics::default()
    };

    // Join.
    let index = SourceIndex::build(&request.predicate, source_rows);
    let paths: Vec<&str> = snapshot.files.keys().map(String::as_str).collect();
    let target_files = data::read_row_files(location, paths.iter().copied()).await?;
    let check_ambiguity = !request.matched.is_empty();

    // For each source row, the (file, row) it matched.
    let mut source_match: Vec<Option<(usize, usize)>> = vec![None; source_rows.len()];
    let mut joined = Vec::with_capacity(target_files.len());
    for (file_idx, (path, rows)) in target_files.into_iter().enumerate() {
        let rows = rows
            .iter()
            .map(|r| r.project(&target_schema))
            .collect::<Result<Vec<_>, _>>()?;
        let mut matches = Vec::with_capacity(rows.len());
        for (row_idx, target) in rows.iter().enumerate() {
            let mut matched: Option<usize> = None;
            for s in index.candidates(target) {
                let row = EvalRow {
                    target: Some(target),
                    source: Some(&source_rows[s]),
                };
                if !request.predicate.holds(row) {
                    continue;
                }
                if check_ambiguity {
                    if let Some(prev) = matched {
                        return AmbiguousMergeSnafu {
                            reason: format!(
                                "row {row_idx} of {path} is matched by source rows {prev} and {s}"
                            ),
                        }
                        .fail();
                    }
                    if let Some((f, r)) = source_match[s] {
                        return AmbiguousMergeSnafu {
                            reason: format!(
                                "source row {s} matches row {r} of {} and row {row_idx} of {path}",
                                paths[f]
                            ),
                        }
                        .fail();
                    }
                }
                matched = Some(s);
                source_match[s] = Some((file_idx, row_idx));
            }
            matches.push(matched);
        }
        joined.push((path, rows, matches));
    }

    // Matched clauses, copy-on-write per file.
    let mut output_rows = Vec::new();
    let mut removes = Vec::new();
    let now = Utc::now();
    for (path, rows, matches) in joined {
        let mut changed = false;
        let mut copied = 0u64;
        let mut survivors = Vec::with_capacity(rows.len());
        for (target, matched) in rows.into_iter().zip(matches) {
            let Some(s) = matched else {
                copied += 1;
                survivors.push(target);
                continue;
            };
            let source = &source_rows[s];
            let row = EvalRow {
                target: Some(&target),
                source: Some(source),
            };
            let clause = request
                .matched
                .iter()
                .find(|c| c.condition.as_ref().is_none_or(|cond| cond.holds(row)));
            match clause.map(|c| &c.action) {
                None => {
                    copied += 1;
                    survivors.push(target.clone());
                }
                Some(MatchedAction::Delete) => {
                    changed = true;
                    metrics.num_target_rows_deleted += 1;
                }
                Some(MatchedAction::UpdateAll) => {
                    changed = true;
                    metrics.num_target_rows_updated += 1;
                    survivors.push(overlay(target.clone(), source));
                }
                Some(MatchedAction::Update(assignments)) => {
                    changed = true;
                    metrics.num_target_rows_updated += 1;
                    survivors.push(assign(target.clone(), assignments, row, &output_schema)?);
                }
            }
        }

        if changed {
            if let Some(add) = snapshot.files.get(&path) {
                removes.push(Action::Remove(add.to_remove(now, true)));
            }
            metrics.num_target_files_removed += 1;
            metrics.num_target_rows_copied += copied;
            output_rows.extend(survivors);
        }
    }

    // Not-matched clauses.
    for (s, source) in source_rows.iter().enumerate() {
        if source_match[s].is_some() {
            continue;
        }
        let row = EvalRow {
            target: None,
            source: Some(source),
        };
        let clause = request
            .not_matched
            .iter()
            .find(|c| c.condition.as_ref().is_none_or(|cond| cond.holds(row)));
        let inserted = match clause.map(|c| &c.action) {
            None => continue,
            Some(NotMatchedAction::InsertAll) => source.clone(),
            Some(NotMatchedAction::Insert(assignments)) => {
                assign(Row::new(), assignments, row, &output_schema)?
            }
        };
        metrics.num_target_rows_inserted += 1;
        output_rows.push(inserted);
    }

    // Validates nullability and widens values to the output schema.
    let batch = RowBatch::new(output_schema, output_rows)?;
    let adds = if batch.is_empty() {
        Vec::new()
    } else {
        data::write_partitioned(location, batch.into_rows(), &partition_columns, true).await?
    };
    metrics.num_target_files_added = adds.len() as u64;

    debug!(
        "merge on {location}: {} file(s) rewritten, {} file(s) added",
        removes.len(),
        adds.len()
    );
    txn.stage(removes.into_iter().chain(adds.into_iter().map(Action::Add)))?;
    metrics.record(txn);
    info!(
        "merge on {location} staged: {} updated, {} deleted, {} inserted",
        metrics.num_target_rows_updated,
        metrics.num_target_rows_deleted,
        metrics.num_target_rows_inserted
    );
    Ok(metrics)
}

/// Operation parameters recorded for a merge.
pub(crate) fn merge_parameters(request: &MergeRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("predicate".to_string(), request.predicate.to_string()),
        (
            "matchedClauses".to_string(),
            request.matched.len().to_string(),
        ),
        (
            "notMatchedClauses".to_string(),
            request.not_matched.len().to_string(),
        ),
    ])
}
