//! Schema evolution rules applied when writers bring a new schema.
//!
//! Two policies exist, selected by `schema.autoMerge.enabled` (or a
//! per-operation override):
//!
//! - **disabled**: the incoming schema must match the table schema by name
//!   and type. Column order is irrelevant. Incoming data may be stricter
//!   than the table (non-null into a nullable column) but never looser.
//! - **enabled**: new columns are appended as nullable, existing columns may
//!   be widened along the promotion set in [`can_promote`], and nullable
//!   incoming data relaxes a non-null column.

use std::collections::HashMap;

use snafu::prelude::*;

use super::{LogicalDataType, LogicalField, LogicalSchema, LogicalSchemaError};

/// Errors raised when an incoming schema is not compatible with the table.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaCompatibilityError {
    /// The incoming schema is missing a column that the table requires.
    #[snafu(display("Incoming schema is missing required column {column}"))]
    MissingColumn {
        /// The name of the missing column.
        column: String,
    },

    /// The incoming schema has a column the table does not know.
    #[snafu(display("Incoming schema has extra column {column} not present in table schema"))]
    ExtraColumn {
        /// The name of the extra column.
        column: String,
    },

    /// Column exists in both schemas, but the types cannot be reconciled.
    #[snafu(display(
        "Type mismatch for column {column}: table has {table_type}, incoming has {incoming_type}"
    ))]
    TypeMismatch {
        /// The name of the column with mismatched type.
        column: String,
        /// The type in the table schema.
        table_type: LogicalDataType,
        /// The type in the incoming schema.
        incoming_type: LogicalDataType,
    },

    /// Incoming data may contain nulls for a non-nullable column.
    #[snafu(display("Column {column} is not nullable in the table, but incoming data is"))]
    NullabilityMismatch {
        /// The name of the column.
        column: String,
    },

    /// A partition column cannot change type.
    #[snafu(display("Partition column {column} cannot change type"))]
    PartitionColumnChange {
        /// The partition column name.
        column: String,
    },

    /// Logical schema construction or validation failed.
    #[snafu(display("Logical schema is invalid: {source}"))]
    LogicalSchema {
        /// The underlying logical schema error.
        source: LogicalSchemaError,
    },
}

/// A convenience type alias for results of schema compatibility operations.
pub type SchemaResult<T> = Result<T, SchemaCompatibilityError>;

/// True if a column of type `from` may be widened to `to`.
///
/// Identity is not a promotion. The accepted set is:
/// Int8 → Int16/Int32/Int64/Float64, Int16 → Int32/Int64/Float64,
/// Int32 → Int64/Float64, Float32 → Float64 and Date → Timestamp.
pub fn can_promote(from: LogicalDataType, to: LogicalDataType) -> bool {
    use LogicalDataType::*;
    matches!(
        (from, to),
        (Int8, Int16 | Int32 | Int64 | Float64)
            | (Int16, Int32 | Int64 | Float64)
            | (Int32, Int64 | Float64)
            | (Float32, Float64)
            | (Date, Timestamp)
    )
}

fn columns_by_name(schema: &LogicalSchema) -> HashMap<&str, &LogicalField> {
    schema
        .columns()
        .iter()
        .map(|col| (col.name.as_str(), col))
        .collect()
}

/// Enforce the policy used when auto-merge is disabled.
///
/// - Every table column must appear in the incoming schema.
/// - No extra columns may appear in the incoming schema.
/// - Types must be identical.
/// - A nullable incoming column may not feed a non-nullable table column.
pub fn ensure_schema_exact_match(
    table_schema: &LogicalSchema,
    incoming_schema: &LogicalSchema,
) -> SchemaResult<()> {
    let incoming_cols = columns_by_name(incoming_schema);

    for table_field in table_schema.columns() {
        let name = table_field.name.as_str();
        let incoming = incoming_cols
            .get(name)
            .context(MissingColumnSnafu { column: name })?;

        ensure!(
            table_field.data_type == incoming.data_type,
            TypeMismatchSnafu {
                column: name,
                table_type: table_field.data_type,
                incoming_type: incoming.data_type,
            }
        );
        ensure!(
            table_field.nullable || !incoming.nullable,
            NullabilityMismatchSnafu { column: name }
        );
    }

    for field in incoming_schema.columns() {
        ensure!(
            table_schema.contains(&field.name),
            ExtraColumnSnafu {
                column: field.name.as_str(),
            }
        );
    }

    Ok(())
}

/// Merge `incoming` into `table_schema` under the auto-merge policy.
///
/// Returns `Ok(None)` when the table schema already accepts the incoming
/// data unchanged, and `Ok(Some(schema))` with the evolved schema otherwise.
/// Existing column order is preserved and new columns are appended in the
/// order they appear in `incoming`. Partition columns never change type.
pub fn merge_schemas(
    table_schema: &LogicalSchema,
    incoming: &LogicalSchema,
    partition_columns: &[String],
) -> SchemaResult<Option<LogicalSchema>> {
    let incoming_cols = columns_by_name(incoming);
    let mut changed = false;
    let mut merged = Vec::with_capacity(table_schema.len() + incoming.len());

    for table_field in table_schema.columns() {
        let name = table_field.name.as_str();
        let Some(inc) = incoming_cols.get(name) else {
            // Rows without this column carry nulls for it.
            ensure!(
                table_field.nullable,
                MissingColumnSnafu { column: name }
            );
            merged.push(table_field.clone());
            continue;
        };

        let mut field = table_field.clone();
        if inc.data_type != table_field.data_type {
            if can_promote(table_field.data_type, inc.data_type) {
                ensure!(
                    !partition_columns.iter().any(|p| p == name),
                    PartitionColumnChangeSnafu { column: name }
                );
                field.data_type = inc.data_type;
                changed = true;
            } else if !can_promote(inc.data_type, table_field.data_type) {
                return TypeMismatchSnafu {
                    column: name,
                    table_type: table_field.data_type,
                    incoming_type: inc.data_type,
                }
                .fail();
            }
        }

        if inc.nullable && !field.nullable {
            field.nullable = true;
            changed = true;
        }
        merged.push(field);
    }

    for field in incoming.columns() {
        if !table_schema.contains(&field.name) {
            merged.push(LogicalField::new(field.name.clone(), field.data_type, true));
            changed = true;
        }
    }

    if !changed {
        return Ok(None);
    }
    LogicalSchema::new(merged)
        .context(LogicalSchemaSnafu)
        .map(Some)
}

/// Apply whichever policy `auto_merge` selects.
pub fn evolve_schema(
    table_schema: &LogicalSchema,
    incoming: &LogicalSchema,
    partition_columns: &[String],
    auto_merge: bool,
) -> SchemaResult<Option<LogicalSchema>> {
    if auto_merge {
        merge_schemas(table_schema, incoming, partition_columns)
    } else {
        ensure_schema_exact_match(table_schema, incoming).map(|()| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LogicalDataType::*;

    const ALL: [LogicalDataType; 11] = [
        Bool, Int8, Int16, Int32, Int64, Float32, Float64, Utf8, Binary, Date, Timestamp,
    ];

    fn schema(cols: &[(&str, LogicalDataType, bool)]) -> LogicalSchema {
        LogicalSchema::new(
            cols.iter()
                .map(|(n, t, null)| LogicalField::new(*n, *t, *null))
                .collect(),
        )
        .expect("valid schema")
    }

    #[test]
    fn promotion_table_is_exact() {
        let allowed = [
            (Int8, Int16),
            (Int8, Int32),
            (Int8, Int64),
            (Int8, Float64),
            (Int16, Int32),
            (Int16, Int64),
            (Int16, Float64),
            (Int32, Int64),
            (Int32, Float64),
            (Float32, Float64),
            (Date, Timestamp),
        ];

        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    can_promote(from, to),
                    expected,
                    "promotion {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn exact_match_ignores_order_and_accepts_stricter_nullability() {
        let table = schema(&[("id", Int64, false), ("name", Utf8, true)]);
        let incoming = schema(&[("name", Utf8, false), ("id", Int64, false)]);
        assert_eq!(ensure_schema_exact_match(&table, &incoming), Ok(()));
    }

    #[test]
    fn exact_match_reports_each_kind_of_difference() {
        let table = schema(&[("id", Int64, false), ("name", Utf8, true)]);

        let missing = schema(&[("id", Int64, false)]);
        assert!(matches!(
            ensure_schema_exact_match(&table, &missing),
            Err(SchemaCompatibilityError::MissingColumn { column }) if column == "name"
        ));

        let extra = schema(&[("id", Int64, false), ("name", Utf8, true), ("x", Bool, true)]);
        assert!(matches!(
            ensure_schema_exact_match(&table, &extra),
            Err(SchemaCompatibilityError::ExtraColumn { column }) if column == "x"
        ));

        let widened = schema(&[("id", Int32, false), ("name", Utf8, true)]);
        assert!(matches!(
            ensure_schema_exact_match(&table, &widened),
            Err(SchemaCompatibilityError::TypeMismatch { .. })
        ));

        let looser = schema(&[("id", Int64, true), ("name", Utf8, true)]);
        assert!(matches!(
            ensure_schema_exact_match(&table, &looser),
            Err(SchemaCompatibilityError::NullabilityMismatch { column }) if column == "id"
        ));
    }

    #[test]
    fn merge_appends_new_columns_as_nullable() {
        let table = schema(&[("customerId", Int64, false), ("address", Utf8, true)]);
        let incoming = schema(&[
            ("customerId", Int64, false),
            ("address", Utf8, true),
            ("loyalty", Int32, false),
        ]);

        let merged = merge_schemas(&table, &incoming, &[])
            .expect("merge")
            .expect("schema changed");
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.columns()[2], LogicalField::new("loyalty", Int32, true));
    }

    #[test]
    fn merge_widens_and_keeps_wider_table_types() {
        let table = schema(&[("a", Int32, false), ("b", Int64, false)]);
        let incoming = schema(&[("a", Int64, false), ("b", Int16, false)]);

        let merged = merge_schemas(&table, &incoming, &[])
            .expect("merge")
            .expect("schema changed");
        assert_eq!(merged.field("a").map(|f| f.data_type), Some(Int64));
        assert_eq!(merged.field("b").map(|f| f.data_type), Some(Int64));
    }

    #[test]
    fn merge_relaxes_nullability_and_reports_no_change_when_compatible() {
        let table = schema(&[("a", Int64, false), ("b", Utf8, true)]);

        let same = schema(&[("a", Int32, false)]);
        assert_eq!(merge_schemas(&table, &same, &[]), Ok(None));

        let nullable = schema(&[("a", Int64, true), ("b", Utf8, true)]);
        let merged = merge_schemas(&table, &nullable, &[])
            .expect("merge")
            .expect("schema changed");
        assert!(merged.field("a").is_some_and(|f| f.nullable));
    }

    #[test]
    fn merge_rejects_incompatible_changes() {
        let table = schema(&[("a", Int64, false), ("p", Int32, false)]);

        let to_string = schema(&[("a", Utf8, false), ("p", Int32, false)]);
        assert!(matches!(
            merge_schemas(&table, &to_string, &[]),
            Err(SchemaCompatibilityError::TypeMismatch { .. })
        ));

        let missing_required = schema(&[("p", Int32, false)]);
        assert!(matches!(
            merge_schemas(&table, &missing_required, &[]),
            Err(SchemaCompatibilityError::MissingColumn { .. })
        ));

        let widen_partition = schema(&[("a", Int64, false), ("p", Int64, false)]);
        assert!(matches!(
            merge_schemas(&table, &widen_partition, &["p".to_string()]),
            Err(SchemaCompatibilityError::PartitionColumnChange { .. })
        ));
    }

    #[test]
    fn evolve_dispatches_on_policy() {
        let table = schema(&[("a", Int64, false)]);
        let incoming = schema(&[("a", Int64, false), ("b", Utf8, true)]);

        assert!(evolve_schema(&table, &incoming, &[], false).is_err());
        assert!(matches!(
            evolve_schema(&table, &incoming, &[], true),
            Ok(Some(_))
        ));
    }
}
