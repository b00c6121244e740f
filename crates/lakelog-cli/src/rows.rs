//! JSON-lines input and output.
//!
//! Each input line is one JSON object. Values of columns the table already
//! has are typed against its schema; other columns take the type of their
//! first non-null value and are declared nullable, so they reach the core
//! as schema additions.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use lakelog_core::data::{Row, RowBatch, Value};
use lakelog_core::schema::{LogicalDataType, LogicalField, LogicalSchema};
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use tokio::io::AsyncReadExt;

use crate::error::{
    BuildBatchSnafu, CliResult, ConvertLineSnafu, EncodeOutputSnafu, InvalidKeyValueSnafu,
    InvalidSchemaSnafu, NotAnObjectSnafu, ParseLineSnafu, ReadInputSnafu, WriteOutputSnafu,
};

type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Read `path` (or stdin for `-`) into a batch typed against `table_schema`.
pub async fn load_batch(path: &Path, table_schema: &LogicalSchema) -> CliResult<RowBatch> {
    let text = read_input(path).await?;
    let objects = parse_lines(path, &text)?;
    let schema = batch_schema(path, &objects, table_schema)?;

    let mut rows = Vec::with_capacity(objects.len());
    for (line, object) in &objects {
        let mut row = Row::new();
        for (column, json) in object {
            let value = match schema.field(column) {
                Some(field) => Value::from_json(column, json, field.data_type),
                None => Value::infer_from_json(column, json),
            }
            .context(ConvertLineSnafu {
                path,
                line: *line,
            })?;
            row.insert(column.clone(), value);
        }
        rows.push(row);
    }

    RowBatch::new(schema, rows).context(BuildBatchSnafu)
}

async fn read_input(path: &Path) -> CliResult<String> {
    let mut text = String::new();
    if path == Path::new("-") {
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context(ReadInputSnafu { path })?;
    } else {
        text = tokio::fs::read_to_string(path)
            .await
            .context(ReadInputSnafu { path })?;
    }
    Ok(text)
}

fn parse_lines(path: &Path, text: &str) -> CliResult<Vec<(usize, JsonObject)>> {
    let mut objects = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let json: serde_json::Value =
            serde_json::from_str(raw).context(ParseLineSnafu { path, line })?;
        let serde_json::Value::Object(object) = json else {
            return NotAnObjectSnafu { path, line }.fail();
        };
        objects.push((line, object));
    }
    Ok(objects)
}

/// The table schema followed by any new columns, in first-seen order.
fn batch_schema(
    path: &Path,
    objects: &[(usize, JsonObject)],
    table_schema: &LogicalSchema,
) -> CliResult<LogicalSchema> {
    let mut extra: Vec<String> = Vec::new();
    let mut types: BTreeMap<String, LogicalDataType> = BTreeMap::new();

    for (line, object) in objects {
        for (column, json) in object {
            if table_schema.contains(column) {
                continue;
            }
            if !extra.contains(column) {
                extra.push(column.clone());
            }
            if types.contains_key(column) {
                continue;
            }
            let value = Value::infer_from_json(column, json).context(ConvertLineSnafu {
                path,
                line: *line,
            })?;
            if let Some(data_type) = value.data_type() {
                types.insert(column.clone(), data_type);
            }
        }
    }

    let mut columns = table_schema.columns().to_vec();
    for column in extra {
        // All-null columns have nothing to infer from.
        let data_type = types.get(&column).copied().unwrap_or(LogicalDataType::Utf8);
        columns.push(LogicalField::new(column, data_type, true));
    }
    LogicalSchema::new(columns).context(InvalidSchemaSnafu)
}

/// Parse repeated `KEY=VALUE` flags.
pub fn parse_key_values(flag: &str, specs: &[String]) -> CliResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for spec in specs {
        let (key, value) = spec
            .split_once('=')
            .filter(|(k, _)| !k.trim().is_empty())
            .context(InvalidKeyValueSnafu { flag, spec })?;
        out.insert(key.trim().to_string(), value.to_string());
    }
    Ok(out)
}

/// Write one JSON document per line to stdout.
pub fn print_json_lines<T: Serialize>(items: impl IntoIterator<Item = T>) -> CliResult<()> {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    for item in items {
        serde_json::to_writer(&mut out, &item).context(EncodeOutputSnafu)?;
        out.write_all(b"\n").context(WriteOutputSnafu)?;
    }
    out.flush().context(WriteOutputSnafu)
}

/// Write one pretty-printed JSON document to stdout.
pub fn print_json<T: Serialize>(item: &T) -> CliResult<()> {
    let rendered = serde_json::to_string_pretty(item).context(EncodeOutputSnafu)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn table_schema() -> LogicalSchema {
        LogicalSchema::new(vec![
            LogicalField::new("id", LogicalDataType::Int64, false),
            LogicalField::new("score", LogicalDataType::Float64, true),
        ])
        .expect("schema")
    }

    #[test]
    fn new_columns_are_inferred_and_nullable() -> TestResult {
        let text = "{\"id\": 1, \"score\": 2, \"tag\": null}\n\n{\"id\": 2, \"tag\": \"x\"}\n";
        let objects = parse_lines(Path::new("rows.jsonl"), text)?;
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].0, 3);

        let schema = batch_schema(Path::new("rows.jsonl"), &objects, &table_schema())?;
        let tag = schema.field("tag").expect("tag");
        assert_eq!(tag.data_type, LogicalDataType::Utf8);
        assert!(tag.nullable);
        assert_eq!(schema.len(), 3);
        Ok(())
    }

    #[test]
    fn non_object_lines_are_rejected() {
        let err = parse_lines(Path::new("rows.jsonl"), "{\"id\": 1}\n[1, 2]\n")
            .expect_err("array line");
        assert!(err.to_string().contains("Line 2"), "{err}");
    }

    #[test]
    fn key_values_need_an_equals_sign() -> TestResult {
        let parsed = parse_key_values("config", &["a.b=true".to_string()])?;
        assert_eq!(parsed.get("a.b").map(String::as_str), Some("true"));
        assert!(parse_key_values("config", &["novalue".to_string()]).is_err());
        assert!(parse_key_values("config", &["=x".to_string()]).is_err());
        Ok(())
    }
}
