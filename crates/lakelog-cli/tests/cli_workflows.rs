#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::Path;
use std::process::{Command, Output};
use std::{io, result::Result as StdResult};

use tempfile::TempDir;

type TestResult = StdResult<(), Box<dyn std::error::Error>>;

fn cli_bin() -> &'static str {
    env!("CARGO_BIN_EXE_lakelog")
}

fn run_cli(args: &[&str]) -> io::Result<Output> {
    Command::new(cli_bin()).args(args).output()
}

fn assert_cli_success(output: &Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_json_lines(output: &Output) -> StdResult<Vec<serde_json::Value>, serde_json::Error> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

fn stdout_json(output: &Output) -> StdResult<serde_json::Value, serde_json::Error> {
    serde_json::from_slice(&output.stdout)
}

fn write_lines(path: &Path, lines: &[&str]) -> io::Result<()> {
    std::fs::write(path, lines.join("\n"))
}

fn create_customers(table: &str) -> io::Result<Output> {
    run_cli(&[
        "create",
        "--table",
        table,
        "--column",
        "customerId:int64:not-null",
        "--column",
        "name:string",
        "--column",
        "city:string",
        "--name",
        "customers",
    ])
}

fn ids(rows: &[serde_json::Value]) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .iter()
        .filter_map(|r| r["customerId"].as_i64())
        .collect();
    ids.sort_unstable();
    ids
}

// ==================== create / insert / read ====================

#[test]
fn create_insert_and_read_back() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("customers");
    let table = root.to_string_lossy().to_string();
    assert_cli_success(&create_customers(&table)?);

    let input = tmp.path().join("batch1.jsonl");
    write_lines(
        &input,
        &[
            r#"{"customerId": 1, "name": "Ann", "city": "Oslo"}"#,
            r#"{"customerId": 2, "name": "Bo", "city": "Rome"}"#,
        ],
    )?;
    let out = run_cli(&["insert", "--table", &table, "--input", &input.to_string_lossy()])?;
    assert_cli_success(&out);
    assert!(String::from_utf8_lossy(&out.stdout).contains("Committed version 1"));

    let out = run_cli(&["read", "--table", &table])?;
    assert_cli_success(&out);
    let rows = stdout_json_lines(&out)?;
    assert_eq!(ids(&rows), vec![1, 2]);

    let out = run_cli(&["read", "--table", &table, "--version", "0"])?;
    assert_cli_success(&out);
    assert!(stdout_json_lines(&out)?.is_empty());
    Ok(())
}

#[test]
fn create_twice_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let table = tmp.path().join("t").to_string_lossy().to_string();
    assert_cli_success(&create_customers(&table)?);

    let out = create_customers(&table)?;
    assert!(!out.status.success(), "second create should fail");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Failed to create table"), "{stderr}");
    Ok(())
}

#[test]
fn invalid_column_spec_is_reported() -> TestResult {
    let tmp = TempDir::new()?;
    let table = tmp.path().join("t").to_string_lossy().to_string();
    let out = run_cli(&["create", "--table", &table, "--column", "id:decimal"])?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Invalid --column"), "{stderr}");
    Ok(())
}

#[test]
fn opening_a_plain_directory_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let out = run_cli(&["detail", "--table", &tmp.path().to_string_lossy()])?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("No table found"), "{stderr}");
    Ok(())
}

// ==================== schema evolution ====================

#[test]
fn new_columns_need_merge_schema() -> TestResult {
    let tmp = TempDir::new()?;
    let table = tmp.path().join("t").to_string_lossy().to_string();
    assert_cli_success(&create_customers(&table)?);

    let input = tmp.path().join("wide.jsonl");
    write_lines(
        &input,
        &[r#"{"customerId": 3, "name": "Cy", "city": "Nice", "tier": "gold"}"#],
    )?;
    let input = input.to_string_lossy().to_string();

    let out = run_cli(&["insert", "--table", &table, "--input", &input])?;
    assert!(!out.status.success(), "new column without merge-schema");

    let out = run_cli(&[
        "insert",
        "--table",
        &table,
        "--input",
        &input,
        "--merge-schema",
    ])?;
    assert_cli_success(&out);

    let out = run_cli(&["detail", "--table", &table])?;
    assert_cli_success(&out);
    let detail = stdout_json(&out)?;
    assert_eq!(detail["version"], 1);
    assert_eq!(detail["name"], "customers");
    let text = detail["schema"].to_string();
    assert!(text.contains("tier"), "{text}");

    let arrow = detail["arrowSchema"].as_array().expect("arrow fields");
    assert_eq!(arrow.len(), 4);
    assert_eq!(arrow[0]["name"], "customerId");
    assert_eq!(arrow[0]["type"], "Int64");
    assert_eq!(arrow[0]["nullable"], false);
    assert_eq!(arrow[3]["name"], "tier");
    assert_eq!(arrow[3]["type"], "Utf8");
    assert_eq!(arrow[3]["nullable"], true);
    Ok(())
}

// ==================== merge / history ====================

#[test]
fn merge_upserts_on_key_and_reports_metrics() -> TestResult {
    let tmp = TempDir::new()?;
    let table = tmp.path().join("t").to_string_lossy().to_string();
    assert_cli_success(&create_customers(&table)?);

    let seed = tmp.path().join("seed.jsonl");
    write_lines(
        &seed,
        &[
            r#"{"customerId": 1, "name": "Ann", "city": "Oslo"}"#,
            r#"{"customerId": 2, "name": "Bo", "city": "Rome"}"#,
        ],
    )?;
    assert_cli_success(&run_cli(&[
        "insert",
        "--table",
        &table,
        "--input",
        &seed.to_string_lossy(),
    ])?);

    let updates = tmp.path().join("updates.jsonl");
    write_lines(
        &updates,
        &[
            r#"{"customerId": 2, "name": "Bo", "city": "Milan"}"#,
            r#"{"customerId": 3, "name": "Cy", "city": "Nice"}"#,
        ],
    )?;
    let out = run_cli(&[
        "merge",
        "--table",
        &table,
        "--input",
        &updates.to_string_lossy(),
        "--on",
        "customerId",
    ])?;
    assert_cli_success(&out);
    let metrics = stdout_json(&out)?;
    assert_eq!(metrics["version"], 2);
    assert_eq!(metrics["numSourceRows"], 2);
    assert_eq!(metrics["numTargetRowsUpdated"], 1);
    assert_eq!(metrics["numTargetRowsInserted"], 1);

    let out = run_cli(&["read", "--table", &table])?;
    assert_cli_success(&out);
    let rows = stdout_json_lines(&out)?;
    assert_eq!(ids(&rows), vec![1, 2, 3]);
    let bo = rows
        .iter()
        .find(|r| r["customerId"] == 2)
        .expect("row 2");
    assert_eq!(bo["city"], "Milan");

    let out = run_cli(&["history", "--table", &table])?;
    assert_cli_success(&out);
    let history = stdout_json_lines(&out)?;
    let versions: Vec<i64> = history.iter().filter_map(|h| h["version"].as_i64()).collect();
    assert_eq!(versions, vec![2, 1, 0]);
    assert_eq!(history[0]["operation"], "MERGE");
    assert_eq!(history[1]["isBlindAppend"], true);

    let out = run_cli(&["history", "--table", &table, "--limit", "1"])?;
    assert_cli_success(&out);
    assert_eq!(stdout_json_lines(&out)?.len(), 1);
    Ok(())
}

#[test]
fn merge_requires_key_columns() -> TestResult {
    let tmp = TempDir::new()?;
    let table = tmp.path().join("t").to_string_lossy().to_string();
    assert_cli_success(&create_customers(&table)?);
    let input = tmp.path().join("in.jsonl");
    write_lines(&input, &[r#"{"customerId": 1}"#])?;

    let out = run_cli(&["merge", "--table", &table, "--input", &input.to_string_lossy()])?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--on"), "{stderr}");
    Ok(())
}

// ==================== maintenance ====================

#[test]
fn optimize_then_guarded_vacuum() -> TestResult {
    let tmp = TempDir::new()?;
    let table = tmp.path().join("t").to_string_lossy().to_string();
    assert_cli_success(&create_customers(&table)?);

    for id in 1..=3 {
        let input = tmp.path().join(format!("row{id}.jsonl"));
        std::fs::write(&input, format!(r#"{{"customerId": {id}, "name": "n{id}"}}"#))?;
        assert_cli_success(&run_cli(&[
            "insert",
            "--table",
            &table,
            "--input",
            &input.to_string_lossy(),
        ])?);
    }

    let out = run_cli(&["optimize", "--table", &table])?;
    assert_cli_success(&out);
    let metrics = stdout_json(&out)?;
    assert_eq!(metrics["version"], 4);
    assert_eq!(metrics["numFilesRemoved"], 3);
    assert_eq!(metrics["numFilesAdded"], 1);

    // Below the safety minimum without opting out.
    let out = run_cli(&["vacuum", "--table", &table, "--retention-hours", "0"])?;
    assert!(!out.status.success());

    let out = run_cli(&[
        "vacuum",
        "--table",
        &table,
        "--retention-hours",
        "0",
        "--no-retention-check",
        "--dry-run",
    ])?;
    assert_cli_success(&out);
    let report = stdout_json(&out)?;
    assert_eq!(report["dryRun"], true);
    assert!(report["version"].is_null());

    let out = run_cli(&["read", "--table", &table])?;
    assert_cli_success(&out);
    assert_eq!(ids(&stdout_json_lines(&out)?), vec![1, 2, 3]);
    Ok(())
}
