use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn migrate_reports_latest_schema() {
    let dir = unique_temp_dir("rk-migrate");
    let db = dir.join("kernel.sqlite3");

    let value = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_str(&value, "contract_version"), "cli.v1");
    assert_eq!(value.get("up_to_date"), Some(&Value::Bool(true)));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_u64(&status, "current_version"), 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn knowledge_add_search_and_retire_flow() {
    let dir = unique_temp_dir("rk-knowledge");
    let db = dir.join("kernel.sqlite3");

    let entry = run_json([
        "--db",
        path_str(&db),
        "knowledge",
        "add",
        "--key",
        "gift_cards",
        "--title",
        "Gift cards",
        "--body",
        "Gift cards are sold at the front desk and online.",
        "--solution",
        "Yes - gift cards are available at the front desk.",
        "--trust-tier",
        "verified",
        "--source-type",
        "manual",
        "--confidence",
        "0.92",
    ]);
    let entry_id = as_str(&entry, "id").to_string();
    assert_eq!(as_str(&entry, "key"), "gift_cards");

    let found = run_json(["--db", path_str(&db), "knowledge", "search", "--query", "gift"]);
    let entries = found
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("entries should be an array: {found}"));
    assert_eq!(entries.len(), 1);

    let retired = run_json([
        "--db",
        path_str(&db),
        "knowledge",
        "retire",
        "--entry-id",
        &entry_id,
    ]);
    assert_eq!(retired.get("retired"), Some(&Value::Bool(true)));

    let found = run_json(["--db", path_str(&db), "knowledge", "search", "--query", "gift"]);
    let entries = found
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("entries should be an array: {found}"));
    assert!(entries.is_empty());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unmatched_message_escalates_and_queues_raw_knowledge() {
    let dir = unique_temp_dir("rk-decide");
    let db = dir.join("kernel.sqlite3");

    let report = run_json([
        "--db",
        path_str(&db),
        "decide",
        "--conversation-id",
        "conv-cli-1",
        "--text",
        "the projector bulb in bay four looks burned out",
    ]);
    assert_eq!(as_str(&report, "disposition"), "escalated");

    let raw = run_json(["--db", path_str(&db), "raw", "list"]);
    let records = raw
        .get("records")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("records should be an array: {raw}"));
    assert_eq!(records.len(), 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn raw_records_consolidate_into_learned_entry() {
    let dir = unique_temp_dir("rk-consolidate");
    let db = dir.join("kernel.sqlite3");

    for (confidence, solution) in [
        ("0.4", "turn it off and on"),
        ("0.5", "restart the bay software"),
        ("0.6", "power cycle the trackman unit, then relaunch"),
        ("0.3", "give it a minute"),
        ("0.55", "reboot the pc"),
    ] {
        let _ = run_json([
            "--db",
            path_str(&db),
            "raw",
            "add",
            "--conversation-id",
            "conv-cli-raw",
            "--problem",
            "trackman is frozen and not responding",
            "--solution",
            solution,
            "--confidence",
            confidence,
        ]);
    }

    let summary = run_json(["--db", path_str(&db), "consolidate"]);
    assert_eq!(as_u64(&summary, "merges_performed"), 1);
    assert_eq!(as_u64(&summary, "records_consumed"), 5);

    let learned = run_json([
        "--db",
        path_str(&db),
        "knowledge",
        "list",
        "--trust-tier",
        "learned",
    ]);
    let entries = learned
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("entries should be an array: {learned}"));
    assert_eq!(entries.len(), 1);
    let body = entries[0]
        .get("content")
        .and_then(|content| content.get("body"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("entry should carry body text: {learned}"));
    assert!(body.contains("power cycle"));

    // Second run is a no-op.
    let second = run_json(["--db", path_str(&db), "consolidate"]);
    assert_eq!(as_u64(&second, "merges_performed"), 0);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn export_then_import_into_fresh_database() {
    let dir = unique_temp_dir("rk-export");
    let db = dir.join("kernel.sqlite3");
    let other_db = dir.join("kernel-restore.sqlite3");
    let snapshot = dir.join("snapshot");

    let _ = run_json([
        "--db",
        path_str(&db),
        "knowledge",
        "add",
        "--key",
        "hours",
        "--title",
        "Opening hours",
        "--body",
        "Open 6am to 11pm every day.",
        "--trust-tier",
        "verified",
        "--source-type",
        "manual",
        "--confidence",
        "0.9",
    ]);

    let manifest = run_json(["--db", path_str(&db), "db", "export", "--out", path_str(&snapshot)]);
    assert_eq!(as_u64(&manifest, "schema_version"), 2);

    let summary =
        run_json(["--db", path_str(&other_db), "db", "import", "--in", path_str(&snapshot)]);
    assert_eq!(as_u64(&summary, "imported_entries"), 1);

    let report = run_json(["--db", path_str(&other_db), "db", "integrity-check"]);
    assert_eq!(report.get("quick_check_ok"), Some(&Value::Bool(true)));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn feedback_round_trips_through_an_outcome() {
    let dir = unique_temp_dir("rk-feedback");
    let db = dir.join("kernel.sqlite3");

    // No knowledge yet: the decide escalates but still logs an outcome.
    let report = run_json([
        "--db",
        path_str(&db),
        "decide",
        "--conversation-id",
        "conv-cli-2",
        "--text",
        "do you sell gift cards?",
    ]);
    assert_eq!(as_str(&report, "disposition"), "escalated");
    let outcome_id = as_str(&report, "outcome_id").to_string();

    let applied = run_json([
        "--db",
        path_str(&db),
        "feedback",
        "--outcome-id",
        &outcome_id,
        "--helpful",
        "false",
    ]);
    assert_eq!(as_str(&applied, "outcome_id"), outcome_id);

    let outcome =
        run_json(["--db", path_str(&db), "outcome", "show", "--outcome-id", &outcome_id]);
    assert_eq!(outcome.get("helpful"), Some(&Value::Bool(false)));

    let _ = fs::remove_dir_all(&dir);
}
