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

fn run_sac<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sac"))
        .args(args)
        .env_remove("SAC_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sac binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sac(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sac command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_json(path: &Path, value: &Value) {
    let body = serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| panic!("failed to serialize fixture: {err}"));
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, pointer: &str) -> &'a Vec<Value> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array at `{pointer}` in payload: {value}"))
}

fn snapshot_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("snapshot.json");
    write_json(
        &path,
        &serde_json::json!({
            "tests": [
                { "record_id": "r1", "test_id": "T01", "name": "Lead (total)" },
                { "record_id": "r2", "test_id": "T02", "name": "Copper" },
                { "record_id": "r3", "test_id": "T03", "name": "Nitrate" },
                { "record_id": "r4", "test_id": "T99", "name": "Copper" }
            ],
            "sacs": [
                {
                    "record_id": "p1",
                    "sac_code": "SAC900",
                    "name": "Metals",
                    "description": "Lead and copper",
                    "bottleware": "500 mL HDPE, HNO3",
                    "tests": ["r1", "r2"]
                },
                {
                    "record_id": "p2",
                    "sac_code": "SAC901",
                    "name": "Metals again",
                    "description": "",
                    "tests": ["r4", "r1"]
                },
                {
                    "record_id": "p3",
                    "sac_code": "SAC612",
                    "name": "Nutrients",
                    "description": "Nitrate",
                    "tests": ["r3"]
                }
            ]
        }),
    );
    path
}

#[test]
fn lookup_finds_package_by_bare_number() {
    let dir = unique_temp_dir("sac-cli-lookup");
    let snapshot = snapshot_fixture(&dir);

    let value = run_json(["--snapshot", path_str(&snapshot), "lookup", "--code", "612"]);
    assert_eq!(as_str(&value, "/contract_version"), "cli.v1");
    assert_eq!(as_str(&value, "/outcome/status"), "found");
    assert_eq!(as_str(&value, "/outcome/package/code"), "SAC612");
    assert!(as_str(&value, "/snapshot_id").starts_with("snap_"));

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "lookup",
        "--code",
        "SAC1",
    ]);
    assert_eq!(as_str(&value, "/outcome/status"), "not_found");
}

#[test]
fn search_ranks_by_matched_terms() {
    let dir = unique_temp_dir("sac-cli-search");
    let snapshot = snapshot_fixture(&dir);

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "search",
        "--terms",
        "lead, iron",
    ]);
    assert_eq!(as_str(&value, "/outcome/status"), "searched");
    let results = as_array(&value, "/outcome/results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].pointer("/score").and_then(Value::as_u64), Some(1));
    assert_eq!(as_str(&results[0], "/package/code"), "SAC900");

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "search",
        "--terms",
        " , ",
    ]);
    assert_eq!(as_str(&value, "/outcome/status"), "not_searched");
}

#[test]
fn duplicates_groups_name_collapsed_packages() {
    let dir = unique_temp_dir("sac-cli-duplicates");
    let snapshot = snapshot_fixture(&dir);

    let value = run_json(["--snapshot", path_str(&snapshot), "duplicates"]);
    assert_eq!(value.pointer("/clean").and_then(Value::as_bool), Some(false));
    let groups = as_array(&value, "/report/identical_groups");
    assert_eq!(groups.len(), 1);
    let codes = as_array(&groups[0], "")
        .iter()
        .map(|package| as_str(package, "/code").to_string())
        .collect::<Vec<_>>();
    assert_eq!(codes, vec!["SAC900".to_string(), "SAC901".to_string()]);
}

#[test]
fn build_reports_identical_package_and_new_code() {
    let dir = unique_temp_dir("sac-cli-build");
    let snapshot = snapshot_fixture(&dir);

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "build",
        "--test",
        "Copper",
        "--test",
        "Lead (total)",
    ]);
    assert_eq!(as_str(&value, "/outcome/status"), "built");
    // 900 and 901 are taken; the search tries 901 before 899
    assert_eq!(as_str(&value, "/outcome/result/new_code"), "SAC899");
    assert_eq!(as_str(&value, "/outcome/result/similar_package/package/code"), "SAC900");
    assert_eq!(as_str(&value, "/warning/headline"), "Identical SAC Found!");

    let value = run_json(["--snapshot", path_str(&snapshot), "build"]);
    assert_eq!(as_str(&value, "/outcome/status"), "nothing_selected");
    assert!(value.pointer("/warning").is_some_and(Value::is_null));
}

#[test]
fn build_fails_when_no_code_is_free_within_bound() {
    let dir = unique_temp_dir("sac-cli-build-exhausted");
    let snapshot = snapshot_fixture(&dir);

    let output = run_sac([
        "--snapshot",
        path_str(&snapshot),
        "build",
        "--test",
        "Copper",
        "--test",
        "Lead (total)",
        "--max-offset",
        "0",
    ]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to allocate a package code"));
    assert!(stderr.contains("code space exhausted"));

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "build",
        "--test",
        "Copper",
        "--max-offset",
        "1",
    ]);
    assert_eq!(as_str(&value, "/outcome/result/new_code"), "SAC899");
}

#[test]
fn tests_filter_supports_collapsed_and_raw_views() {
    let dir = unique_temp_dir("sac-cli-tests");
    let snapshot = snapshot_fixture(&dir);

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "tests",
        "--filter",
        "copper",
    ]);
    assert_eq!(as_array(&value, "/tests").len(), 1);

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "tests",
        "--filter",
        "t9",
        "--raw",
    ]);
    let tests = as_array(&value, "/tests");
    assert_eq!(tests.len(), 1);
    assert_eq!(as_str(&tests[0], "/record_id"), "r4");
}

#[test]
fn sync_plan_diffs_upload_against_remote_index() {
    let dir = unique_temp_dir("sac-cli-sync");
    let upload = dir.join("upload.json");
    let remote = dir.join("remote.json");
    write_json(
        &upload,
        &serde_json::json!([
            {
                "sac_code": "SAC900",
                "name": "Metals",
                "tests": [
                    { "test_id": "T01", "name": "Lead (total)" },
                    { "test_id": "T05", "name": "Zinc" }
                ]
            },
            { "sac_code": "SAC950", "name": "Broken" }
        ]),
    );
    write_json(
        &remote,
        &serde_json::json!({ "tests": { "T01": "r1" }, "sacs": { "SAC900": "p1" } }),
    );

    let value = run_json([
        "sync",
        "plan",
        "--in",
        path_str(&upload),
        "--remote",
        path_str(&remote),
    ]);
    assert_eq!(value.pointer("/summary/tests_to_create").and_then(Value::as_u64), Some(1));
    assert_eq!(value.pointer("/summary/sacs_to_update").and_then(Value::as_u64), Some(1));
    assert_eq!(value.pointer("/summary/sacs_to_create").and_then(Value::as_u64), Some(0));
    assert_eq!(value.pointer("/summary/estimated_duration_ms").and_then(Value::as_u64), Some(400));
    assert_eq!(as_array(&value, "/plan/warnings").len(), 1);
}

#[test]
fn consolidate_plan_rewrites_packages_using_old_test() {
    let dir = unique_temp_dir("sac-cli-consolidate");
    let snapshot = snapshot_fixture(&dir);

    let value = run_json([
        "--snapshot",
        path_str(&snapshot),
        "consolidate",
        "plan",
        "--old",
        "r4",
        "--new",
        "r2",
    ]);
    assert_eq!(value.pointer("/noop").and_then(Value::as_bool), Some(false));
    let updates = as_array(&value, "/plan/updates");
    assert_eq!(updates.len(), 1);
    assert_eq!(as_str(&updates[0], "/sac_code"), "SAC901");

    let output = run_sac([
        "--snapshot",
        path_str(&snapshot),
        "consolidate",
        "plan",
        "--old",
        "r2",
        "--new",
        "r2",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot be the same"));
}

#[test]
fn missing_snapshot_file_fails_with_context() {
    let dir = unique_temp_dir("sac-cli-missing");
    let missing = dir.join("nope.json");

    let output = run_sac(["--snapshot", path_str(&missing), "duplicates"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read file"));
}
