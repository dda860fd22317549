use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn gsync(workdir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("gsync").expect("gsync binary");
    cmd.current_dir(workdir)
        .env("HOME", workdir)
        .env_remove("GSYNC_ENDPOINT")
        .env_remove("GSYNC_API_KEY")
        .env_remove("GSYNC_CONFIG")
        .env_remove("GSYNC_BUDGET")
        .env_remove("GSYNC_ENV_FILE")
        .env_remove("GSYNC_LOG");
    cmd
}

fn people_fixture(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
    let input = dir.path().join("people.jsonl");
    fs::write(
        &input,
        concat!(
            "{\"id\": \"a\", \"label\": \"Person\"}\n",
            "{\"id\": \"b\", \"label\": \"Person\"}\n",
            "{\"id\": \"c\", \"label\": \"Person\", \"entity_type\": \"NaN\"}\n",
        ),
    )
    .unwrap();
    let existing = dir.path().join("existing.json");
    fs::write(&existing, "[\"b|Person||\"]").unwrap();
    (input, existing)
}

#[test]
fn help_lists_every_command() {
    let dir = TempDir::new().unwrap();
    gsync(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("load")
                .and(predicate::str::contains("push"))
                .and(predicate::str::contains("delta"))
                .and(predicate::str::contains("delete")),
        );
}

#[test]
fn delta_prints_missing_keys() {
    let dir = TempDir::new().unwrap();
    let (input, existing) = people_fixture(&dir);

    gsync(dir.path())
        .args(["delta", "--kind", "vertices", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(&existing)
        .assert()
        .success()
        .stdout(predicate::eq("a|Person||\nc|Person||\n"))
        .stderr(predicate::str::contains("2 of 3 vertices pending"));
}

#[test]
fn delta_json_emits_one_item_per_line() {
    let dir = TempDir::new().unwrap();
    let (input, existing) = people_fixture(&dir);

    let output = gsync(dir.path())
        .args(["delta", "--json", "--kind", "vertex", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(&existing)
        .output()
        .unwrap();
    assert!(output.status.success());

    let items: Vec<Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["key"], "a|Person||");
    assert_eq!(items[1]["record"]["id"], "c");
    assert_eq!(items[1]["record"]["entity_type"], "");
}

#[test]
fn delta_reads_edge_tables_with_aliases() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("edges.csv");
    fs::write(&input, "source,target,edge_detail\na,b,knows\nb,c,\n").unwrap();
    let existing = dir.path().join("existing.json");
    fs::write(&existing, "[\"a|knows|b\"]").unwrap();

    gsync(dir.path())
        .args(["delta", "--kind", "edges", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(&existing)
        .assert()
        .success()
        .stdout(predicate::eq("b|connects|c\n"));
}

#[test]
fn delta_requires_an_existing_set() {
    let dir = TempDir::new().unwrap();
    let (input, _) = people_fixture(&dir);

    gsync(dir.path())
        .args(["delta", "--kind", "vertices", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn push_without_endpoint_fails_before_any_work() {
    let dir = TempDir::new().unwrap();
    let (input, existing) = people_fixture(&dir);

    gsync(dir.path())
        .args(["push", "--kind", "vertices", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(&existing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no endpoint configured"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (input, existing) = people_fixture(&dir);
    let config = dir.path().join("gsync.json");
    fs::write(&config, r#"{"workers": 0}"#).unwrap();

    gsync(dir.path())
        .args(["delta", "--kind", "vertices", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(&existing)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers must be at least 1"));
}

#[test]
fn unreachable_store_reports_each_abandoned_record() {
    let dir = TempDir::new().unwrap();
    let (input, existing) = people_fixture(&dir);
    let config = dir.path().join("gsync.json");
    fs::write(
        &config,
        r#"{"max_retries": 1, "budget_per_second": 0, "request_timeout_secs": 2}"#,
    )
    .unwrap();
    let state = dir.path().join("state.json");

    let output = gsync(dir.path())
        .args(["push", "--json", "--kind", "vertices", "--in"])
        .arg(&input)
        .arg("--existing")
        .arg(&existing)
        .arg("--state")
        .arg(&state)
        .arg("--config")
        .arg(&config)
        .args(["--endpoint", "http://127.0.0.1:9/gremlin", "--workers", "2"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["command"], "push");
    assert_eq!(summary["existing_source"], "file");
    assert_eq!(summary["pending"], 2);
    assert_eq!(summary["written"], 0);
    assert_eq!(summary["failed"], 2);
    assert_eq!(summary["failures"][0]["reason"], "timeout");

    let persisted: Vec<String> = serde_json::from_str(&fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(persisted, vec!["b|Person||".to_string()]);
}

#[test]
fn partial_sweep_does_not_create_state() {
    let dir = TempDir::new().unwrap();
    let (input, _) = people_fixture(&dir);
    let config = dir.path().join("gsync.json");
    fs::write(
        &config,
        r#"{"max_retries": 1, "budget_per_second": 0, "request_timeout_secs": 2}"#,
    )
    .unwrap();
    let state = dir.path().join("state.json");

    let output = gsync(dir.path())
        .args(["push", "--json", "--kind", "vertices", "--in"])
        .arg(&input)
        .arg("--state")
        .arg(&state)
        .arg("--config")
        .arg(&config)
        .args(["--endpoint", "http://127.0.0.1:9/gremlin", "--page-size", "100"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["existing_source"], "sweep");
    assert_eq!(summary["existing_before"], 0);
    assert_eq!(summary["written"], 0);
    assert!(summary["state_path"].is_null());
    assert!(!state.exists());
}

#[test]
fn delete_needs_a_list_or_all() {
    let dir = TempDir::new().unwrap();
    gsync(dir.path())
        .args(["delete", "--kind", "vertices"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--in <FILE>"));
}

#[test]
fn delete_all_requires_force_without_a_terminal() {
    let dir = TempDir::new().unwrap();
    gsync(dir.path())
        .args(["delete", "--kind", "edges", "--all"])
        .args(["--endpoint", "http://127.0.0.1:9/gremlin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "refusing to drop every edge without --force",
        ));
}

#[test]
fn delete_all_after_a_failed_sweep_leaves_state_alone() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("gsync.json");
    fs::write(
        &config,
        r#"{"max_retries": 1, "budget_per_second": 0, "request_timeout_secs": 2}"#,
    )
    .unwrap();
    let state = dir.path().join("state.json");
    fs::write(&state, "[\"a|Person||\"]").unwrap();

    let output = gsync(dir.path())
        .args(["delete", "--json", "--kind", "vertices", "--all", "--force"])
        .arg("--state")
        .arg(&state)
        .arg("--config")
        .arg(&config)
        .args(["--endpoint", "http://127.0.0.1:9/gremlin", "--page-size", "100"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["command"], "delete");
    assert_eq!(summary["existing_source"], "sweep");
    assert!(summary["input"].is_null());
    assert_eq!(summary["pending"], 0);
    let persisted: Vec<String> = serde_json::from_str(&fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(persisted, vec!["a|Person||".to_string()]);
}
