// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PIPELINE: &str = r#"
name: words
steps:
  - label: prepare
    kind: shell
    params:
      command: "echo prepared > {target}"
      targets: [words.txt]
  - label: count
    kind: shell
    dependencies: {words: prepare}
    params:
      command: "wc -l < {dep:words}/words.txt > {target}"
      targets: [count.txt]
"#;

fn pipestep() -> Command {
    let mut cmd = Command::cargo_bin("pipestep").unwrap();
    cmd.env("NO_COLOR", "1")
        .env_remove("PIPESTEP_RUNNER")
        .env_remove("PIPESTEP_POLL_INTERVAL");
    cmd
}

fn write_definition(dir: &Path, yaml: &str) {
    fs::write(dir.join("pipeline.yaml"), yaml).unwrap();
}

#[test]
fn test_validate_accepts_pipeline() {
    let temp = TempDir::new().unwrap();
    write_definition(temp.path(), PIPELINE);

    pipestep()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline is valid"));
}

#[test]
fn test_validate_reports_unknown_dependency() {
    let temp = TempDir::new().unwrap();
    write_definition(
        temp.path(),
        r#"
name: broken
steps:
  - label: count
    kind: shell
    dependencies: {words: missing}
    params: {command: "true", targets: [x]}
"#,
    );

    pipestep()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("depends on unknown step 'missing'"));
}

#[test]
fn test_validate_missing_file() {
    let temp = TempDir::new().unwrap();

    pipestep()
        .current_dir(temp.path())
        .args(["validate", "nope.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_graph_formats() {
    let temp = TempDir::new().unwrap();
    write_definition(temp.path(), PIPELINE);

    pipestep()
        .current_dir(temp.path())
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("1. prepare (shell)"))
        .stdout(predicate::str::contains("2. count (shell) [depends: prepare] *"));

    pipestep()
        .current_dir(temp.path())
        .args(["graph", "--format", "dot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"prepare\" -> \"count\";"));

    pipestep()
        .current_dir(temp.path())
        .args(["graph", "-f", "mermaid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prepare --> count"));

    pipestep()
        .current_dir(temp.path())
        .args(["graph", "-f", "svg"])
        .assert()
        .failure();
}

#[test]
fn test_status_requires_init() {
    let temp = TempDir::new().unwrap();

    pipestep()
        .args(["status", "-p"])
        .arg(temp.path())
        .assert()
        .failure();
}

#[test]
fn test_init_run_status_with_debug_runner() {
    let temp = TempDir::new().unwrap();
    let spec = temp.path().join("definition.yaml");
    let run_dir = temp.path().join("run");
    fs::write(&spec, PIPELINE).unwrap();

    pipestep()
        .arg("init")
        .arg(&spec)
        .arg("-p")
        .arg(&run_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    assert!(run_dir.join("pipeline.yaml").exists());
    assert!(run_dir.join("prepare").is_dir());
    assert!(run_dir.join("count").is_dir());

    pipestep()
        .args(["run", "--runner", "debug", "--wait", "-p"])
        .arg(&run_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("All targets are done."));

    let words = fs::read_to_string(run_dir.join("prepare/output/words.txt")).unwrap();
    assert_eq!(words, "prepared\n");
    let count = fs::read_to_string(run_dir.join("count/output/count.txt")).unwrap();
    assert_eq!(count.trim(), "1");

    pipestep()
        .args(["status", "-p"])
        .arg(&run_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("prepare"))
        .stdout(predicate::str::contains("DONE"))
        .stdout(predicate::str::contains("FAILED").not());

    pipestep()
        .args(["stop", "-p"])
        .arg(&run_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing is running."));
}

#[test]
fn test_run_refused_by_owner_keeps_saved_runner() {
    let temp = TempDir::new().unwrap();
    let spec = temp.path().join("definition.yaml");
    let run_dir = temp.path().join("run");
    fs::write(&spec, PIPELINE).unwrap();

    pipestep()
        .arg("init")
        .arg(&spec)
        .arg("-p")
        .arg(&run_dir)
        .assert()
        .success();

    // A Slurm job is still queued for the first step
    fs::write(run_dir.join("runner.toml"), "kind = \"slurm\"\n").unwrap();
    fs::write(run_dir.join("prepare/state"), "SUBMITTED\n").unwrap();
    fs::write(
        run_dir.join("prepare/submission.json"),
        r#"{"runner": "slurm", "main_task": {"id": "4242"}}"#,
    )
    .unwrap();

    pipestep()
        .args(["run", "--runner", "debug", "-p"])
        .arg(&run_dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("owned by the slurm runner"));

    let saved = fs::read_to_string(run_dir.join("runner.toml")).unwrap();
    assert_eq!(saved, "kind = \"slurm\"\n");
    assert_eq!(
        fs::read_to_string(run_dir.join("count/state")).unwrap().trim(),
        "INITED"
    );
    assert!(!run_dir.join("count/submission.json").exists());
}
