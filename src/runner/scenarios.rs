// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! End-to-end runs of small pipelines on the debug backend

use std::sync::Arc;
use tempfile::TempDir;

use super::*;
use crate::step::StepState;
use crate::testing;

const CHAIN: &str = r#"
name: chain
steps:
  - {label: a, kind: echo, params: {targets: [one]}}
  - {label: b, kind: echo, dependencies: {input: a}, params: {targets: [two]}}
"#;

const SHARDS: &str = r#"
name: shards
steps:
  - {label: shard, kind: echo, params: {targets: [p0, p1, p2]}}
"#;

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn init(dir: &Path, yaml: &str) -> Arc<Pipeline> {
    let pipeline = testing::pipeline(dir, yaml);
    pipeline.init().unwrap();
    pipeline
}

/// Put a step in `FAILED` as if an earlier attempt had died
fn fail(step: &Step) {
    step.set_state(StepState::Submitted).unwrap();
    step.save_submission(&SubmissionInfo::pending(RunnerKind::Debug, vec![]))
        .unwrap();
    step.set_state(StepState::Failed).unwrap();
}

#[tokio::test]
async fn test_dependency_runs_first_and_both_finish() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), CHAIN);
    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Deferred);

    let submitted = runner.submit_pipeline(&pipeline, &[], true).await.unwrap();
    let a_main = submitted["a"].as_ref().unwrap().main_task.clone().unwrap();
    let b_main = submitted["b"].as_ref().unwrap().main_task.clone().unwrap();
    assert_eq!(backend.dependencies_of(&b_main).unwrap(), vec![a_main.clone()]);

    backend.run_pending().await.unwrap();
    runner.wait_for_pipeline(&pipeline, &[]).await.unwrap();

    let executions = backend.executions();
    let position = |h: &TaskHandle| executions.iter().position(|e| e == h).unwrap();
    assert!(position(&a_main) < position(&b_main));

    for label in ["a", "b"] {
        let step = pipeline.step(label).unwrap();
        assert_eq!(step.state().unwrap(), Some(StepState::Done));
        assert!(step.missing_targets().unwrap().is_empty());
    }
    assert_eq!(read(pipeline.step("b").unwrap().output_dir().join("two")), "b:two\n");
}

#[tokio::test]
async fn test_existing_target_is_not_recomputed() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    std::fs::write(step.output_dir().join("p1"), "external\n").unwrap();

    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Inline);
    runner.submit_pipeline(&pipeline, &[], true).await.unwrap();

    assert_eq!(backend.subtask_submissions("shard").len(), 2);
    assert_eq!(read(step.output_dir().join("p1")), "external\n");
    assert_eq!(read(step.output_dir().join("p0")), "shard:p0\n");
    assert_eq!(step.state().unwrap(), Some(StepState::Done));
}

#[tokio::test]
async fn test_done_step_makes_no_backend_calls() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Inline);
    runner.submit_pipeline(&pipeline, &[], true).await.unwrap();
    let calls = backend.submissions().len();

    let again = runner.submit_pipeline(&pipeline, &[], false).await.unwrap();
    assert_eq!(again["shard"], None);
    assert_eq!(backend.submissions().len(), calls);
    assert!(pipeline.step("shard").unwrap().missing_targets().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_step_keeps_finished_targets() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    fail(step);
    std::fs::write(step.output_dir().join("p0"), "from the first attempt\n").unwrap();

    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Inline);
    runner.submit_step(step, true).await.unwrap();

    assert_eq!(step.state().unwrap(), Some(StepState::Done));
    assert_eq!(read(step.output_dir().join("p0")), "from the first attempt\n");
    assert_eq!(backend.subtask_submissions("shard").len(), 2);
}

#[tokio::test]
async fn test_failed_step_recomputes_everything() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    fail(step);
    std::fs::write(step.output_dir().join("p0"), "from the first attempt\n").unwrap();

    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Inline);
    runner.submit_step(step, false).await.unwrap();

    assert_eq!(step.state().unwrap(), Some(StepState::Done));
    assert_eq!(read(step.output_dir().join("p0")), "shard:p0\n");
    assert_eq!(backend.subtask_submissions("shard").len(), 3);
}

#[tokio::test]
async fn test_subtask_failure_fails_only_its_branch() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(
        temp_dir.path(),
        r#"
name: branches
steps:
  - {label: bad, kind: echo, params: {targets: [x, y], fail_on: y}}
  - {label: after, kind: echo, dependencies: {input: bad}, params: {targets: [z]}}
  - {label: other, kind: echo, params: {targets: [w]}}
"#,
    );
    let (runner, _backend) = Runner::debug(&pipeline, DebugMode::Inline);
    runner.submit_pipeline(&pipeline, &[], true).await.unwrap();

    let bad = pipeline.step("bad").unwrap();
    assert_eq!(bad.state().unwrap(), Some(StepState::Failed));
    assert!(bad.output_dir().join("x").exists());
    assert!(!bad.output_dir().join("y").exists());
    assert_eq!(pipeline.step("other").unwrap().state().unwrap(), Some(StepState::Done));

    // The dependant's main task never started; the next check notices it is gone
    let after = pipeline.step("after").unwrap();
    assert_eq!(after.state().unwrap(), Some(StepState::Submitted));
    assert!(matches!(
        runner.wait_for_pipeline(&pipeline, &[]).await,
        Err(PipestepError::StepFailed { step }) if step == "bad"
    ));
    assert_eq!(runner.reconcile(after).await.unwrap(), Some(StepState::Failed));
    assert!(!after.output_dir().join("z").exists());
}

#[tokio::test]
async fn test_resubmission_replaces_main_task_and_repoints_dependants() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), CHAIN);
    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Deferred);

    let submitted = runner.submit_pipeline(&pipeline, &[], true).await.unwrap();
    let old = submitted["a"].as_ref().unwrap().main_task.clone().unwrap();
    let b_main = submitted["b"].as_ref().unwrap().main_task.clone().unwrap();

    let a = pipeline.step("a").unwrap();
    let info = runner.resubmit_step(a, true).await.unwrap().unwrap();
    let new = info.main_task.unwrap();
    assert_ne!(new, old);

    let b = pipeline.step("b").unwrap();
    assert_eq!(
        backend.modified_dependencies(),
        vec![(b_main.clone(), vec![new.clone()])]
    );
    assert_eq!(backend.dependencies_of(&b_main).unwrap(), vec![new.clone()]);
    assert_eq!(b.submission().unwrap().unwrap().dependencies, vec![new]);
    assert!(backend
        .signals()
        .contains(&(old, TaskSignal::ResubmitKeepFinished)));

    runner.wait_for_pipeline(&pipeline, &[]).await.unwrap();
    assert_eq!(b.state().unwrap(), Some(StepState::Done));
}

#[tokio::test]
async fn test_stop_running_step_leaves_no_partial_target() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Deferred);

    let info = runner.submit_step(step, true).await.unwrap().unwrap();
    let main = info.main_task.unwrap();

    // A main task that got as far as one queued subtask
    let target = step.output_dir().join("p0");
    let subtask = runner.submit_subtask(step, &target).await.unwrap();
    step.update_submission(|record| record.set_subtask(subtask.clone()))
        .unwrap();
    step.set_state(StepState::Running).unwrap();
    std::fs::write(&target, "shard:").unwrap();

    let stopped = runner.stop_pipeline(&pipeline).await.unwrap();
    assert_eq!(stopped, vec!["shard"]);
    assert_eq!(step.state().unwrap(), Some(StepState::Failed));
    assert!(!target.exists());

    let signals = backend.signals();
    assert!(signals.contains(&(main, TaskSignal::Terminate)));
    assert!(signals.contains(&(subtask, TaskSignal::Terminate)));
}

#[tokio::test]
async fn test_foreign_runner_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    step.set_state(StepState::Submitted).unwrap();
    step.save_submission(&SubmissionInfo::new(
        RunnerKind::Slurm,
        TaskHandle::main("4242"),
        vec![],
    ))
    .unwrap();

    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Inline);

    assert!(matches!(
        runner.stop_pipeline(&pipeline).await,
        Err(PipestepError::OwnershipConflict { owner: RunnerKind::Slurm, .. })
    ));
    assert!(matches!(
        runner.submit_step(step, true).await,
        Err(PipestepError::OwnershipConflict { .. })
    ));
    assert!(matches!(
        runner.resubmit_step(step, true).await,
        Err(PipestepError::OwnershipConflict { .. })
    ));
    assert!(backend.submissions().is_empty());
    assert!(backend.signals().is_empty());
    assert_eq!(step.state().unwrap(), Some(StepState::Submitted));
}

#[tokio::test]
async fn test_resumed_main_task_reuses_running_subtask() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Deferred);

    runner.submit_step(step, true).await.unwrap();

    // Left behind by a main task that died after its first submission
    let target = step.output_dir().join("p0");
    let subtask = runner.submit_subtask(step, &target).await.unwrap();
    step.update_submission(|record| record.set_subtask(subtask.clone()))
        .unwrap();

    backend.run_pending().await.unwrap();

    assert_eq!(step.state().unwrap(), Some(StepState::Done));
    let submissions = backend.subtask_submissions("shard");
    assert_eq!(submissions.len(), 3);
    let for_p0 = submissions
        .iter()
        .filter(|s| s.handle.target.as_deref() == Some(target.as_path()))
        .count();
    assert_eq!(for_p0, 1);
    assert!(backend.executions().contains(&subtask));
    assert_eq!(read(&target), "shard:p0\n");
}

#[tokio::test]
async fn test_resubmit_all_while_running_restarts_from_scratch() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    let (runner, backend) = Runner::debug(&pipeline, DebugMode::Deferred);

    let old = runner
        .submit_step(step, true)
        .await
        .unwrap()
        .unwrap()
        .main_task
        .unwrap();

    // One target finished, one subtask still queued
    std::fs::write(step.output_dir().join("p0"), "external\n").unwrap();
    let live = runner
        .submit_subtask(step, &step.output_dir().join("p1"))
        .await
        .unwrap();
    step.update_submission(|record| record.set_subtask(live.clone()))
        .unwrap();
    step.set_state(StepState::Running).unwrap();

    let info = runner.resubmit_step(step, false).await.unwrap().unwrap();
    let new = info.main_task.unwrap();
    assert_ne!(new, old);

    let signals = backend.signals();
    assert!(signals.contains(&(old, TaskSignal::ResubmitAll)));
    assert!(signals.contains(&(live.clone(), TaskSignal::Terminate)));
    assert!(!backend.executions().contains(&live));

    assert_eq!(step.state().unwrap(), Some(StepState::Done));
    assert_eq!(read(step.output_dir().join("p0")), "shard:p0\n");
    assert_eq!(backend.subtask_submissions("shard").len(), 4);
}

#[tokio::test]
async fn test_stop_cancels_subtask_of_unknown_liveness() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = init(temp_dir.path(), SHARDS);
    let step = pipeline.step("shard").unwrap();
    let (runner, _backend) = Runner::debug(&pipeline, DebugMode::Deferred);

    runner.submit_step(step, true).await.unwrap();

    // The backend has no record of this handle
    let target = step.output_dir().join("p0");
    step.update_submission(|record| record.set_subtask(TaskHandle::subtask("lost", target.clone())))
        .unwrap();
    step.set_state(StepState::Running).unwrap();
    std::fs::write(&target, "shard:").unwrap();

    let stopped = runner.stop_pipeline(&pipeline).await.unwrap();
    assert_eq!(stopped, vec!["shard"]);
    assert_eq!(step.state().unwrap(), Some(StepState::Failed));
    assert!(!target.exists());
}
