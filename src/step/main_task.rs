// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Main task of a step
//!
//! The main task runs as a backend job of its own. It submits one subtask
//! per missing target, waits for them, runs the post hook and marks the step
//! done. Between operations it polls its [`CommandInbox`] for termination and
//! resubmission requests.

use std::sync::Arc;

use super::commands::{CommandInbox, StepCommand};
use super::{Step, StepState};
use crate::errors::{PipestepError, PipestepResult};
use crate::pipeline::Pipeline;
use crate::runner::{Runner, SubmissionInfo, TaskHandle};

/// How a main task ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainTaskOutcome {
    /// Every target exists and the step is `DONE`
    Done,
    /// A new main task took over
    Resubmitted(SubmissionInfo),
}

/// The orchestrating task of one step
pub struct MainTask<'a> {
    pipeline: &'a Pipeline,
    step: Arc<Step>,
    runner: &'a Runner,
    inbox: CommandInbox,
    tracked: Vec<TaskHandle>,
}

impl<'a> MainTask<'a> {
    pub fn new(pipeline: &'a Pipeline, step: Arc<Step>, runner: &'a Runner) -> Self {
        let inbox = CommandInbox::new(step.label(), step.store().clone());
        Self {
            pipeline,
            step,
            runner,
            inbox,
            tracked: Vec::new(),
        }
    }

    /// Also accept commands as OS signals
    pub fn listen_os_signals(mut self) -> PipestepResult<Self> {
        self.inbox.listen_os_signals()?;
        Ok(self)
    }

    /// Sender for in-process commands
    pub fn commands(&self) -> tokio::sync::mpsc::UnboundedSender<StepCommand> {
        self.inbox.sender()
    }

    /// Run to completion
    ///
    /// Any error marks the step `FAILED` and stops the subtasks still running.
    pub async fn run(mut self) -> PipestepResult<MainTaskOutcome> {
        let result = self.execute().await;

        if let Err(e) = &result {
            tracing::error!(step = %self.step.label(), "Main task failed: {}", e);
            self.terminate_tracked().await;
            self.mark_failed();
        }
        result
    }

    async fn execute(&mut self) -> PipestepResult<MainTaskOutcome> {
        let step = self.step.clone();
        let runner = self.runner;

        step.kind().pre(&step.context()?).await?;

        let mut info = step.submission()?.ok_or_else(|| PipestepError::NotFound {
            what: format!("Submission record of step '{}'", step.label()),
            path: step.dir().to_path_buf(),
        })?;

        for target in step.targets()? {
            if let Some(outcome) = self.handle_command().await? {
                return Ok(outcome);
            }

            if let Some(handle) = info.subtask_for(&target).cloned() {
                if runner.backend().is_running(&handle).await? {
                    tracing::info!(step = %step.label(), "Reusing running subtask {}", handle);
                    self.tracked.push(handle);
                    continue;
                }
            }

            if target.exists() {
                tracing::debug!(step = %step.label(), "{} already exists", target.display());
                continue;
            }

            let handle = runner.submit_subtask(&step, &target).await?;
            self.tracked.push(handle.clone());
            info = step.update_submission(|record| record.set_subtask(handle))?;
        }

        step.set_state(StepState::Running)?;
        tracing::info!(
            step = %step.label(),
            "Running, waiting for {} subtask(s)",
            self.tracked.len()
        );

        while let Some(handle) = self.tracked.first().cloned() {
            let wait = runner.wait_task(&handle);
            tokio::pin!(wait);
            let mut ticker = tokio::time::interval(runner.poll_interval());

            loop {
                tokio::select! {
                    result = &mut wait => {
                        result?;
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some(outcome) = self.handle_command().await? {
                            return Ok(outcome);
                        }
                    }
                }
            }
            self.tracked.remove(0);
        }

        step.kind().post(&step.context()?).await?;

        let missing = step.missing_targets()?;
        if !missing.is_empty() {
            return Err(PipestepError::MissingTargets {
                step: step.label().to_string(),
                missing,
            });
        }

        step.set_state(StepState::Done)?;
        step.clear_temp()?;
        tracing::info!(step = %step.label(), "Done");
        Ok(MainTaskOutcome::Done)
    }

    async fn handle_command(&mut self) -> PipestepResult<Option<MainTaskOutcome>> {
        match self.inbox.poll()? {
            None => Ok(None),
            Some(StepCommand::Terminate) => Err(PipestepError::Terminated {
                step: self.step.label().to_string(),
            }),
            Some(StepCommand::Resubmit { keep_finished }) => {
                tracing::info!(step = %self.step.label(), "Resubmitting (keep finished: {})", keep_finished);
                self.inbox.drain()?;
                self.terminate_tracked().await;

                let info = self
                    .runner
                    .resubmit_main_task(self.pipeline, &self.step, keep_finished)
                    .await?;
                Ok(Some(MainTaskOutcome::Resubmitted(info)))
            }
        }
    }

    /// Cancel subtasks that are still running and drop their targets
    ///
    /// Besides the handles this task submitted or reused, this covers the
    /// ones an earlier main task left in the submission record.
    async fn terminate_tracked(&mut self) {
        let mut handles = std::mem::take(&mut self.tracked);
        match self.step.submission() {
            Ok(Some(info)) => {
                for handle in info.subtasks {
                    if !handles.contains(&handle) {
                        handles.push(handle);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(step = %self.step.label(), "{}", e),
        }

        let backend = self.runner.backend();
        for handle in handles {
            // Unknown liveness is handled like a running task
            if self.runner.query_running(&self.step, &handle).await == Some(false) {
                continue;
            }

            if let Err(e) = backend.cancel(&handle).await {
                tracing::warn!(step = %self.step.label(), "Could not cancel {}: {}", handle, e);
            }
            if let Some(target) = &handle.target {
                if let Err(e) = self.step.remove_target(target) {
                    tracing::warn!(step = %self.step.label(), "{}", e);
                }
            }
        }
    }

    fn mark_failed(&self) {
        match self.step.state() {
            Ok(Some(state)) if state.is_active() => {
                if let Err(e) = self.step.set_state(StepState::Failed) {
                    tracing::warn!(step = %self.step.label(), "Could not mark failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(step = %self.step.label(), "Could not read state: {}", e),
        }
    }
}
