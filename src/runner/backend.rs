// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Backend trait
//!
//! A backend turns a [`TaskRequest`] into a job on some execution system and
//! reports on it afterwards. Backends know nothing about steps or states.

use async_trait::async_trait;

use super::{RunnerKind, TaskHandle, TaskRequest};
use crate::errors::{PipestepError, PipestepResult};
use crate::step::StepCommand;

/// Signal delivered to a running task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSignal {
    /// Stop the task
    Terminate,
    /// Resubmit, keeping finished targets
    ResubmitKeepFinished,
    /// Resubmit, recomputing every target
    ResubmitAll,
}

impl TaskSignal {
    /// POSIX signal name used as transport
    pub fn name(self) -> &'static str {
        match self {
            Self::Terminate => "TERM",
            Self::ResubmitKeepFinished => "USR1",
            Self::ResubmitAll => "USR2",
        }
    }
}

impl From<StepCommand> for TaskSignal {
    fn from(command: StepCommand) -> Self {
        match command {
            StepCommand::Terminate => Self::Terminate,
            StepCommand::Resubmit { keep_finished: true } => Self::ResubmitKeepFinished,
            StepCommand::Resubmit { keep_finished: false } => Self::ResubmitAll,
        }
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    /// Exit code, when the backend knows it
    pub code: Option<i32>,
    /// Backend-specific detail (scheduler state, signal, ...)
    pub detail: Option<String>,
}

impl TaskExit {
    pub fn success() -> Self {
        Self::code(0)
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            detail: None,
        }
    }

    /// Exit status the backend could not determine
    pub fn unknown(detail: impl Into<String>) -> Self {
        Self {
            code: None,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn is_unknown(&self) -> bool {
        self.code.is_none()
    }

    /// One-line description for error messages
    pub fn describe(&self) -> String {
        match (&self.code, &self.detail) {
            (Some(code), Some(detail)) => format!("exit code {} ({})", code, detail),
            (Some(code), None) => format!("exit code {}", code),
            (None, Some(detail)) => detail.clone(),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// An execution system tasks can be submitted to
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which runner kind this backend implements
    fn kind(&self) -> RunnerKind;

    /// Submit a task; it starts once every dependency finished successfully
    async fn submit(&self, request: TaskRequest) -> PipestepResult<TaskHandle>;

    /// Deliver a signal to a task
    async fn signal(&self, handle: &TaskHandle, signal: TaskSignal) -> PipestepResult<()>;

    /// Stop a task, queued or running
    async fn cancel(&self, handle: &TaskHandle) -> PipestepResult<()> {
        self.signal(handle, TaskSignal::Terminate).await
    }

    /// Block until the task finished
    async fn wait_one(&self, handle: &TaskHandle) -> PipestepResult<TaskExit>;

    /// Whether the task is queued or running
    async fn is_running(&self, handle: &TaskHandle) -> PipestepResult<bool>;

    /// Replace the dependency list of a queued task
    ///
    /// Returns `false` when the backend cannot do this.
    async fn modify_dependency(
        &self,
        handle: &TaskHandle,
        dependencies: &[TaskHandle],
    ) -> PipestepResult<bool>;

    /// Whether the tools this backend needs are installed
    async fn check_available(&self) -> PipestepResult<bool>;
}

/// Check that every tool is on `PATH`
pub(crate) fn require_tools(tools: &[&str]) -> PipestepResult<bool> {
    for tool in tools {
        if which::which(tool).is_err() {
            return Err(PipestepError::backend_unavailable(tool));
        }
    }
    Ok(true)
}
