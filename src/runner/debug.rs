// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Debug backend
//!
//! Runs tasks inside the current process through an [`InlineExecutor`].
//! In [`DebugMode::Inline`] a task runs to completion inside `submit`; in
//! [`DebugMode::Deferred`] tasks wait until someone waits on them or calls
//! [`DebugBackend::run_pending`]. Every call is journaled so tests can check
//! submission order, dependencies and signals.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use super::backend::{Backend, TaskExit, TaskSignal};
use super::{Runner, RunnerKind, TaskHandle, TaskRequest};
use crate::errors::{PipestepError, PipestepResult};
use crate::pipeline::Pipeline;
use crate::step::{MainTask, ResourceSpec};

/// Exit code recorded for tasks whose dependency failed
const DEPENDENCY_FAILED: i32 = 125;
/// Exit code recorded for cancelled tasks
const CANCELLED: i32 = 143;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs a task request in-process
#[async_trait]
pub trait InlineExecutor: Send + Sync {
    async fn execute(&self, request: &TaskRequest) -> PipestepResult<()>;
}

/// Executes main tasks and subtasks of a pipeline's steps
pub struct InlineTasks {
    pipeline: Arc<Pipeline>,
    runner: Weak<Runner>,
}

impl InlineTasks {
    pub fn new(pipeline: Arc<Pipeline>, runner: Weak<Runner>) -> Self {
        Self { pipeline, runner }
    }
}

#[async_trait]
impl InlineExecutor for InlineTasks {
    async fn execute(&self, request: &TaskRequest) -> PipestepResult<()> {
        let runner = self
            .runner
            .upgrade()
            .ok_or_else(|| PipestepError::backend(RunnerKind::Debug, "runner was dropped"))?;
        let step = self.pipeline.step(&request.label)?.clone();

        match &request.target {
            Some(target) => step.run_subtask(target).await,
            None => MainTask::new(&self.pipeline, step, &runner)
                .run()
                .await
                .map(|_| ()),
        }
    }
}

/// When submitted tasks run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// Inside `submit`
    Inline,
    /// When waited on, or on [`DebugBackend::run_pending`]
    Deferred,
}

/// A journaled submission
#[derive(Debug, Clone, PartialEq)]
pub struct DebugSubmission {
    pub handle: TaskHandle,
    pub label: String,
    pub dependencies: Vec<TaskHandle>,
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone, PartialEq)]
enum TaskStatus {
    Pending,
    Running,
    Finished(TaskExit),
}

#[derive(Debug)]
struct DebugTask {
    request: TaskRequest,
    dependencies: Vec<TaskHandle>,
    status: TaskStatus,
}

enum Claim {
    Finished(TaskExit),
    Busy,
    Run(TaskRequest, Vec<u64>),
}

#[derive(Debug, Default)]
struct Journal {
    next_id: u64,
    tasks: BTreeMap<u64, DebugTask>,
    submissions: Vec<DebugSubmission>,
    executions: Vec<TaskHandle>,
    signals: Vec<(TaskHandle, TaskSignal)>,
    modified: Vec<(TaskHandle, Vec<TaskHandle>)>,
}

/// In-process backend
pub struct DebugBackend {
    mode: DebugMode,
    journal: Mutex<Journal>,
    executor: OnceLock<Arc<dyn InlineExecutor>>,
}

impl DebugBackend {
    pub fn new(mode: DebugMode) -> Self {
        Self {
            mode,
            journal: Mutex::new(Journal::default()),
            executor: OnceLock::new(),
        }
    }

    /// Set the executor; only the first call has an effect
    pub fn attach(&self, executor: Arc<dyn InlineExecutor>) {
        if self.executor.set(executor).is_err() {
            tracing::debug!("Debug backend already has an executor");
        }
    }

    pub fn mode(&self) -> DebugMode {
        self.mode
    }

    fn with<T>(&self, f: impl FnOnce(&mut Journal) -> T) -> T {
        let mut journal = match self.journal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut journal)
    }

    fn task_id(handle: &TaskHandle) -> PipestepResult<u64> {
        handle
            .id
            .parse()
            .map_err(|_| PipestepError::backend(RunnerKind::Debug, format!("unknown task {}", handle)))
    }

    /// Every submission, in order
    pub fn submissions(&self) -> Vec<DebugSubmission> {
        self.with(|j| j.submissions.clone())
    }

    /// Submissions that computed a target
    pub fn subtask_submissions(&self, label: &str) -> Vec<DebugSubmission> {
        self.with(|j| {
            j.submissions
                .iter()
                .filter(|s| s.label == label && !s.handle.is_main())
                .cloned()
                .collect()
        })
    }

    /// Tasks in the order they started executing
    pub fn executions(&self) -> Vec<TaskHandle> {
        self.with(|j| j.executions.clone())
    }

    /// Signals delivered, in order
    pub fn signals(&self) -> Vec<(TaskHandle, TaskSignal)> {
        self.with(|j| j.signals.clone())
    }

    /// Dependency changes, in order
    pub fn modified_dependencies(&self) -> Vec<(TaskHandle, Vec<TaskHandle>)> {
        self.with(|j| j.modified.clone())
    }

    /// Current dependency list of a task
    pub fn dependencies_of(&self, handle: &TaskHandle) -> Option<Vec<TaskHandle>> {
        let id = Self::task_id(handle).ok()?;
        self.with(|j| j.tasks.get(&id).map(|t| t.dependencies.clone()))
    }

    /// Exit of a finished task
    pub fn exit_of(&self, handle: &TaskHandle) -> Option<TaskExit> {
        let id = Self::task_id(handle).ok()?;
        self.with(|j| match j.tasks.get(&id).map(|t| &t.status) {
            Some(TaskStatus::Finished(exit)) => Some(exit.clone()),
            _ => None,
        })
    }

    /// Run queued tasks in submission order until none is left
    pub async fn run_pending(&self) -> PipestepResult<usize> {
        let mut ran = 0;
        loop {
            let next = self.with(|j| {
                j.tasks
                    .iter()
                    .find(|(_, t)| t.status == TaskStatus::Pending)
                    .map(|(id, _)| *id)
            });
            let Some(id) = next else {
                return Ok(ran);
            };
            self.drive(id).await?;
            ran += 1;
        }
    }

    fn finish(&self, id: u64, exit: TaskExit) {
        self.with(|j| {
            if let Some(task) = j.tasks.get_mut(&id) {
                task.status = TaskStatus::Finished(exit);
            }
        });
    }

    /// Run a task, and first the dependencies it still waits for
    fn drive(&self, id: u64) -> BoxFuture<'_, PipestepResult<TaskExit>> {
        Box::pin(async move {
            let claim = self.with(|j| {
                j.tasks.get(&id).map(|task| match &task.status {
                    TaskStatus::Finished(exit) => Claim::Finished(exit.clone()),
                    TaskStatus::Running => Claim::Busy,
                    TaskStatus::Pending => Claim::Run(
                        task.request.clone(),
                        task.dependencies
                            .iter()
                            .filter_map(|h| h.id.parse().ok())
                            .collect(),
                    ),
                })
            });

            let (request, dependencies) = match claim {
                None => {
                    return Err(PipestepError::backend(
                        RunnerKind::Debug,
                        format!("unknown task {}", id),
                    ))
                }
                Some(Claim::Finished(exit)) => return Ok(exit),
                Some(Claim::Busy) => {
                    return Err(PipestepError::backend(
                        RunnerKind::Debug,
                        format!("task {} is waited on while it runs", id),
                    ))
                }
                Some(Claim::Run(request, dependencies)) => (request, dependencies),
            };

            for dep in dependencies {
                if !self.drive(dep).await?.is_success() {
                    let exit = TaskExit::code(DEPENDENCY_FAILED)
                        .with_detail(format!("dependency {} failed", dep));
                    self.finish(id, exit.clone());
                    return Ok(exit);
                }
            }

            let handle = TaskHandle {
                id: id.to_string(),
                target: request.target.clone(),
            };
            self.with(|j| {
                if let Some(task) = j.tasks.get_mut(&id) {
                    task.status = TaskStatus::Running;
                }
                j.executions.push(handle);
            });

            let executor = self
                .executor
                .get()
                .cloned()
                .ok_or_else(|| PipestepError::backend(RunnerKind::Debug, "no executor attached"))?;

            let exit = match executor.execute(&request).await {
                Ok(()) => TaskExit::success(),
                Err(e) => TaskExit::code(1).with_detail(e.to_string()),
            };
            self.finish(id, exit.clone());
            Ok(exit)
        })
    }
}

#[async_trait]
impl Backend for DebugBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Debug
    }

    async fn submit(&self, request: TaskRequest) -> PipestepResult<TaskHandle> {
        let (id, handle) = self.with(|j| {
            j.next_id += 1;
            let id = j.next_id;
            let handle = TaskHandle {
                id: id.to_string(),
                target: request.target.clone(),
            };

            j.submissions.push(DebugSubmission {
                handle: handle.clone(),
                label: request.label.clone(),
                dependencies: request.dependencies.clone(),
                resources: request.resources.clone(),
            });
            j.tasks.insert(
                id,
                DebugTask {
                    dependencies: request.dependencies.clone(),
                    request,
                    status: TaskStatus::Pending,
                },
            );
            (id, handle)
        });

        if self.mode == DebugMode::Inline {
            self.drive(id).await?;
        }
        Ok(handle)
    }

    async fn signal(&self, handle: &TaskHandle, signal: TaskSignal) -> PipestepResult<()> {
        let id = Self::task_id(handle)?;
        let pending = self.with(|j| {
            j.signals.push((handle.clone(), signal));
            j.tasks
                .get(&id)
                .is_some_and(|t| t.status == TaskStatus::Pending)
        });

        match signal {
            TaskSignal::Terminate if pending => {
                self.finish(id, TaskExit::code(CANCELLED).with_detail("cancelled"));
            }
            TaskSignal::Terminate => {}
            // A queued main task reads its control record once it runs
            TaskSignal::ResubmitKeepFinished | TaskSignal::ResubmitAll => {
                self.run_pending().await?;
            }
        }
        Ok(())
    }

    async fn wait_one(&self, handle: &TaskHandle) -> PipestepResult<TaskExit> {
        self.drive(Self::task_id(handle)?).await
    }

    async fn is_running(&self, handle: &TaskHandle) -> PipestepResult<bool> {
        let id = Self::task_id(handle)?;
        Ok(self.with(|j| {
            j.tasks
                .get(&id)
                .is_some_and(|t| !matches!(t.status, TaskStatus::Finished(_)))
        }))
    }

    async fn modify_dependency(
        &self,
        handle: &TaskHandle,
        dependencies: &[TaskHandle],
    ) -> PipestepResult<bool> {
        let id = Self::task_id(handle)?;
        self.with(|j| {
            if let Some(task) = j.tasks.get_mut(&id) {
                task.dependencies = dependencies.to_vec();
            }
            j.modified.push((handle.clone(), dependencies.to_vec()));
        });
        Ok(true)
    }

    async fn check_available(&self) -> PipestepResult<bool> {
        Ok(true)
    }
}
