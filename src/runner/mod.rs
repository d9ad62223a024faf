// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Runners
//!
//! A [`Runner`] drives steps through a [`Backend`]: it submits main tasks in
//! topological order with backend-level dependencies, replaces them on
//! resubmission and stops whole pipelines. A step is owned by the runner
//! kind recorded in its [`SubmissionInfo`]; no other kind may manage it while
//! it is active.

pub mod backend;
mod debug;
mod local;
mod queue;
#[cfg(test)]
mod scenarios;
mod slurm;

pub use backend::{Backend, TaskExit, TaskSignal};
pub use debug::{DebugBackend, DebugMode, DebugSubmission, InlineExecutor, InlineTasks};
pub use local::LocalBackend;
pub use queue::{QueueBackend, QueueParams};
pub use slurm::{SlurmBackend, SlurmParams};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{PipestepError, PipestepResult};
use crate::pipeline::Pipeline;
use crate::step::{entry, ResourceSpec, Step, StepCommand, StepState};
use crate::store::write_atomic;

/// Runner parameters file inside the pipeline directory
pub const PARAMS_FILE: &str = "runner.toml";

const DEFAULT_POLL_MS: u64 = 2_000;
const DEFAULT_RESUBMIT_TIMEOUT_SECS: u64 = 600;

// ─────────────────────────────────────────────────────────────────────────────
// Handles and submission records
// ─────────────────────────────────────────────────────────────────────────────

/// Backend-native identifier of a submitted task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Opaque backend id (job id, pid, ...)
    pub id: String,

    /// Target file computed by the task; `None` for main tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

impl TaskHandle {
    /// Handle of a main task
    pub fn main(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: None,
        }
    }

    /// Handle of a subtask computing `target`
    pub fn subtask(id: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            target: Some(target.into()),
        }
    }

    pub fn is_main(&self) -> bool {
        self.target.is_none()
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target.as_ref().and_then(|t| t.file_name()) {
            Some(name) => write!(f, "{} ({})", self.id, name.to_string_lossy()),
            None => write!(f, "{}", self.id),
        }
    }
}

/// What was submitted for a step, and by whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionInfo {
    /// Runner kind owning the step
    pub runner: RunnerKind,

    /// Current main task; `None` between marking the step submitted and
    /// the backend accepting the task
    #[serde(default)]
    pub main_task: Option<TaskHandle>,

    /// Main tasks of the dependencies the main task waits for
    #[serde(default)]
    pub dependencies: Vec<TaskHandle>,

    /// Subtasks submitted by the main task
    #[serde(default)]
    pub subtasks: Vec<TaskHandle>,
}

impl SubmissionInfo {
    pub fn new(runner: RunnerKind, main_task: TaskHandle, dependencies: Vec<TaskHandle>) -> Self {
        Self {
            runner,
            main_task: Some(main_task),
            dependencies,
            subtasks: Vec::new(),
        }
    }

    /// Record written before the backend is called
    pub fn pending(runner: RunnerKind, dependencies: Vec<TaskHandle>) -> Self {
        Self {
            runner,
            main_task: None,
            dependencies,
            subtasks: Vec::new(),
        }
    }

    /// Subtask handle computing `target`, if any
    pub fn subtask_for(&self, target: &Path) -> Option<&TaskHandle> {
        self.subtasks
            .iter()
            .find(|h| h.target.as_deref() == Some(target))
    }

    /// Record a subtask, replacing any previous one for the same target
    pub fn set_subtask(&mut self, handle: TaskHandle) {
        self.subtasks.retain(|h| h.target != handle.target);
        self.subtasks.push(handle);
    }

    /// Drop the subtask computing `target`
    pub fn forget_subtask(&mut self, target: &Path) {
        self.subtasks.retain(|h| h.target.as_deref() != Some(target));
    }

    /// Repoint a dependency; returns whether `old` was present
    pub fn replace_dependency(&mut self, old: &TaskHandle, new: &TaskHandle) -> bool {
        if !self.dependencies.contains(old) {
            return false;
        }
        self.dependencies.retain(|h| h != old && h != new);
        self.dependencies.push(new.clone());
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner kinds and parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Detached processes on this machine
    Local,
    /// One Slurm job per task
    Slurm,
    /// HyperQueue tasks inside one open job
    #[value(alias = "hq", alias = "hyperqueue")]
    Queue,
    /// In-process execution, for tests
    Debug,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Slurm => write!(f, "slurm"),
            Self::Queue => write!(f, "queue"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "slurm" => Ok(Self::Slurm),
            "queue" | "hq" | "hyperqueue" => Ok(Self::Queue),
            "debug" => Ok(Self::Debug),
            other => Err(format!("Unknown runner '{}'", other)),
        }
    }
}

fn default_poll_ms() -> u64 {
    DEFAULT_POLL_MS
}

fn default_resubmit_timeout() -> u64 {
    DEFAULT_RESUBMIT_TIMEOUT_SECS
}

/// Everything needed to rebuild an identical runner later
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerParams {
    pub kind: RunnerKind,

    /// Sleep between polls of backend and state
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,

    /// How long resubmission waits for the new main task
    #[serde(default = "default_resubmit_timeout")]
    pub resubmit_timeout_secs: u64,

    #[serde(default)]
    pub slurm: SlurmParams,

    #[serde(default)]
    pub queue: QueueParams,
}

impl RunnerParams {
    pub fn new(kind: RunnerKind) -> Self {
        Self {
            kind,
            poll_interval_ms: DEFAULT_POLL_MS,
            resubmit_timeout_secs: DEFAULT_RESUBMIT_TIMEOUT_SECS,
            slurm: SlurmParams::default(),
            queue: QueueParams::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn path(pipeline_dir: &Path) -> PathBuf {
        pipeline_dir.join(PARAMS_FILE)
    }

    /// Parameters persisted for a pipeline, if any
    pub fn load(pipeline_dir: &Path) -> PipestepResult<Option<Self>> {
        let path = Self::path(pipeline_dir);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(toml::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipestepError::io_at(&path, e)),
        }
    }

    pub fn save(&self, pipeline_dir: &Path) -> PipestepResult<()> {
        write_atomic(&Self::path(pipeline_dir), &toml::to_string_pretty(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task requests
// ─────────────────────────────────────────────────────────────────────────────

/// A task for a backend to run
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// Label of the step the task belongs to
    pub label: String,
    /// Program and arguments
    pub command: Vec<String>,
    /// Target computed by a subtask
    pub target: Option<PathBuf>,
    /// Tasks that must succeed first
    pub dependencies: Vec<TaskHandle>,
    pub resources: ResourceSpec,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Working directory
    pub workdir: PathBuf,
}

impl TaskRequest {
    /// Main task of a step
    ///
    /// The main task only orchestrates, so it asks for a single CPU but
    /// keeps the step's time limit and placement.
    pub fn main_task(step: &Step, dependencies: Vec<TaskHandle>) -> Self {
        let step_resources = step.resources();
        let resources = ResourceSpec {
            cpus: Some(1),
            gpus: None,
            mem: None,
            time_limit: step_resources.time_limit.clone(),
            partition: step_resources.partition.clone(),
            account: step_resources.account.clone(),
        };

        Self {
            label: step.label().to_string(),
            command: entry::command(&step.entry_point(), None),
            target: None,
            dependencies,
            resources,
            stdout: step.logs_dir().join("main.out"),
            stderr: step.logs_dir().join("main.err"),
            workdir: step.dir().to_path_buf(),
        }
    }

    /// Subtask computing one target
    pub fn subtask(step: &Step, target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "target".to_string());

        Self {
            label: step.label().to_string(),
            command: entry::command(&step.entry_point(), Some(target)),
            target: Some(target.to_path_buf()),
            dependencies: Vec::new(),
            resources: step.resources().clone(),
            stdout: step.logs_dir().join(format!("{}.out", name)),
            stderr: step.logs_dir().join(format!("{}.err", name)),
            workdir: step.dir().to_path_buf(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.target.is_none()
    }

    /// Name shown by schedulers
    pub fn job_name(&self) -> String {
        match self.target.as_ref().and_then(|t| t.file_name()) {
            Some(name) => format!("{}:{}", self.label, name.to_string_lossy()),
            None => self.label.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// Submits and manages steps through one backend
pub struct Runner {
    params: RunnerParams,
    backend: Arc<dyn Backend>,
}

impl Runner {
    pub fn new(params: RunnerParams, backend: Arc<dyn Backend>) -> Self {
        Self { params, backend }
    }

    /// Build the runner described by `params` for a pipeline
    pub async fn for_pipeline(
        pipeline: &Arc<Pipeline>,
        mut params: RunnerParams,
    ) -> PipestepResult<Arc<Self>> {
        let poll = params.poll_interval();
        let backend: Arc<dyn Backend> = match params.kind {
            RunnerKind::Local => Arc::new(LocalBackend::new(
                pipeline.dir().join(".runner").join("local"),
                poll,
            )),
            RunnerKind::Slurm => Arc::new(SlurmBackend::new(params.slurm.clone(), poll)),
            RunnerKind::Queue => {
                let backend = QueueBackend::connect(params.queue.clone(), pipeline.dir(), poll).await?;
                params.queue = backend.params().clone();
                Arc::new(backend)
            }
            RunnerKind::Debug => return Ok(Self::debug(pipeline, DebugMode::Inline).0),
        };

        Ok(Arc::new(Self::new(params, backend)))
    }

    /// In-process runner executing tasks against `pipeline`
    pub fn debug(pipeline: &Arc<Pipeline>, mode: DebugMode) -> (Arc<Self>, Arc<DebugBackend>) {
        let backend = Arc::new(DebugBackend::new(mode));
        let params =
            RunnerParams::new(RunnerKind::Debug).with_poll_interval(Duration::from_millis(1));
        let runner = Arc::new(Self::new(params, backend.clone()));
        backend.attach(Arc::new(InlineTasks::new(
            pipeline.clone(),
            Arc::downgrade(&runner),
        )));
        (runner, backend)
    }

    pub fn kind(&self) -> RunnerKind {
        self.backend.kind()
    }

    pub fn params(&self) -> &RunnerParams {
        &self.params
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn poll_interval(&self) -> Duration {
        self.params.poll_interval()
    }

    pub async fn check_available(&self) -> PipestepResult<bool> {
        self.backend.check_available().await
    }

    fn check_owner(&self, step: &Step, info: &SubmissionInfo) -> PipestepResult<()> {
        if info.runner == self.kind() {
            return Ok(());
        }
        Err(PipestepError::OwnershipConflict {
            step: step.label().to_string(),
            owner: info.runner,
            requested: self.kind(),
        })
    }

    /// Refuse to manage steps another runner kind has in flight
    ///
    /// Looks at the same closure `submit_pipeline` would submit, without
    /// touching any record.
    pub fn check_ownership(&self, pipeline: &Pipeline, labels: &[String]) -> PipestepResult<()> {
        for step in pipeline.traverse(labels)? {
            if !step.state()?.is_some_and(StepState::is_active) {
                continue;
            }
            if let Some(info) = step.submission()? {
                self.check_owner(&step, &info)?;
            }
        }
        Ok(())
    }

    /// Whether a task still runs; `None` when the backend cannot tell
    pub(crate) async fn query_running(&self, step: &Step, handle: &TaskHandle) -> Option<bool> {
        match self.backend.is_running(handle).await {
            Ok(running) => Some(running),
            Err(e) => {
                tracing::warn!(step = %step.label(), "Could not query {}: {}", handle, e);
                None
            }
        }
    }

    /// Cancel a subtask and drop its target, which can no longer be trusted
    async fn cancel_subtask(&self, step: &Step, handle: &TaskHandle) -> PipestepResult<()> {
        if let Err(e) = self.backend.cancel(handle).await {
            tracing::warn!(step = %step.label(), "Could not cancel {}: {}", handle, e);
        }
        if let Some(target) = &handle.target {
            step.remove_target(target)?;
        }
        Ok(())
    }

    fn active_submission(&self, step: &Step) -> PipestepResult<SubmissionInfo> {
        let info = step.submission()?.ok_or_else(|| PipestepError::NotFound {
            what: format!("Submission record of step '{}'", step.label()),
            path: step.dir().to_path_buf(),
        })?;
        self.check_owner(step, &info)?;
        Ok(info)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────

    /// Submit the targets of a pipeline (or the given labels) and everything they need
    pub async fn submit_pipeline(
        &self,
        pipeline: &Pipeline,
        labels: &[String],
        keep_finished: bool,
    ) -> PipestepResult<BTreeMap<String, Option<SubmissionInfo>>> {
        self.submit_all(pipeline.traverse(labels)?, keep_finished).await
    }

    /// Submit a step after its dependencies
    ///
    /// Returns `None` when the step is already done.
    pub async fn submit_step(
        &self,
        step: &Arc<Step>,
        keep_finished: bool,
    ) -> PipestepResult<Option<SubmissionInfo>> {
        let mut submitted = self.submit_all(step.closure(), keep_finished).await?;
        Ok(submitted.remove(step.label()).flatten())
    }

    async fn submit_all(
        &self,
        steps: Vec<Arc<Step>>,
        keep_finished: bool,
    ) -> PipestepResult<BTreeMap<String, Option<SubmissionInfo>>> {
        let mut handles: HashMap<String, TaskHandle> = HashMap::new();
        let mut submitted = BTreeMap::new();

        for step in steps {
            let dependencies: Vec<TaskHandle> = step
                .dependencies()
                .values()
                .filter_map(|dep| handles.get(dep.label()).cloned())
                .collect();

            let info = self.submit_one(&step, dependencies, keep_finished).await?;
            if let Some(main) = info.as_ref().and_then(|i| i.main_task.clone()) {
                handles.insert(step.label().to_string(), main);
            }
            submitted.insert(step.label().to_string(), info);
        }

        Ok(submitted)
    }

    async fn submit_one(
        &self,
        step: &Step,
        dependencies: Vec<TaskHandle>,
        keep_finished: bool,
    ) -> PipestepResult<Option<SubmissionInfo>> {
        match step.state()? {
            Some(StepState::Done) => {
                tracing::debug!(step = %step.label(), "Already done");
                Ok(None)
            }
            Some(state) if state.is_active() => {
                let info = self.active_submission(step)?;
                tracing::info!(step = %step.label(), "Already {}", state);
                Ok(Some(info))
            }
            Some(StepState::Failed) => {
                let carried = self.prepare_retry(step, keep_finished).await?;
                self.launch(step, dependencies, carried).await.map(Some)
            }
            Some(StepState::Inited) => self.launch(step, dependencies, Vec::new()).await.map(Some),
            state => Err(PipestepError::transition(
                step.label(),
                state,
                StepState::Submitted,
            )),
        }
    }

    /// Clean a failed step, returning still-running subtasks worth keeping
    async fn prepare_retry(&self, step: &Step, keep_finished: bool) -> PipestepResult<Vec<TaskHandle>> {
        let mut carried = Vec::new();

        if let Some(previous) = step.submission()? {
            if previous.runner == self.kind() {
                for handle in previous.subtasks {
                    match self.query_running(step, &handle).await {
                        Some(false) => continue,
                        Some(true) if keep_finished => {
                            carried.push(handle);
                            continue;
                        }
                        // Unknown liveness is not worth carrying over
                        _ => self.cancel_subtask(step, &handle).await?,
                    }
                }
            }
        }

        step.clean(keep_finished)?;
        Ok(carried)
    }

    async fn launch(
        &self,
        step: &Step,
        dependencies: Vec<TaskHandle>,
        carried: Vec<TaskHandle>,
    ) -> PipestepResult<SubmissionInfo> {
        // Marked before the backend call so a concurrent submit sees the step as taken
        step.set_state(StepState::Submitted)?;
        let mut pending = SubmissionInfo::pending(self.kind(), dependencies.clone());
        pending.subtasks = carried;
        step.save_submission(&pending)?;

        let request = TaskRequest::main_task(step, dependencies);
        match self.backend.submit(request).await {
            Ok(handle) => {
                tracing::info!(step = %step.label(), "Submitted main task {}", handle);
                step.update_submission(|info| info.main_task = Some(handle))
            }
            Err(e) => {
                self.mark_failed(step);
                Err(self.submission_error(e))
            }
        }
    }

    fn submission_error(&self, error: PipestepError) -> PipestepError {
        match error {
            PipestepError::BackendSubmissionFailure { .. } | PipestepError::BackendUnavailable { .. } => {
                error
            }
            other => PipestepError::backend(self.kind(), other.to_string()),
        }
    }

    fn mark_failed(&self, step: &Step) {
        match step.state() {
            Ok(Some(state)) if state.is_active() => {
                if let Err(e) = step.set_state(StepState::Failed) {
                    tracing::warn!(step = %step.label(), "Could not mark failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(step = %step.label(), "Could not read state: {}", e),
        }
    }

    /// Submit a subtask computing `target`
    pub async fn submit_subtask(&self, step: &Step, target: &Path) -> PipestepResult<TaskHandle> {
        let handle = self
            .backend
            .submit(TaskRequest::subtask(step, target))
            .await
            .map_err(|e| self.submission_error(e))?;
        tracing::debug!(step = %step.label(), "Submitted subtask {}", handle);
        Ok(handle)
    }

    /// Wait for a task; a failed subtask's target is deleted
    pub async fn wait_task(&self, handle: &TaskHandle) -> PipestepResult<()> {
        let exit = self.backend.wait_one(handle).await?;
        if exit.is_success() {
            return Ok(());
        }

        if let Some(target) = &handle.target {
            if exit.is_unknown() && target.exists() {
                tracing::warn!(
                    "Exit status of {} unknown ({}); keeping its target",
                    handle,
                    exit.describe()
                );
                return Ok(());
            }

            match std::fs::remove_file(target) {
                Ok(()) => tracing::warn!("Removed target of failed task {}", handle),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PipestepError::io_at(target, e)),
            }
        }

        Err(PipestepError::TaskFailed {
            handle: handle.to_string(),
            reason: exit.describe(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Resubmission
    // ─────────────────────────────────────────────────────────────────────

    /// Resubmit a step
    ///
    /// An active step is asked to replace itself through its command
    /// channel; this blocks until the new main task runs. Failed and
    /// never-submitted steps are submitted normally.
    pub async fn resubmit_step(
        &self,
        step: &Arc<Step>,
        keep_finished: bool,
    ) -> PipestepResult<Option<SubmissionInfo>> {
        match step.state()? {
            Some(state) if state.is_active() => {
                let info = self.active_submission(step)?;
                let old = info.main_task.clone();
                let command = StepCommand::Resubmit { keep_finished };

                step.send_command(command)?;
                if let Some(old) = &old {
                    if let Err(e) = self.backend.signal(old, command.into()).await {
                        tracing::debug!(
                            step = %step.label(),
                            "Signal not delivered ({}), relying on the control record",
                            e
                        );
                    }
                }

                self.wait_for_replacement(step, old.as_ref()).await.map(Some)
            }
            Some(StepState::Failed) | Some(StepState::Inited) => {
                self.submit_step(step, keep_finished).await
            }
            state => Err(PipestepError::transition(
                step.label(),
                state,
                StepState::Submitted,
            )),
        }
    }

    async fn wait_for_replacement(
        &self,
        step: &Step,
        old: Option<&TaskHandle>,
    ) -> PipestepResult<SubmissionInfo> {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.params.resubmit_timeout_secs);

        loop {
            let state = step.state()?;
            if state == Some(StepState::Failed) {
                return Err(PipestepError::StepFailed {
                    step: step.label().to_string(),
                });
            }

            if let Some(info) = step.submission()? {
                let replaced = info.main_task.is_some() && info.main_task.as_ref() != old;
                if replaced && matches!(state, Some(StepState::Running | StepState::Done)) {
                    return Ok(info);
                }
            }

            if started.elapsed() >= timeout {
                return Err(PipestepError::Timeout {
                    step: step.label().to_string(),
                    waited_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Replace the calling main task with a fresh submission
    ///
    /// Runs inside the main task after its subtasks were stopped.
    pub async fn resubmit_main_task(
        &self,
        pipeline: &Pipeline,
        step: &Step,
        keep_finished: bool,
    ) -> PipestepResult<SubmissionInfo> {
        let old = step.submission()?.and_then(|info| info.main_task);
        if !keep_finished {
            step.remove_targets()?;
        }

        step.set_state(StepState::Submitted)?;
        let dependencies = self.dependency_handles(step)?;
        step.update_submission(|info| {
            info.main_task = None;
            info.dependencies = dependencies.clone();
            info.subtasks.clear();
        })?;

        let handle = match self
            .backend
            .submit(TaskRequest::main_task(step, dependencies))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_failed(step);
                return Err(self.submission_error(e));
            }
        };
        tracing::info!(step = %step.label(), "Resubmitted as main task {}", handle);
        let info = step.update_submission(|info| info.main_task = Some(handle.clone()))?;

        if let Some(old) = old {
            self.update_dependants(pipeline, &old, &handle).await?;
        }
        Ok(info)
    }

    /// Main tasks of dependencies that have not finished yet
    fn dependency_handles(&self, step: &Step) -> PipestepResult<Vec<TaskHandle>> {
        let mut handles = Vec::new();
        for dep in step.dependencies().values() {
            if !dep.state()?.is_some_and(StepState::is_active) {
                continue;
            }
            if let Some(main) = dep.submission()?.and_then(|info| info.main_task) {
                handles.push(main);
            }
        }
        Ok(handles)
    }

    /// Repoint every queued step that waited on `old` to `new`
    pub async fn update_dependants(
        &self,
        pipeline: &Pipeline,
        old: &TaskHandle,
        new: &TaskHandle,
    ) -> PipestepResult<usize> {
        let mut updated = 0;

        for step in pipeline.steps() {
            if !step.state()?.is_some_and(StepState::is_active) {
                continue;
            }
            let Some(mut info) = step.submission()? else {
                continue;
            };
            if info.runner != self.kind() || !info.replace_dependency(old, new) {
                continue;
            }

            if let Some(main) = &info.main_task {
                let applied = self.backend.modify_dependency(main, &info.dependencies).await?;
                if !applied {
                    tracing::warn!(
                        step = %step.label(),
                        "The {} backend cannot change dependencies of {}; it may start before {}",
                        self.kind(),
                        main,
                        new
                    );
                }
            }

            let dependencies = info.dependencies.clone();
            step.update_submission(|record| record.dependencies = dependencies)?;
            tracing::info!(step = %step.label(), "Now waits for {} instead of {}", new, old);
            updated += 1;
        }

        Ok(updated)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Monitoring and stopping
    // ─────────────────────────────────────────────────────────────────────

    /// Mark an active step failed when its main task vanished
    pub async fn reconcile(&self, step: &Step) -> PipestepResult<Option<StepState>> {
        let state = step.state()?;
        if !state.is_some_and(StepState::is_active) {
            return Ok(state);
        }
        let Some(info) = step.submission()? else {
            return Ok(state);
        };
        let Some(main) = info.main_task.as_ref().filter(|_| info.runner == self.kind()) else {
            return Ok(state);
        };
        if self.backend.is_running(main).await? {
            return Ok(state);
        }

        // The task may have finished or replaced itself in the meantime
        let state = step.state()?;
        let current = step.submission()?.and_then(|info| info.main_task);
        if state.is_some_and(StepState::is_active) && current.as_ref() == Some(main) {
            tracing::warn!(
                step = %step.label(),
                "Main task {} is gone but the step is still {:?}",
                main,
                state
            );
            step.set_state(StepState::Failed)?;
            return Ok(Some(StepState::Failed));
        }
        Ok(state)
    }

    /// Block until the given steps (default: the pipeline targets) are done
    pub async fn wait_for_pipeline(&self, pipeline: &Pipeline, labels: &[String]) -> PipestepResult<()> {
        let steps = pipeline.traverse(labels)?;

        loop {
            let mut pending = 0;
            for step in &steps {
                match self.reconcile(step).await? {
                    Some(StepState::Done) => {}
                    Some(StepState::Failed) => {
                        return Err(PipestepError::StepFailed {
                            step: step.label().to_string(),
                        })
                    }
                    Some(state) if state.is_active() => pending += 1,
                    _ => {
                        return Err(PipestepError::InvalidPipeline {
                            reason: format!("step '{}' was never submitted", step.label()),
                            help: Some("Run 'pipestep run' first".to_string()),
                        })
                    }
                }
            }

            if pending == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Cancel every active step of the pipeline and mark it failed
    ///
    /// Refuses to touch anything when one active step is owned by another
    /// runner kind.
    pub async fn stop_pipeline(&self, pipeline: &Pipeline) -> PipestepResult<Vec<String>> {
        let mut active = Vec::new();
        for step in pipeline.steps() {
            if !step.state()?.is_some_and(StepState::is_active) {
                continue;
            }
            let info = step.submission()?;
            if let Some(info) = &info {
                self.check_owner(step, info)?;
            }
            active.push((step.clone(), info));
        }

        let mut stopped = Vec::new();
        for (step, info) in active {
            if let Some(info) = info {
                if let Some(main) = &info.main_task {
                    if let Err(e) = self.backend.cancel(main).await {
                        tracing::warn!(step = %step.label(), "Could not cancel {}: {}", main, e);
                    }
                }

                for handle in &info.subtasks {
                    // Cancelled when the backend cannot tell either
                    if self.query_running(&step, handle).await == Some(false) {
                        continue;
                    }
                    self.cancel_subtask(&step, handle).await?;
                }
            }

            self.mark_failed(&step);
            tracing::info!(step = %step.label(), "Stopped");
            stopped.push(step.label().to_string());
        }

        Ok(stopped)
    }
}
