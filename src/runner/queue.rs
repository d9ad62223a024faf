// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! HyperQueue backend
//!
//! All tasks of a pipeline go into one open HyperQueue job, so dependencies
//! are task-to-task edges inside that job. A handle id is `<job>.<task>`.
//! HyperQueue can neither signal a task nor change its dependencies: the
//! runner falls back to the control record for resubmission and only warns
//! when dependants cannot be repointed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use super::backend::{require_tools, Backend, TaskExit, TaskSignal};
use super::{RunnerKind, TaskHandle, TaskRequest};
use crate::errors::{PipestepError, PipestepResult};
use crate::store::write_atomic;

/// HyperQueue-specific runner parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueParams {
    /// Open job the pipeline's tasks are added to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<u64>,

    /// Server directory, when not the HyperQueue default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_dir: Option<PathBuf>,
}

/// Task states reported by `hq`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueTaskState {
    Waiting,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl QueueTaskState {
    fn parse(state: &str) -> Option<Self> {
        match state.to_ascii_lowercase().as_str() {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Tasks inside one open HyperQueue job
pub struct QueueBackend {
    params: QueueParams,
    job: u64,
    state_dir: PathBuf,
    poll_interval: Duration,
}

impl QueueBackend {
    /// Attach to the job in `params`, opening a new one if there is none
    pub async fn connect(
        params: QueueParams,
        pipeline_dir: &Path,
        poll_interval: Duration,
    ) -> PipestepResult<Self> {
        let state_dir = pipeline_dir.join(".runner").join("queue");
        let mut backend = Self {
            params,
            job: 0,
            state_dir,
            poll_interval,
        };

        backend.job = match backend.params.job {
            Some(job) => job,
            None => {
                let out = backend.hq(&["job".into(), "open".into()]).await?;
                let job = parse_job_id(&out).ok_or_else(|| {
                    PipestepError::backend(
                        RunnerKind::Queue,
                        format!("unexpected 'hq job open' output: {}", out.trim()),
                    )
                })?;
                tracing::info!("Opened HyperQueue job {}", job);
                job
            }
        };
        backend.params.job = Some(backend.job);
        Ok(backend)
    }

    pub fn params(&self) -> &QueueParams {
        &self.params
    }

    pub fn job(&self) -> u64 {
        self.job
    }

    async fn hq(&self, args: &[String]) -> PipestepResult<String> {
        let mut command = Command::new("hq");
        if let Some(dir) = &self.params.server_dir {
            command.arg("--server-dir").arg(dir);
        }

        let output = command.args(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipestepError::backend_unavailable("hq")
            } else {
                PipestepError::backend(RunnerKind::Queue, format!("hq: {}", e))
            }
        })?;

        if !output.status.success() {
            return Err(PipestepError::backend(
                RunnerKind::Queue,
                format!(
                    "hq {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Allocate the next task id of the job
    fn next_task(&self) -> PipestepResult<u64> {
        let path = self.state_dir.join(format!("job-{}.next", self.job));
        let current = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        write_atomic(&path, &format!("{}\n", current + 1))?;
        Ok(current)
    }

    fn task_id(&self, handle: &TaskHandle) -> PipestepResult<u64> {
        handle
            .id
            .split_once('.')
            .and_then(|(_, task)| task.parse().ok())
            .ok_or_else(|| {
                PipestepError::backend(RunnerKind::Queue, format!("malformed handle {}", handle))
            })
    }

    async fn task_state(&self, handle: &TaskHandle) -> PipestepResult<QueueTaskState> {
        let task = self.task_id(handle)?;
        let out = self
            .hq(&[
                "--output-mode".into(),
                "json".into(),
                "task".into(),
                "info".into(),
                self.job.to_string(),
                task.to_string(),
            ])
            .await?;

        let value: serde_json::Value = serde_json::from_str(&out)?;
        find_state(&value).ok_or_else(|| {
            PipestepError::backend(RunnerKind::Queue, format!("no state for task {}", handle))
        })
    }
}

/// First number in `hq job open` output
fn parse_job_id(output: &str) -> Option<u64> {
    output
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// First `state` field anywhere in `hq` JSON output
fn find_state(value: &serde_json::Value) -> Option<QueueTaskState> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(state) = map.get("state") {
                let name = match state {
                    serde_json::Value::String(s) => Some(s.as_str()),
                    serde_json::Value::Object(inner) => inner.keys().next().map(String::as_str),
                    _ => None,
                };
                if let Some(state) = name.and_then(QueueTaskState::parse) {
                    return Some(state);
                }
            }
            map.values().find_map(find_state)
        }
        serde_json::Value::Array(items) => items.iter().find_map(find_state),
        _ => None,
    }
}

/// `hq job submit-file` document
#[derive(Debug, Serialize)]
struct JobFile {
    name: String,
    task: Vec<JobTask>,
}

#[derive(Debug, Serialize)]
struct JobTask {
    id: u64,
    command: Vec<String>,
    cwd: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    deps: Vec<u64>,
    env: BTreeMap<String, String>,
    request: Vec<JobRequest>,
}

#[derive(Debug, Serialize)]
struct JobRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    time_limit: Option<String>,
    resources: JobResources,
}

/// Resource amounts are strings in HyperQueue job files
#[derive(Debug, Serialize)]
struct JobResources {
    cpus: String,
    #[serde(rename = "gpus/nvidia", skip_serializing_if = "Option::is_none")]
    gpus: Option<String>,
}

/// Task id of a dependency, which must live in `job`
fn dependency_task(job: u64, handle: &TaskHandle) -> PipestepResult<u64> {
    let parsed = handle
        .id
        .split_once('.')
        .and_then(|(j, t)| Some((j.parse::<u64>().ok()?, t.parse::<u64>().ok()?)));

    match parsed {
        Some((owner, task)) if owner == job => Ok(task),
        Some((owner, _)) => Err(PipestepError::backend(
            RunnerKind::Queue,
            format!(
                "dependency {} belongs to HyperQueue job {}, not {}",
                handle, owner, job
            ),
        )),
        None => Err(PipestepError::backend(
            RunnerKind::Queue,
            format!("malformed dependency handle {}", handle),
        )),
    }
}

/// Job file with a single task of `job`
fn job_file(job: u64, task: u64, request: &TaskRequest) -> PipestepResult<String> {
    let deps = request
        .dependencies
        .iter()
        .map(|h| dependency_task(job, h))
        .collect::<PipestepResult<Vec<_>>>()?;

    let resources = &request.resources;
    let file = JobFile {
        name: request.job_name(),
        task: vec![JobTask {
            id: task,
            command: request.command.clone(),
            cwd: request.workdir.clone(),
            stdout: request.stdout.clone(),
            stderr: request.stderr.clone(),
            deps,
            env: resources.to_env(),
            request: vec![JobRequest {
                time_limit: resources.time_limit.clone(),
                resources: JobResources {
                    cpus: resources.cpus().to_string(),
                    gpus: (resources.gpus() > 0).then(|| resources.gpus().to_string()),
                },
            }],
        }],
    };

    Ok(toml::to_string(&file)?)
}

#[async_trait]
impl Backend for QueueBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Queue
    }

    async fn submit(&self, request: TaskRequest) -> PipestepResult<TaskHandle> {
        let task = self.next_task()?;
        let file = self.state_dir.join(format!("job-{}-task-{}.toml", self.job, task));
        write_atomic(&file, &job_file(self.job, task, &request)?)?;

        self.hq(&[
            "job".into(),
            "submit-file".into(),
            "--job".into(),
            self.job.to_string(),
            file.to_string_lossy().to_string(),
        ])
        .await?;

        tracing::debug!("Submitted HyperQueue task {}.{} for {}", self.job, task, request.job_name());
        Ok(TaskHandle {
            id: format!("{}.{}", self.job, task),
            target: request.target,
        })
    }

    async fn signal(&self, handle: &TaskHandle, signal: TaskSignal) -> PipestepResult<()> {
        match signal {
            TaskSignal::Terminate => {
                let task = self.task_id(handle)?;
                self.hq(&[
                    "task".into(),
                    "cancel".into(),
                    self.job.to_string(),
                    task.to_string(),
                ])
                .await?;
                Ok(())
            }
            _ => Err(PipestepError::backend(
                RunnerKind::Queue,
                "HyperQueue cannot deliver signals to tasks",
            )),
        }
    }

    async fn wait_one(&self, handle: &TaskHandle) -> PipestepResult<TaskExit> {
        loop {
            match self.task_state(handle).await? {
                QueueTaskState::Waiting | QueueTaskState::Running => {
                    tokio::time::sleep(self.poll_interval).await
                }
                QueueTaskState::Finished => return Ok(TaskExit::success()),
                QueueTaskState::Failed => return Ok(TaskExit::code(1).with_detail("failed")),
                QueueTaskState::Canceled => return Ok(TaskExit::code(143).with_detail("canceled")),
            }
        }
    }

    async fn is_running(&self, handle: &TaskHandle) -> PipestepResult<bool> {
        Ok(matches!(
            self.task_state(handle).await?,
            QueueTaskState::Waiting | QueueTaskState::Running
        ))
    }

    async fn modify_dependency(
        &self,
        _handle: &TaskHandle,
        _dependencies: &[TaskHandle],
    ) -> PipestepResult<bool> {
        Ok(false)
    }

    async fn check_available(&self) -> PipestepResult<bool> {
        require_tools(&["hq"])
    }
}
