// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Slurm backend
//!
//! One batch job per task, submitted with `sbatch --parsable --wrap`.
//! Dependencies use `afterok`, so a job whose dependency failed never
//! starts. Main tasks with a time limit ask Slurm for `SIGUSR1` shortly
//! before the limit, which they treat as a resubmission request.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;

use super::backend::{require_tools, Backend, TaskExit, TaskSignal};
use super::{RunnerKind, TaskHandle, TaskRequest};
use crate::errors::{PipestepError, PipestepResult};
use crate::step::entry::shell_quote;

const DEFAULT_SIGNAL_LEAD_SECS: u64 = 300;

/// Scheduler states in which a job is still queued or running
const ACTIVE_STATES: &[&str] = &[
    "PENDING",
    "CONFIGURING",
    "RUNNING",
    "COMPLETING",
    "SUSPENDED",
    "REQUEUED",
    "REQUEUE_HOLD",
    "RESIZING",
    "SIGNALING",
    "STAGE_OUT",
];

fn default_signal_lead() -> u64 {
    DEFAULT_SIGNAL_LEAD_SECS
}

/// Slurm-specific runner parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlurmParams {
    /// Default partition, when the step does not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,

    /// Default account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Extra `sbatch` arguments, passed verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    /// Seconds before the time limit at which main tasks get `SIGUSR1`
    #[serde(default = "default_signal_lead")]
    pub signal_lead_secs: u64,
}

impl Default for SlurmParams {
    fn default() -> Self {
        Self {
            partition: None,
            account: None,
            extra_args: Vec::new(),
            signal_lead_secs: DEFAULT_SIGNAL_LEAD_SECS,
        }
    }
}

/// Slurm batch jobs
pub struct SlurmBackend {
    params: SlurmParams,
    poll_interval: Duration,
}

impl SlurmBackend {
    pub fn new(params: SlurmParams, poll_interval: Duration) -> Self {
        Self {
            params,
            poll_interval,
        }
    }

    /// Arguments of the `sbatch` call for a request
    pub fn sbatch_args(&self, request: &TaskRequest) -> Vec<String> {
        let resources = &request.resources;
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", request.job_name()),
            format!("--cpus-per-task={}", resources.cpus()),
        ];

        if resources.gpus() > 0 {
            args.push(format!("--gres=gpu:{}", resources.gpus()));
        }
        if let Some(mem) = &resources.mem {
            args.push(format!("--mem={}", mem));
        }
        if let Some(limit) = &resources.time_limit {
            args.push(format!("--time={}", limit));
            if request.is_main() {
                args.push(format!("--signal=B:USR1@{}", self.params.signal_lead_secs));
            }
        }
        if let Some(partition) = resources.partition.as_ref().or(self.params.partition.as_ref()) {
            args.push(format!("--partition={}", partition));
        }
        if let Some(account) = resources.account.as_ref().or(self.params.account.as_ref()) {
            args.push(format!("--account={}", account));
        }
        if !request.dependencies.is_empty() {
            let ids: Vec<&str> = request.dependencies.iter().map(|h| h.id.as_str()).collect();
            args.push(format!("--dependency=afterok:{}", ids.join(":")));
            args.push("--kill-on-invalid-dep=yes".to_string());
        }

        args.extend(self.params.extra_args.iter().cloned());

        let exports: Vec<String> = resources
            .to_env()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        args.push(format!("--export=ALL,{}", exports.join(",")));

        args.push(format!("--chdir={}", request.workdir.display()));
        args.push(format!("--output={}", request.stdout.display()));
        args.push(format!("--error={}", request.stderr.display()));
        args.push("--open-mode=append".to_string());

        let command: Vec<String> = request.command.iter().map(|a| shell_quote(a)).collect();
        args.push("--wrap".to_string());
        args.push(format!("exec {}", command.join(" ")));
        args
    }

    async fn run(&self, program: &str, args: &[String]) -> PipestepResult<String> {
        let output = Command::new(program).args(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipestepError::backend_unavailable(program)
            } else {
                PipestepError::backend(RunnerKind::Slurm, format!("{}: {}", program, e))
            }
        })?;

        if !output.status.success() {
            return Err(PipestepError::backend(
                RunnerKind::Slurm,
                format!(
                    "{} failed: {}",
                    program,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Scheduler state of a job, `None` once it left the queue
    async fn job_state(&self, id: &str) -> PipestepResult<Option<String>> {
        let args = ["-h", "-j", id, "-o", "%T"].map(String::from);
        match self.run("squeue", &args).await {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)),
            // squeue rejects ids that already left the queue
            Err(PipestepError::BackendSubmissionFailure { message, .. })
                if message.contains("Invalid job id") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn accounting(&self, id: &str) -> PipestepResult<TaskExit> {
        let args = ["-n", "-P", "-X", "-j", id, "-o", "State,ExitCode"].map(String::from);
        let out = match self.run("sacct", &args).await {
            Ok(out) => out,
            Err(e) => return Ok(TaskExit::unknown(format!("sacct unavailable: {}", e))),
        };
        Ok(parse_sacct(&out).unwrap_or_else(|| TaskExit::unknown("no accounting record")))
    }
}

/// Parse `State|ExitCode` lines, e.g. `FAILED|1:0`
pub fn parse_sacct(output: &str) -> Option<TaskExit> {
    let re = Regex::new(r"^(?P<state>[A-Z_]+)(?: by \d+)?\|(?P<code>\d+):(?P<signal>\d+)$").ok()?;

    let caps = output.lines().map(str::trim).find_map(|l| re.captures(l))?;
    let state = &caps["state"];
    let code: i32 = caps["code"].parse().ok()?;
    let signal: i32 = caps["signal"].parse().ok()?;

    let exit = match state {
        "COMPLETED" => TaskExit::code(code),
        _ if signal > 0 => TaskExit::code(128 + signal).with_detail(state.to_string()),
        _ if code == 0 => TaskExit::code(1).with_detail(state.to_string()),
        _ => TaskExit::code(code).with_detail(state.to_string()),
    };
    Some(exit)
}

#[async_trait]
impl Backend for SlurmBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Slurm
    }

    async fn submit(&self, request: TaskRequest) -> PipestepResult<TaskHandle> {
        let out = self.run("sbatch", &self.sbatch_args(&request)).await?;
        let id = out
            .trim()
            .split(';')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                PipestepError::backend(RunnerKind::Slurm, format!("unexpected sbatch output '{}'", out))
            })?
            .to_string();

        tracing::debug!("Submitted Slurm job {} for {}", id, request.job_name());
        Ok(TaskHandle {
            id,
            target: request.target,
        })
    }

    async fn signal(&self, handle: &TaskHandle, signal: TaskSignal) -> PipestepResult<()> {
        let state = self.job_state(&handle.id).await?;
        match (signal, state.as_deref()) {
            (_, None) => Ok(()),
            (TaskSignal::Terminate, _) => {
                self.run("scancel", &[handle.id.clone()]).await?;
                Ok(())
            }
            (_, Some("PENDING")) => Err(PipestepError::backend(
                RunnerKind::Slurm,
                format!("job {} has not started", handle.id),
            )),
            _ => {
                let args = [
                    "--batch".to_string(),
                    format!("--signal={}", signal.name()),
                    handle.id.clone(),
                ];
                self.run("scancel", &args).await?;
                Ok(())
            }
        }
    }

    async fn wait_one(&self, handle: &TaskHandle) -> PipestepResult<TaskExit> {
        while self.is_running(handle).await? {
            tokio::time::sleep(self.poll_interval).await;
        }
        self.accounting(&handle.id).await
    }

    async fn is_running(&self, handle: &TaskHandle) -> PipestepResult<bool> {
        Ok(self
            .job_state(&handle.id)
            .await?
            .is_some_and(|state| ACTIVE_STATES.contains(&state.as_str())))
    }

    async fn modify_dependency(
        &self,
        handle: &TaskHandle,
        dependencies: &[TaskHandle],
    ) -> PipestepResult<bool> {
        let ids: Vec<&str> = dependencies.iter().map(|h| h.id.as_str()).collect();
        let dependency = if ids.is_empty() {
            String::new()
        } else {
            format!("afterok:{}", ids.join(":"))
        };

        let args = [
            "update".to_string(),
            format!("JobId={}", handle.id),
            format!("Dependency={}", dependency),
        ];
        self.run("scontrol", &args).await?;
        Ok(true)
    }

    async fn check_available(&self) -> PipestepResult<bool> {
        require_tools(&["sbatch", "squeue", "scancel", "scontrol", "sacct"])
    }
}
