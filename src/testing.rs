// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Deterministic step kinds and builders for tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{PipestepError, PipestepResult};
use crate::pipeline::{Pipeline, PipelineGraph, PipelineSpec};
use crate::runner::SubmissionInfo;
use crate::step::{KindRegistry, Step, StepCommand, StepContext, StepKind, StepState};
use crate::store::{MemoryStore, StateStore};

pub(crate) const LAUNCHER: &str = "/usr/bin/pipestep";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct EchoParams {
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on: Option<String>,
}

/// Writes `<label>:<name>` into each target once every dependency target exists
pub(crate) struct EchoKind {
    params: EchoParams,
}

impl EchoKind {
    pub fn new(targets: &[&str], fail_on: Option<&str>) -> Self {
        Self {
            params: EchoParams {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                fail_on: fail_on.map(String::from),
            },
        }
    }
}

#[async_trait]
impl StepKind for EchoKind {
    fn name(&self) -> &str {
        "echo"
    }

    fn targets(&self, _ctx: &StepContext) -> PipestepResult<Vec<String>> {
        Ok(self.params.targets.clone())
    }

    async fn compute(&self, ctx: &StepContext, target: &Path) -> PipestepResult<()> {
        for dep in ctx.dependencies.values() {
            if let Some(missing) = dep.targets.iter().find(|t| !t.exists()) {
                return Err(PipestepError::Io {
                    message: format!("dependency target {} is missing", missing.display()),
                });
            }
        }

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if self.params.fail_on.as_deref() == Some(name.as_str()) {
            std::fs::write(target, format!("{}:", ctx.label))?;
            return Err(PipestepError::Io {
                message: format!("failing on {}", name),
            });
        }

        std::fs::write(target, format!("{}:{}\n", ctx.label, name))?;
        Ok(())
    }

    fn params(&self) -> serde_yaml::Value {
        serde_yaml::to_value(&self.params).unwrap_or_default()
    }
}

/// Built-in kinds plus `echo`
pub(crate) fn registry() -> KindRegistry {
    let mut registry = KindRegistry::builtin();
    registry.register("echo", |label, params| {
        let params: EchoParams =
            serde_yaml::from_value(params.clone()).map_err(|e| PipestepError::InvalidParams {
                step: label.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(EchoKind { params }) as Arc<dyn StepKind>)
    });
    registry
}

pub(crate) fn echo_step(
    dir: &Path,
    store: &Arc<dyn StateStore>,
    label: &str,
    targets: &[&str],
    dependencies: Vec<(&str, Arc<Step>)>,
) -> Step {
    build_echo(dir, store, label, EchoKind::new(targets, None), dependencies)
}

pub(crate) fn echo_step_failing(
    dir: &Path,
    store: &Arc<dyn StateStore>,
    label: &str,
    targets: &[&str],
    fail_on: &str,
) -> Step {
    build_echo(dir, store, label, EchoKind::new(targets, Some(fail_on)), vec![])
}

fn build_echo(
    dir: &Path,
    store: &Arc<dyn StateStore>,
    label: &str,
    kind: EchoKind,
    dependencies: Vec<(&str, Arc<Step>)>,
) -> Step {
    let mut builder = Step::builder(label, "echo", Arc::new(kind), dir)
        .store(store.clone())
        .launcher(LAUNCHER);
    for (name, dep) in dependencies {
        builder = builder.dependency(name, dep);
    }
    builder.build()
}

/// Pipeline over an in-memory store
pub(crate) fn pipeline(dir: &Path, yaml: &str) -> Arc<Pipeline> {
    pipeline_with_store(dir, yaml, Arc::new(MemoryStore::new()))
}

pub(crate) fn pipeline_with_store(
    dir: &Path,
    yaml: &str,
    store: Arc<dyn StateStore>,
) -> Arc<Pipeline> {
    let spec = PipelineSpec::from_yaml(yaml).unwrap();
    let pipeline = PipelineGraph::new(&spec, &registry(), dir)
        .store(store)
        .launcher(LAUNCHER)
        .build()
        .unwrap();
    Arc::new(pipeline)
}

/// Memory store that queues a command once a step records its first subtask
///
/// Lets a test deliver a command while the main task has work in flight.
pub(crate) struct CommandOnSubtask {
    inner: MemoryStore,
    command: StepCommand,
    fired: AtomicBool,
}

impl CommandOnSubtask {
    pub fn new(command: StepCommand) -> Self {
        Self {
            inner: MemoryStore::new(),
            command,
            fired: AtomicBool::new(false),
        }
    }
}

impl StateStore for CommandOnSubtask {
    fn load_state(&self, step: &str) -> PipestepResult<Option<StepState>> {
        self.inner.load_state(step)
    }

    fn save_state(&self, step: &str, state: StepState) -> PipestepResult<()> {
        self.inner.save_state(step, state)
    }

    fn load_submission(&self, step: &str) -> PipestepResult<Option<SubmissionInfo>> {
        self.inner.load_submission(step)
    }

    fn save_submission(&self, step: &str, info: &SubmissionInfo) -> PipestepResult<()> {
        self.inner.save_submission(step, info)?;
        if !info.subtasks.is_empty() && !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.push_command(step, self.command)?;
        }
        Ok(())
    }

    fn clear_submission(&self, step: &str) -> PipestepResult<()> {
        self.inner.clear_submission(step)
    }

    fn push_command(&self, step: &str, command: StepCommand) -> PipestepResult<()> {
        self.inner.push_command(step, command)
    }

    fn take_command(&self, step: &str) -> PipestepResult<Option<StepCommand>> {
        self.inner.take_command(step)
    }

    fn clear(&self, step: &str) -> PipestepResult<()> {
        self.inner.clear(step)
    }
}
