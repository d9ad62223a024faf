// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Steps
//!
//! A step is one node of the pipeline DAG. It owns the directory
//! `<pipeline>/<label>/`:
//!
//! ```text
//! <label>/
//! ├── output/             target files
//! ├── logs/               stdout/stderr of every task
//! ├── temp/               scratch space, wiped once the step is done
//! ├── params.yaml         kind, parameters, resources and fingerprint
//! ├── dependencies.yaml   dependency name -> step label
//! └── step.sh             entry point used by every backend
//! ```
//!
//! The existence of a target file is the only proof that it was computed.
//! Every failure path that may leave a partial file deletes it first.

mod commands;
pub mod entry;
mod kind;
mod main_task;
mod resources;
mod shell;
mod state;

pub use commands::{CommandInbox, StepCommand};
pub use kind::{DependencyOutput, KindFactory, KindRegistry, StepContext, StepKind};
pub use main_task::{MainTask, MainTaskOutcome};
pub use resources::{ResourceSpec, ENV_PREFIX};
pub use shell::{ShellKind, ShellParams};
pub use state::StepState;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{PipestepError, PipestepResult};
use crate::runner::SubmissionInfo;
use crate::store::{FilesystemStore, StateStore};

const OUTPUT_DIR: &str = "output";
const LOGS_DIR: &str = "logs";
const TEMP_DIR: &str = "temp";
const PARAMS_FILE: &str = "params.yaml";
const DEPENDENCIES_FILE: &str = "dependencies.yaml";

/// Parameters persisted at initialization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub kind: String,
    pub params: serde_yaml::Value,
    pub resources: ResourceSpec,
    pub fingerprint: String,
}

/// A node of the pipeline DAG
pub struct Step {
    label: String,
    kind_name: String,
    kind: Arc<dyn StepKind>,
    pipeline_dir: PathBuf,
    dir: PathBuf,
    dependencies: BTreeMap<String, Arc<Step>>,
    resources: ResourceSpec,
    store: Arc<dyn StateStore>,
    launcher: PathBuf,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("label", &self.label)
            .field("kind", &self.kind_name)
            .field("dir", &self.dir)
            .field(
                "dependencies",
                &self
                    .dependencies
                    .iter()
                    .map(|(name, dep)| (name.as_str(), dep.label.as_str()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`Step`]
pub struct StepBuilder {
    label: String,
    kind_name: String,
    kind: Arc<dyn StepKind>,
    pipeline_dir: PathBuf,
    dependencies: BTreeMap<String, Arc<Step>>,
    resources: ResourceSpec,
    store: Option<Arc<dyn StateStore>>,
    launcher: Option<PathBuf>,
}

impl StepBuilder {
    /// Add a dependency under a name the kind can look up
    pub fn dependency(mut self, name: impl Into<String>, step: Arc<Step>) -> Self {
        self.dependencies.insert(name.into(), step);
        self
    }

    /// Override part of the kind's default resources
    pub fn resources(mut self, overrides: &ResourceSpec) -> Self {
        self.resources = self.resources.overlay(overrides);
        self
    }

    /// Use a specific state store
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Program the entry point execs
    pub fn launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    pub fn build(self) -> Step {
        let dir = self.pipeline_dir.join(&self.label);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FilesystemStore::new(&self.pipeline_dir)));

        Step {
            label: self.label,
            kind_name: self.kind_name,
            kind: self.kind,
            pipeline_dir: self.pipeline_dir,
            dir,
            dependencies: self.dependencies,
            resources: self.resources,
            store,
            launcher: self.launcher.unwrap_or_else(default_launcher),
        }
    }
}

/// Path of the running `pipestep` executable
pub fn default_launcher() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("pipestep"))
}

impl Step {
    /// Start building a step living in `<pipeline_dir>/<label>`
    pub fn builder(
        label: impl Into<String>,
        kind_name: impl Into<String>,
        kind: Arc<dyn StepKind>,
        pipeline_dir: impl Into<PathBuf>,
    ) -> StepBuilder {
        let resources = kind.default_resources();
        StepBuilder {
            label: label.into(),
            kind_name: kind_name.into(),
            kind,
            pipeline_dir: pipeline_dir.into(),
            dependencies: BTreeMap::new(),
            resources,
            store: None,
            launcher: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind_name(&self) -> &str {
        &self.kind_name
    }

    pub fn kind(&self) -> &Arc<dyn StepKind> {
        &self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pipeline_dir(&self) -> &Path {
        &self.pipeline_dir
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join(OUTPUT_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join(LOGS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.join(TEMP_DIR)
    }

    pub fn entry_point(&self) -> PathBuf {
        self.dir.join(entry::ENTRY_POINT)
    }

    pub fn dependencies(&self) -> &BTreeMap<String, Arc<Step>> {
        &self.dependencies
    }

    /// Effective resources: kind defaults overlaid with pipeline overrides
    pub fn resources(&self) -> &ResourceSpec {
        &self.resources
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────

    /// Persisted state, `None` when the step was never created
    pub fn state(&self) -> PipestepResult<Option<StepState>> {
        self.store.load_state(&self.label)
    }

    /// Move to a new state, rejecting transitions outside the lattice
    pub fn set_state(&self, to: StepState) -> PipestepResult<()> {
        let from = self.state()?;
        if !StepState::can_transition(from, to) {
            return Err(PipestepError::transition(&self.label, from, to));
        }

        self.store.save_state(&self.label, to)?;
        tracing::debug!(step = %self.label, "State {:?} -> {}", from, to);
        Ok(())
    }

    /// Persisted submission record
    pub fn submission(&self) -> PipestepResult<Option<SubmissionInfo>> {
        self.store.load_submission(&self.label)
    }

    pub fn save_submission(&self, info: &SubmissionInfo) -> PipestepResult<()> {
        self.store.save_submission(&self.label, info)
    }

    /// Read-modify-write the submission record
    ///
    /// The main task and the submitting process both write the record; each
    /// only touches its own fields.
    pub fn update_submission(
        &self,
        update: impl FnOnce(&mut SubmissionInfo),
    ) -> PipestepResult<SubmissionInfo> {
        let mut info = self
            .submission()?
            .ok_or_else(|| PipestepError::NotFound {
                what: format!("Submission record of step '{}'", self.label),
                path: self.dir.clone(),
            })?;
        update(&mut info);
        self.save_submission(&info)?;
        Ok(info)
    }

    /// Queue a command for the running main task
    pub fn send_command(&self, command: StepCommand) -> PipestepResult<()> {
        tracing::debug!(step = %self.label, "Queueing command: {}", command);
        self.store.push_command(&self.label, command)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Targets
    // ─────────────────────────────────────────────────────────────────────

    /// Context handed to the kind
    pub fn context(&self) -> PipestepResult<StepContext> {
        let mut dependencies = BTreeMap::new();
        for (name, dep) in &self.dependencies {
            dependencies.insert(
                name.clone(),
                DependencyOutput {
                    label: dep.label.clone(),
                    output_dir: dep.output_dir(),
                    targets: dep.targets()?,
                },
            );
        }

        Ok(StepContext {
            label: self.label.clone(),
            output_dir: self.output_dir(),
            temp_dir: self.temp_dir(),
            logs_dir: self.logs_dir(),
            dependencies,
            resources: self.resources.clone(),
        })
    }

    /// Absolute paths of the declared target files
    pub fn targets(&self) -> PipestepResult<Vec<PathBuf>> {
        let ctx = self.context()?;
        let output = self.output_dir();
        Ok(self
            .kind
            .targets(&ctx)?
            .into_iter()
            .map(|name| output.join(name))
            .collect())
    }

    /// Declared targets that do not exist yet
    pub fn missing_targets(&self) -> PipestepResult<Vec<PathBuf>> {
        Ok(self
            .targets()?
            .into_iter()
            .filter(|target| !target.exists())
            .collect())
    }

    /// Map a target argument (absolute or relative to `output/`) to a declared target
    pub fn resolve_target(&self, target: &Path) -> PipestepResult<PathBuf> {
        let candidate = if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.output_dir().join(target)
        };

        if self.targets()?.contains(&candidate) {
            Ok(candidate)
        } else {
            Err(PipestepError::UnknownTarget {
                step: self.label.clone(),
                target: target.display().to_string(),
            })
        }
    }

    /// Delete a target file, if present
    pub fn remove_target(&self, target: &Path) -> PipestepResult<()> {
        match std::fs::remove_file(target) {
            Ok(()) => {
                tracing::debug!(step = %self.label, "Removed {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipestepError::io_at(target, e)),
        }
    }

    /// Delete every existing target file
    pub fn remove_targets(&self) -> PipestepResult<usize> {
        let mut removed = 0;
        for target in self.targets()? {
            if target.exists() {
                self.remove_target(&target)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn clear_temp(&self) -> PipestepResult<()> {
        let temp = self.temp_dir();
        if temp.exists() {
            std::fs::remove_dir_all(&temp).map_err(|e| PipestepError::io_at(&temp, e))?;
        }
        std::fs::create_dir_all(&temp).map_err(|e| PipestepError::io_at(&temp, e))
    }

    /// Prepare a failed step for another attempt
    ///
    /// Clears the scratch space and, unless `keep_finished`, every target.
    pub fn clean(&self, keep_finished: bool) -> PipestepResult<()> {
        self.clear_temp()?;
        if !keep_finished {
            let removed = self.remove_targets()?;
            if removed > 0 {
                tracing::info!(step = %self.label, "Removed {} finished target(s)", removed);
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────

    /// Fingerprint of everything that defines the step's output
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.kind_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(
            serde_yaml::to_string(&self.kind.params())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(&[0]);
        hasher.update(
            serde_yaml::to_string(&self.resources)
                .unwrap_or_default()
                .as_bytes(),
        );
        for (name, dep) in &self.dependencies {
            hasher.update(&[0]);
            hasher.update(name.as_bytes());
            hasher.update(&[b'=']);
            hasher.update(dep.label.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    fn record(&self) -> StepRecord {
        StepRecord {
            kind: self.kind_name.clone(),
            params: self.kind.params(),
            resources: self.resources.clone(),
            fingerprint: self.fingerprint(),
        }
    }

    /// Parameters saved at initialization
    pub fn saved_record(&self) -> PipestepResult<Option<StepRecord>> {
        let path = self.dir.join(PARAMS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipestepError::io_at(&path, e)),
        }
    }

    /// Create the step and, recursively, its dependencies
    ///
    /// A no-op when the step is already `INITED`. A step left in
    /// `INIT_INCOMPLETE` by an interrupted run is wiped and recreated.
    pub fn init(&self) -> PipestepResult<()> {
        self.init_guarded(&mut Vec::new(), false)
    }

    fn init_guarded(&self, visiting: &mut Vec<String>, as_dependency: bool) -> PipestepResult<()> {
        if let Some(pos) = visiting.iter().position(|label| label == &self.label) {
            let mut steps = visiting[pos..].to_vec();
            steps.push(self.label.clone());
            return Err(PipestepError::DependencyCycle { steps });
        }

        match self.state()? {
            None => {}
            Some(StepState::InitIncomplete) => {
                tracing::warn!(
                    step = %self.label,
                    "Previous initialization was interrupted, recreating {}",
                    self.dir.display()
                );
                self.wipe()?;
            }
            Some(StepState::Inited) => {
                self.check_fingerprint()?;
                return Ok(());
            }
            // Dependencies that already moved on were initialized earlier
            Some(_) if as_dependency => return Ok(()),
            Some(state) => {
                return Err(PipestepError::transition(
                    &self.label,
                    Some(state),
                    StepState::InitIncomplete,
                ))
            }
        }

        for dir in [self.output_dir(), self.logs_dir(), self.temp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| PipestepError::io_at(&dir, e))?;
        }
        self.set_state(StepState::InitIncomplete)?;

        visiting.push(self.label.clone());
        for dep in self.dependencies.values() {
            dep.init_guarded(visiting, true)?;
        }
        visiting.pop();

        let params = serde_yaml::to_string(&self.record())?;
        let params_path = self.dir.join(PARAMS_FILE);
        std::fs::write(&params_path, params).map_err(|e| PipestepError::io_at(&params_path, e))?;

        let dependencies: BTreeMap<&str, &str> = self
            .dependencies
            .iter()
            .map(|(name, dep)| (name.as_str(), dep.label.as_str()))
            .collect();
        let deps_path = self.dir.join(DEPENDENCIES_FILE);
        std::fs::write(&deps_path, serde_yaml::to_string(&dependencies)?)
            .map_err(|e| PipestepError::io_at(&deps_path, e))?;

        let script = entry::render(&self.launcher, &self.pipeline_dir, &self.label);
        entry::write(&self.dir, &script)?;

        self.set_state(StepState::Inited)?;
        tracing::info!(step = %self.label, "Initialized {}", self.dir.display());
        Ok(())
    }

    fn check_fingerprint(&self) -> PipestepResult<()> {
        if let Some(saved) = self.saved_record()? {
            if saved.fingerprint != self.fingerprint() {
                tracing::warn!(
                    step = %self.label,
                    "Parameters changed since initialization; the saved ones stay in effect"
                );
            }
        }
        Ok(())
    }

    fn wipe(&self) -> PipestepResult<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(|e| PipestepError::io_at(&self.dir, e))?;
        }
        self.store.clear(&self.label)
    }

    /// This step and its transitive dependencies, dependencies first
    pub fn closure(self: &Arc<Self>) -> Vec<Arc<Step>> {
        fn visit(step: &Arc<Step>, seen: &mut HashSet<String>, order: &mut Vec<Arc<Step>>) {
            if !seen.insert(step.label.clone()) {
                return;
            }
            for dep in step.dependencies.values() {
                visit(dep, seen, order);
            }
            order.push(step.clone());
        }

        let mut order = Vec::new();
        visit(self, &mut HashSet::new(), &mut order);
        order
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subtasks
    // ─────────────────────────────────────────────────────────────────────

    /// Compute a single target
    pub async fn run_subtask(&self, target: &Path) -> PipestepResult<()> {
        self.run_subtask_until(target, std::future::pending()).await
    }

    /// Compute a single target, abandoning it when `interrupt` completes
    ///
    /// Whatever the kind wrote is deleted on failure or interruption.
    pub async fn run_subtask_until<F>(&self, target: &Path, interrupt: F) -> PipestepResult<()>
    where
        F: Future<Output = ()>,
    {
        let target = self.resolve_target(target)?;
        let ctx = self.context()?;
        tracing::info!(step = %self.label, target = %target.display(), "Computing target");

        let result = tokio::select! {
            result = self.kind.compute(&ctx, &target) => result,
            () = interrupt => Err(PipestepError::Terminated { step: self.label.clone() }),
        };

        let message = match result {
            Ok(()) if target.exists() => return Ok(()),
            Ok(()) => "compute finished without writing the target".to_string(),
            Err(e) => e.to_string(),
        };

        self.remove_target(&target)?;
        Err(PipestepError::SubtaskExecutionFailure {
            step: self.label.clone(),
            target,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::echo_step;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a", "b"], vec![]);

        step.init().unwrap();

        assert_eq!(step.state().unwrap(), Some(StepState::Inited));
        for dir in ["output", "logs", "temp"] {
            assert!(step.dir().join(dir).is_dir());
        }
        assert!(step.entry_point().exists());

        let record = step.saved_record().unwrap().unwrap();
        assert_eq!(record.kind, "echo");
        assert_eq!(record.fingerprint, step.fingerprint());
    }

    #[test]
    fn test_init_is_noop_when_inited() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a"], vec![]);

        step.init().unwrap();
        let params = std::fs::read(step.dir().join(PARAMS_FILE)).unwrap();
        let entry = std::fs::read(step.entry_point()).unwrap();

        step.init().unwrap();
        assert_eq!(step.state().unwrap(), Some(StepState::Inited));
        assert_eq!(std::fs::read(step.dir().join(PARAMS_FILE)).unwrap(), params);
        assert_eq!(std::fs::read(step.entry_point()).unwrap(), entry);
    }

    #[test]
    fn test_init_recreates_incomplete_step() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a"], vec![]);

        std::fs::create_dir_all(step.output_dir()).unwrap();
        std::fs::write(step.output_dir().join("a"), "half").unwrap();
        store.save_state("clean", StepState::InitIncomplete).unwrap();

        step.init().unwrap();
        assert_eq!(step.state().unwrap(), Some(StepState::Inited));
        assert!(!step.output_dir().join("a").exists());
        assert!(step.dir().join(PARAMS_FILE).exists());
    }

    #[test]
    fn test_init_initializes_dependencies() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let raw = Arc::new(echo_step(temp_dir.path(), &store, "raw", &["a"], vec![]));
        let clean = echo_step(
            temp_dir.path(),
            &store,
            "clean",
            &["a"],
            vec![("corpus", raw.clone())],
        );

        clean.init().unwrap();
        assert_eq!(raw.state().unwrap(), Some(StepState::Inited));

        let deps = std::fs::read_to_string(clean.dir().join(DEPENDENCIES_FILE)).unwrap();
        assert_eq!(deps.trim(), "corpus: raw");
    }

    #[test]
    fn test_init_rejects_submitted_step() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a"], vec![]);
        store.save_state("clean", StepState::Submitted).unwrap();

        assert!(matches!(
            step.init(),
            Err(PipestepError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_set_state_enforces_lattice() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a"], vec![]);
        step.init().unwrap();

        assert!(step.set_state(StepState::Running).is_err());
        step.set_state(StepState::Submitted).unwrap();
        step.set_state(StepState::Running).unwrap();
        step.set_state(StepState::Done).unwrap();
        assert!(step.set_state(StepState::Submitted).is_err());
    }

    #[tokio::test]
    async fn test_failed_subtask_removes_partial_target() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = crate::testing::echo_step_failing(temp_dir.path(), &store, "clean", &["a", "b"], "b");
        step.init().unwrap();

        step.run_subtask(Path::new("a")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(step.output_dir().join("a")).unwrap(),
            "clean:a\n"
        );

        let err = step.run_subtask(Path::new("b")).await.unwrap_err();
        assert!(matches!(err, PipestepError::SubtaskExecutionFailure { .. }));
        assert!(!step.output_dir().join("b").exists());
    }

    #[tokio::test]
    async fn test_run_subtask_rejects_unknown_target() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a"], vec![]);
        step.init().unwrap();

        assert!(matches!(
            step.run_subtask(Path::new("zzz")).await,
            Err(PipestepError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_clean_keeps_or_removes_targets() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let step = echo_step(temp_dir.path(), &store, "clean", &["a"], vec![]);
        step.init().unwrap();

        std::fs::write(step.output_dir().join("a"), "clean:a\n").unwrap();
        std::fs::write(step.temp_dir().join("scratch"), "x").unwrap();

        step.clean(true).unwrap();
        assert!(step.output_dir().join("a").exists());
        assert!(!step.temp_dir().join("scratch").exists());

        step.clean(false).unwrap();
        assert!(!step.output_dir().join("a").exists());
    }

    #[test]
    fn test_closure_orders_dependencies_first() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let raw = Arc::new(echo_step(temp_dir.path(), &store, "raw", &["a"], vec![]));
        let vocab = Arc::new(echo_step(
            temp_dir.path(),
            &store,
            "vocab",
            &["v"],
            vec![("corpus", raw.clone())],
        ));
        let train = Arc::new(echo_step(
            temp_dir.path(),
            &store,
            "train",
            &["m"],
            vec![("corpus", raw), ("vocab", vocab)],
        ));

        let labels: Vec<_> = train.closure().iter().map(|s| s.label().to_string()).collect();
        assert_eq!(labels, vec!["raw", "vocab", "train"]);
    }
}
