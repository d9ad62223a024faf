// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Pipelines
//!
//! A pipeline is the declarative definition, the step objects built from it
//! and the directory every step lives in.

mod dag;
mod definition;
mod graph;
mod validation;

pub use dag::DagBuilder;
pub use definition::{PipelineSpec, StepSpec};
pub use graph::PipelineGraph;
pub use validation::{PipelineValidator, ValidationResult};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{PipestepError, PipestepResult};
use crate::step::{KindRegistry, Step, StepState};
use crate::store::{write_atomic, StateStore};

/// Copy of the definition kept in the pipeline directory
pub const DEFINITION_FILE: &str = "pipeline.yaml";

/// State of one step, for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub label: String,
    pub kind: String,
    pub state: Option<StepState>,
    pub is_target: bool,
}

/// A built pipeline
pub struct Pipeline {
    spec: PipelineSpec,
    dir: PathBuf,
    steps: BTreeMap<String, Arc<Step>>,
    targets: Vec<String>,
    store: Arc<dyn StateStore>,
}

impl Pipeline {
    pub(crate) fn new(
        spec: PipelineSpec,
        dir: PathBuf,
        steps: BTreeMap<String, Arc<Step>>,
        targets: Vec<String>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            spec,
            dir,
            steps,
            targets,
            store,
        }
    }

    /// Rebuild a pipeline from the definition saved by [`Pipeline::init`]
    pub fn load(dir: &Path, registry: &KindRegistry) -> PipestepResult<Self> {
        let path = dir.join(DEFINITION_FILE);
        if !path.exists() {
            return Err(PipestepError::NotFound {
                what: "Pipeline".to_string(),
                path: dir.to_path_buf(),
            });
        }

        let spec = PipelineSpec::from_file(&path)?;
        PipelineGraph::new(&spec, registry, dir).build()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Look up a step by label
    pub fn step(&self, label: &str) -> PipestepResult<&Arc<Step>> {
        self.steps.get(label).ok_or_else(|| PipestepError::NotFound {
            what: format!("Step '{}'", label),
            path: self.dir.join(label),
        })
    }

    /// Every step, by label
    pub fn steps(&self) -> impl Iterator<Item = &Arc<Step>> {
        self.steps.values()
    }

    /// Labels of the designated target steps
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// The given steps (default: the targets) and their dependencies,
    /// dependencies first
    pub fn traverse(&self, labels: &[String]) -> PipestepResult<Vec<Arc<Step>>> {
        let labels: &[String] = if labels.is_empty() {
            &self.targets
        } else {
            labels
        };

        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for label in labels {
            for step in self.step(label)?.closure() {
                if seen.insert(step.label().to_string()) {
                    order.push(step);
                }
            }
        }
        Ok(order)
    }

    /// Every step in dependency order
    pub fn all_steps(&self) -> Vec<Arc<Step>> {
        let labels: Vec<String> = self.steps.keys().cloned().collect();
        self.traverse(&labels).unwrap_or_default()
    }

    /// Persisted state of every step, in dependency order
    pub fn status(&self) -> PipestepResult<Vec<StepStatus>> {
        self.all_steps()
            .iter()
            .map(|step| {
                Ok(StepStatus {
                    label: step.label().to_string(),
                    kind: step.kind_name().to_string(),
                    state: step.state()?,
                    is_target: self.targets.iter().any(|t| t == step.label()),
                })
            })
            .collect()
    }

    /// Save the definition and initialize the target steps with their dependencies
    ///
    /// Steps that were already submitted or finished are left alone.
    pub fn init(&self) -> PipestepResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PipestepError::io_at(&self.dir, e))?;
        write_atomic(&self.dir.join(DEFINITION_FILE), &self.spec.to_yaml()?)?;

        for label in &self.targets {
            let step = self.step(label)?;
            match step.state()? {
                None | Some(StepState::InitIncomplete) | Some(StepState::Inited) => step.init()?,
                Some(state) => {
                    tracing::debug!(step = %label, "Already {}, not reinitializing", state);
                }
            }
        }

        tracing::info!("Initialized pipeline '{}' in {}", self.name(), self.dir.display());
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.spec.name)
            .field("dir", &self.dir)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("targets", &self.targets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tempfile::TempDir;

    const SPEC: &str = r#"
name: translation
steps:
  - {label: raw, kind: echo, params: {targets: [corpus]}}
  - {label: clean, kind: echo, dependencies: {corpus: raw}, params: {targets: [a, b]}}
  - {label: vocab, kind: echo, dependencies: {corpus: clean}, params: {targets: [vocab]}}
  - {label: unused, kind: echo, params: {targets: [x]}}
targets: [vocab]
"#;

    #[test]
    fn test_traverse_orders_dependencies_first() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = testing::pipeline(temp_dir.path(), SPEC);

        let labels: Vec<_> = pipeline
            .traverse(&[])
            .unwrap()
            .iter()
            .map(|s| s.label().to_string())
            .collect();
        assert_eq!(labels, vec!["raw", "clean", "vocab"]);

        assert!(pipeline.traverse(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_init_initializes_target_closure_only() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = testing::pipeline(temp_dir.path(), SPEC);
        pipeline.init().unwrap();

        assert!(temp_dir.path().join(DEFINITION_FILE).exists());
        let status = pipeline.status().unwrap();
        let state_of = |label: &str| status.iter().find(|s| s.label == label).unwrap().state;

        assert_eq!(state_of("raw"), Some(StepState::Inited));
        assert_eq!(state_of("vocab"), Some(StepState::Inited));
        assert_eq!(state_of("unused"), None);
        assert!(status.iter().find(|s| s.label == "vocab").unwrap().is_target);
    }

    #[test]
    fn test_init_skips_advanced_steps() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = testing::pipeline(temp_dir.path(), SPEC);
        pipeline.init().unwrap();

        let vocab = pipeline.step("vocab").unwrap();
        vocab.set_state(StepState::Submitted).unwrap();
        pipeline.init().unwrap();
        assert_eq!(vocab.state().unwrap(), Some(StepState::Submitted));
    }

    #[test]
    fn test_load_rebuilds_from_saved_definition() {
        let temp_dir = TempDir::new().unwrap();
        let spec = PipelineSpec::from_yaml(SPEC).unwrap();
        let registry = testing::registry();
        let pipeline = PipelineGraph::new(&spec, &registry, temp_dir.path())
            .launcher("/usr/bin/pipestep")
            .build()
            .unwrap();
        pipeline.init().unwrap();

        let loaded = Pipeline::load(temp_dir.path(), &registry).unwrap();
        assert_eq!(loaded.spec(), pipeline.spec());
        assert_eq!(
            loaded.step("clean").unwrap().state().unwrap(),
            Some(StepState::Inited)
        );

        assert!(matches!(
            Pipeline::load(&temp_dir.path().join("missing"), &registry),
            Err(PipestepError::NotFound { .. })
        ));
    }
}
