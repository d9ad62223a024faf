// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Step object graph
//!
//! Turns a [`PipelineSpec`] into shared [`Step`] objects. Dependencies are
//! resolved by label; every label is instantiated once, so an upstream step
//! used by several targets is a single object.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use super::{Pipeline, PipelineSpec};
use crate::errors::{PipestepError, PipestepResult};
use crate::step::{KindRegistry, Step};
use crate::store::{FilesystemStore, StateStore};

/// Builder of a [`Pipeline`] from its definition
pub struct PipelineGraph<'a> {
    spec: &'a PipelineSpec,
    registry: &'a KindRegistry,
    dir: PathBuf,
    store: Option<Arc<dyn StateStore>>,
    launcher: Option<PathBuf>,
}

impl<'a> PipelineGraph<'a> {
    pub fn new(spec: &'a PipelineSpec, registry: &'a KindRegistry, dir: impl Into<PathBuf>) -> Self {
        Self {
            spec,
            registry,
            dir: dir.into(),
            store: None,
            launcher: None,
        }
    }

    /// Use a specific state store (default: files under the pipeline directory)
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Program the generated entry points exec
    pub fn launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    /// Every label reference must resolve before anything is instantiated
    fn check_references(&self) -> PipestepResult<()> {
        let mut labels = HashSet::new();
        for step in &self.spec.steps {
            if !labels.insert(step.label.as_str()) {
                return Err(PipestepError::DuplicateStep {
                    step: step.label.clone(),
                });
            }
        }

        for step in &self.spec.steps {
            for dependency in step.dependencies.values() {
                if !labels.contains(dependency.as_str()) {
                    return Err(PipestepError::UnresolvedDependency {
                        step: step.label.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        for target in &self.spec.targets {
            if !labels.contains(target.as_str()) {
                return Err(PipestepError::InvalidPipeline {
                    reason: format!("target '{}' is not a step of the pipeline", target),
                    help: Some(format!("Declared steps: {}", self.spec.step_labels().join(", "))),
                });
            }
        }
        Ok(())
    }

    pub fn build(self) -> PipestepResult<Pipeline> {
        self.check_references()?;

        let store = self
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(FilesystemStore::new(&self.dir)));

        let mut built = BTreeMap::new();
        for step in &self.spec.steps {
            self.instantiate(&step.label, &store, &mut built, &mut Vec::new())?;
        }

        let targets = self.spec.effective_targets();
        Ok(Pipeline::new(self.spec.clone(), self.dir, built, targets, store))
    }

    fn instantiate(
        &self,
        label: &str,
        store: &Arc<dyn StateStore>,
        built: &mut BTreeMap<String, Arc<Step>>,
        in_progress: &mut Vec<String>,
    ) -> PipestepResult<Arc<Step>> {
        if let Some(step) = built.get(label) {
            return Ok(step.clone());
        }
        if let Some(pos) = in_progress.iter().position(|l| l == label) {
            let mut steps = in_progress[pos..].to_vec();
            steps.push(label.to_string());
            return Err(PipestepError::DependencyCycle { steps });
        }

        let spec = self
            .spec
            .get_step(label)
            .ok_or_else(|| PipestepError::UnresolvedDependency {
                step: in_progress.last().cloned().unwrap_or_default(),
                dependency: label.to_string(),
            })?;

        in_progress.push(label.to_string());
        let kind = self.registry.create(label, &spec.kind, &spec.params)?;
        let mut builder = Step::builder(label, &spec.kind, kind, &self.dir)
            .resources(&spec.resources)
            .store(store.clone());
        if let Some(launcher) = &self.launcher {
            builder = builder.launcher(launcher);
        }
        for (name, dependency) in &spec.dependencies {
            let dep = self.instantiate(dependency, store, built, in_progress)?;
            builder = builder.dependency(name, dep);
        }
        in_progress.pop();

        let step = Arc::new(builder.build());
        built.insert(label.to_string(), step.clone());
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn build(yaml: &str, dir: &std::path::Path) -> PipestepResult<Pipeline> {
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        let registry = crate::testing::registry();
        PipelineGraph::new(&spec, &registry, dir)
            .store(Arc::new(MemoryStore::new()))
            .build()
    }

    #[test]
    fn test_shared_upstream_is_one_object() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = build(
            r#"
name: shared
steps:
  - {label: raw, kind: echo, params: {targets: [a]}}
  - {label: vocab, kind: echo, dependencies: {corpus: raw}, params: {targets: [v]}}
  - {label: train, kind: echo, dependencies: {corpus: raw, vocab: vocab}, params: {targets: [m]}}
"#,
            temp_dir.path(),
        )
        .unwrap();

        let train = pipeline.step("train").unwrap();
        let vocab = pipeline.step("vocab").unwrap();
        assert!(Arc::ptr_eq(
            &train.dependencies()["corpus"],
            &vocab.dependencies()["corpus"]
        ));
        assert_eq!(pipeline.targets(), ["train"]);
    }

    #[test]
    fn test_unresolved_reference_fails_before_instantiation() {
        let temp_dir = TempDir::new().unwrap();
        let result = build(
            r#"
name: broken
steps:
  - {label: clean, kind: nonexistent-kind, dependencies: {corpus: raw}}
"#,
            temp_dir.path(),
        );

        // The unknown kind would fail instantiation; the reference check runs first
        assert!(matches!(
            result,
            Err(PipestepError::UnresolvedDependency { step, dependency })
                if step == "clean" && dependency == "raw"
        ));
    }

    #[test]
    fn test_cycle_is_detected() {
        let temp_dir = TempDir::new().unwrap();
        let result = build(
            r#"
name: cyclic
steps:
  - {label: a, kind: echo, dependencies: {x: b}, params: {targets: [a]}}
  - {label: b, kind: echo, dependencies: {x: a}, params: {targets: [b]}}
"#,
            temp_dir.path(),
        );

        match result {
            Err(PipestepError::DependencyCycle { steps }) => assert_eq!(steps, vec!["a", "b", "a"]),
            other => panic!("Expected DependencyCycle, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unknown_target() {
        let temp_dir = TempDir::new().unwrap();
        let result = build(
            r#"
name: t
steps:
  - {label: a, kind: echo, params: {targets: [a]}}
targets: [b]
"#,
            temp_dir.path(),
        );
        assert!(matches!(result, Err(PipestepError::InvalidPipeline { .. })));
    }
}
