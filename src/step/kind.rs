// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Step kinds
//!
//! A kind is the capability object that makes a step do something: it names
//! the target files and computes one of them at a time. Kinds are looked up
//! by name in a [`KindRegistry`] built explicitly at startup.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::resources::ResourceSpec;
use super::shell::ShellKind;
use crate::errors::{PipestepError, PipestepResult};

/// Output of a dependency, as seen by a dependent step
#[derive(Debug, Clone)]
pub struct DependencyOutput {
    /// Label of the dependency step
    pub label: String,
    /// Its `output/` directory
    pub output_dir: PathBuf,
    /// Its declared target files
    pub targets: Vec<PathBuf>,
}

/// Everything a kind may look at while running
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Step label
    pub label: String,
    /// Directory the target files live in
    pub output_dir: PathBuf,
    /// Scratch directory, wiped once the step is done
    pub temp_dir: PathBuf,
    /// Directory for task logs
    pub logs_dir: PathBuf,
    /// Dependency outputs, by dependency name
    pub dependencies: BTreeMap<String, DependencyOutput>,
    /// Resources granted to the step's tasks
    pub resources: ResourceSpec,
}

impl StepContext {
    /// Look up a dependency by name
    pub fn dependency(&self, name: &str) -> PipestepResult<&DependencyOutput> {
        self.dependencies
            .get(name)
            .ok_or_else(|| PipestepError::UnresolvedDependency {
                step: self.label.clone(),
                dependency: name.to_string(),
            })
    }
}

/// Kind-specific behavior of a step
#[async_trait]
pub trait StepKind: Send + Sync {
    /// Registered kind name
    fn name(&self) -> &str;

    /// Target file names, relative to the output directory
    fn targets(&self, ctx: &StepContext) -> PipestepResult<Vec<String>>;

    /// Compute a single target file
    ///
    /// On error the caller deletes whatever was written to `target`.
    async fn compute(&self, ctx: &StepContext, target: &Path) -> PipestepResult<()>;

    /// Runs in the main task before any subtask is submitted
    async fn pre(&self, _ctx: &StepContext) -> PipestepResult<()> {
        Ok(())
    }

    /// Runs in the main task after every subtask finished
    async fn post(&self, _ctx: &StepContext) -> PipestepResult<()> {
        Ok(())
    }

    /// Resources requested when the pipeline does not override them
    fn default_resources(&self) -> ResourceSpec {
        ResourceSpec::default()
    }

    /// Kind parameters, persisted with the step
    fn params(&self) -> serde_yaml::Value;
}

/// Builds a kind from a step label and its parameters
pub type KindFactory =
    Box<dyn Fn(&str, &serde_yaml::Value) -> PipestepResult<Arc<dyn StepKind>> + Send + Sync>;

/// Explicit map from kind name to factory
pub struct KindRegistry {
    factories: BTreeMap<String, KindFactory>,
}

impl KindRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in kinds
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("shell", |label, params| {
            Ok(Arc::new(ShellKind::from_params(label, params)?) as Arc<dyn StepKind>)
        });
        registry
    }

    /// Register a factory, replacing any previous one with that name
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str, &serde_yaml::Value) -> PipestepResult<Arc<dyn StepKind>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Whether a kind is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered kind names
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the kind for a step
    pub fn create(
        &self,
        label: &str,
        kind: &str,
        params: &serde_yaml::Value,
    ) -> PipestepResult<Arc<dyn StepKind>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| PipestepError::UnknownKind {
                step: label.to_string(),
                kind: kind.to_string(),
                available: self.names().join(", "),
            })?;

        factory(label, params)
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_has_shell() {
        let registry = KindRegistry::builtin();
        assert!(registry.contains("shell"));
        assert_eq!(registry.names(), vec!["shell"]);
    }

    #[test]
    fn test_unknown_kind_lists_available() {
        let registry = KindRegistry::builtin();
        let result = registry.create("clean", "opuscleaner", &serde_yaml::Value::Null);

        match result {
            Err(PipestepError::UnknownKind { kind, available, .. }) => {
                assert_eq!(kind, "opuscleaner");
                assert_eq!(available, "shell");
            }
            _ => panic!("Expected UnknownKind"),
        }
    }
}
