// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Pipeline definition structures
//!
//! Defines the schema of pipeline YAML files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{PipestepError, PipestepResult};
use crate::step::ResourceSpec;

/// Pipeline definition file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSpec {
    /// Definition format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Steps, in any order
    pub steps: Vec<StepSpec>,

    /// Labels of the designated target steps (default: steps nothing depends on)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineSpec {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> PipestepResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipestepError::NotFound {
                    what: "Pipeline definition".to_string(),
                    path: path.to_path_buf(),
                }
            } else {
                PipestepError::io_at(path, e)
            }
        })?;

        Self::from_yaml(&content)
    }

    /// Parse a definition from YAML
    pub fn from_yaml(yaml: &str) -> PipestepResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> PipestepResult<String> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a step by label
    pub fn get_step(&self, label: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.label == label)
    }

    /// All step labels, in declaration order
    pub fn step_labels(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.label.as_str()).collect()
    }

    /// Declared targets, or the steps no other step depends on
    pub fn effective_targets(&self) -> Vec<String> {
        if !self.targets.is_empty() {
            return self.targets.clone();
        }

        self.steps
            .iter()
            .filter(|candidate| {
                !self
                    .steps
                    .iter()
                    .any(|s| s.dependencies.values().any(|d| d == &candidate.label))
            })
            .map(|s| s.label.clone())
            .collect()
    }
}

/// A single step of the definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Unique label, also the name of the step directory
    pub label: String,

    /// Registered kind name
    pub kind: String,

    /// Step description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Dependencies: name the kind uses → label of the step providing it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,

    /// Overrides of the kind's default resources
    #[serde(default, skip_serializing_if = "is_default_resources")]
    pub resources: ResourceSpec,

    /// Kind-specific parameters
    #[serde(default, skip_serializing_if = "serde_yaml::Value::is_null")]
    pub params: serde_yaml::Value,
}

fn is_default_resources(resources: &ResourceSpec) -> bool {
    resources == &ResourceSpec::default()
}
