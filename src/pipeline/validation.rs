// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Pipeline validation
//!
//! Checks a definition before any step directory is touched.

use std::collections::HashSet;

use crate::errors::PipestepError;
use crate::pipeline::{DagBuilder, PipelineSpec, StepSpec};
use crate::step::KindRegistry;

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a definition against the registered kinds
    pub fn validate(spec: &PipelineSpec, registry: &KindRegistry) -> ValidationResult {
        let mut result = ValidationResult::new();

        if spec.steps.is_empty() {
            result.add_error("Pipeline has no steps defined");
        }

        let mut seen = HashSet::new();
        for step in &spec.steps {
            if !seen.insert(&step.label) {
                result.add_error(&format!("Duplicate step label: '{}'", step.label));
            }
        }

        match DagBuilder::build(spec) {
            Ok(_) => {}
            // Reported above
            Err(PipestepError::DuplicateStep { .. }) => {}
            Err(PipestepError::DependencyCycle { steps }) => {
                result.add_error(&format!("Dependency cycle: {}", steps.join(" -> ")));
            }
            Err(PipestepError::UnresolvedDependency { step, dependency }) => {
                result.add_error(&format!(
                    "Step '{}' depends on unknown step '{}'",
                    step, dependency
                ));
            }
            Err(e) => result.add_error(&format!("DAG validation error: {}", e)),
        }

        for target in &spec.targets {
            if spec.get_step(target).is_none() {
                result.add_error(&format!("Target '{}' is not a step of the pipeline", target));
            }
        }

        for step in &spec.steps {
            Self::validate_step(step, registry, &mut result);
        }

        result
    }

    fn validate_step(step: &StepSpec, registry: &KindRegistry, result: &mut ValidationResult) {
        if step.label.is_empty()
            || step.label.starts_with('.')
            || step.label.contains(['/', '\\'])
        {
            result.add_error(&format!(
                "Step label '{}' cannot be used as a directory name",
                step.label
            ));
        }

        if !registry.contains(&step.kind) {
            result.add_error(&format!(
                "Step '{}': unknown kind '{}' (registered: {})",
                step.label,
                step.kind,
                registry.names().join(", ")
            ));
            return;
        }

        if let Err(e) = registry.create(&step.label, &step.kind, &step.params) {
            result.add_error(&e.to_string());
        }

        if step.resources.gpus.unwrap_or(0) > 0 && step.resources.partition.is_none() {
            result.add_warning(&format!(
                "Step '{}': requests GPUs without a partition; the runner default applies",
                step.label
            ));
        }
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}
