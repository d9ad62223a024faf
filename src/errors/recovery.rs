// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from errors.

use super::PipestepError;
use crate::step::StepState;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Suggest resubmitting a failed step
    pub fn resubmit_failed(step: &str) -> Self {
        Self {
            action: format!("Resubmit step '{}'", step),
            steps: vec![
                "Finished target files are kept and only missing ones are recomputed".into(),
                "Check the step's logs/ directory for the failing subtask".into(),
            ],
            commands: vec![
                "# Retry, keeping finished targets:".into(),
                format!("pipestep resubmit {}", step),
                "".into(),
                "# Recompute everything:".into(),
                format!("pipestep resubmit {} --all", step),
            ],
        }
    }

    /// Suggest fixing a dependency cycle
    pub fn fix_dependency_cycle(steps: &[String]) -> Self {
        Self {
            action: "Remove dependency cycle".into(),
            steps: vec![
                format!("Detected cycle: {}", steps.join(" → ")),
                "Steps must form a directed acyclic graph".into(),
            ],
            commands: vec![
                "# Visualize the pipeline:".into(),
                "pipestep graph pipeline.yaml --format mermaid".into(),
            ],
        }
    }

    /// Suggest managing a step with its owning runner
    pub fn use_owning_runner(step: &str, owner: &str) -> Self {
        Self {
            action: format!("Manage '{}' with the {} runner", step, owner),
            steps: vec![
                "A step is owned by the runner that submitted it".into(),
                "Stop it with that runner before switching backends".into(),
            ],
            commands: vec![format!("pipestep stop -p <pipeline-dir> --runner {}", owner)],
        }
    }

    /// Suggest re-initializing a step left half-created
    pub fn reinitialize(step: &str) -> Self {
        Self {
            action: format!("Re-initialize step '{}'", step),
            steps: vec!["A previous initialization was interrupted".into()],
            commands: vec!["pipestep init pipeline.yaml -p <pipeline-dir>".into()],
        }
    }

    /// Pick a suggestion for an error, if one applies
    pub fn for_error(error: &PipestepError) -> Option<Self> {
        match error {
            PipestepError::DependencyCycle { steps } => Some(Self::fix_dependency_cycle(steps)),
            PipestepError::OwnershipConflict { step, owner, .. } => {
                Some(Self::use_owning_runner(step, &owner.to_string()))
            }
            PipestepError::InvalidStateTransition {
                step,
                from: Some(StepState::InitIncomplete),
                ..
            } => Some(Self::reinitialize(step)),
            PipestepError::SubtaskExecutionFailure { step, .. }
            | PipestepError::MissingTargets { step, .. }
            | PipestepError::Terminated { step }
            | PipestepError::StepFailed { step } => Some(Self::resubmit_failed(step)),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_for_failed_subtask() {
        let err = PipestepError::SubtaskExecutionFailure {
            step: "clean".into(),
            target: "part.0.txt".into(),
            message: "exit 1".into(),
        };
        let suggestion = RecoverySuggestion::for_error(&err).unwrap();
        let text = suggestion.to_string();
        assert!(text.contains("pipestep resubmit clean"));
    }

    #[test]
    fn test_no_suggestion_for_io() {
        let err = PipestepError::Io { message: "disk full".into() };
        assert!(RecoverySuggestion::for_error(&err).is_none());
    }
}
