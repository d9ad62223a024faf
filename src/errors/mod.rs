// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Error types
//!
//! Every failure carries the label of the step it concerns so that
//! user-visible reports can name the failing step and its persisted state.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::runner::RunnerKind;
use crate::step::StepState;

/// Result type for pipestep operations
pub type PipestepResult<T> = Result<T, PipestepError>;

/// Main error type for pipestep
#[derive(Error, Debug, Diagnostic)]
pub enum PipestepError {
    // ─────────────────────────────────────────────────────────────────────────
    // Step lifecycle
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step '{step}' cannot move from {} to {to}", display_state(.from))]
    #[diagnostic(code(pipestep::invalid_state_transition))]
    InvalidStateTransition {
        step: String,
        from: Option<StepState>,
        to: StepState,
        #[help]
        help: Option<String>,
    },

    #[error("Step '{step}' has no target named '{target}'")]
    #[diagnostic(code(pipestep::unknown_target))]
    UnknownTarget { step: String, target: String },

    #[error("Step '{step}' finished without producing {} target file(s)", missing.len())]
    #[diagnostic(
        code(pipestep::missing_targets),
        help("Resubmit the step; finished target files are kept by default")
    )]
    MissingTargets { step: String, missing: Vec<PathBuf> },

    #[error("Step '{step}' was terminated")]
    #[diagnostic(code(pipestep::terminated))]
    Terminated { step: String },

    #[error("Step '{step}' failed")]
    #[diagnostic(
        code(pipestep::step_failed),
        help("Inspect the step's logs/ directory, then run 'pipestep resubmit {step}'")
    )]
    StepFailed { step: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Graph construction
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Dependency cycle detected: {}", steps.join(" -> "))]
    #[diagnostic(
        code(pipestep::dependency_cycle),
        help("Review the step dependencies to remove the cycle")
    )]
    DependencyCycle { steps: Vec<String> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    #[diagnostic(
        code(pipestep::unresolved_dependency),
        help("Check that '{dependency}' is defined in the pipeline")
    )]
    UnresolvedDependency { step: String, dependency: String },

    #[error("Step label '{step}' is declared more than once")]
    #[diagnostic(code(pipestep::duplicate_step))]
    DuplicateStep { step: String },

    #[error("Step '{step}' uses unknown kind '{kind}'")]
    #[diagnostic(code(pipestep::unknown_kind), help("Registered kinds: {available}"))]
    UnknownKind {
        step: String,
        kind: String,
        available: String,
    },

    #[error("Step '{step}' has invalid parameters: {reason}")]
    #[diagnostic(code(pipestep::invalid_params))]
    InvalidParams { step: String, reason: String },

    #[error("Invalid pipeline definition: {reason}")]
    #[diagnostic(code(pipestep::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step '{step}' failed to compute '{}': {message}", target.display())]
    #[diagnostic(code(pipestep::subtask_failed))]
    SubtaskExecutionFailure {
        step: String,
        target: PathBuf,
        message: String,
    },

    #[error("Task {handle} failed: {reason}")]
    #[diagnostic(code(pipestep::task_failed))]
    TaskFailed { handle: String, reason: String },

    #[error("Timed out after {waited_secs}s waiting for step '{step}'")]
    #[diagnostic(code(pipestep::timeout))]
    Timeout { step: String, waited_secs: u64 },

    // ─────────────────────────────────────────────────────────────────────────
    // Backends
    // ─────────────────────────────────────────────────────────────────────────
    #[error("{backend} backend failed: {message}")]
    #[diagnostic(code(pipestep::backend_submission_failure))]
    BackendSubmissionFailure {
        backend: RunnerKind,
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("Backend tool '{tool}' not found")]
    #[diagnostic(code(pipestep::backend_unavailable), help("{suggestion}"))]
    BackendUnavailable { tool: String, suggestion: String },

    #[error("Step '{step}' is owned by the {owner} runner, not {requested}")]
    #[diagnostic(
        code(pipestep::ownership_conflict),
        help("Manage the step with '--runner {owner}'")
    )]
    OwnershipConflict {
        step: String,
        owner: RunnerKind,
        requested: RunnerKind,
    },

    #[error("{what} not found: {}", path.display())]
    #[diagnostic(code(pipestep::not_found))]
    NotFound { what: String, path: PathBuf },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/Serialization
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(pipestep::io_error))]
    Io { message: String },

    #[error("YAML error: {message}")]
    #[diagnostic(code(pipestep::yaml_error))]
    Yaml { message: String },

    #[error("JSON error: {message}")]
    #[diagnostic(code(pipestep::json_error))]
    Json { message: String },

    #[error("TOML error: {message}")]
    #[diagnostic(code(pipestep::toml_error))]
    Toml { message: String },
}

fn display_state(state: &Option<StepState>) -> String {
    match state {
        Some(state) => state.to_string(),
        None => "<not created>".to_string(),
    }
}

impl From<std::io::Error> for PipestepError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for PipestepError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for PipestepError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for PipestepError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<toml::ser::Error> for PipestepError {
    fn from(e: toml::ser::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl PipestepError {
    /// Create a backend-unavailable error with an installation hint
    pub fn backend_unavailable(tool: &str) -> Self {
        let suggestion = match tool {
            "sbatch" | "squeue" | "scancel" | "scontrol" | "sacct" => {
                "Run on a Slurm login node or choose '--runner local'".to_string()
            }
            "hq" => "Install HyperQueue: https://it4innovations.github.io/hyperqueue/".to_string(),
            _ => format!("Install {} and ensure it's in your PATH", tool),
        };

        Self::BackendUnavailable {
            tool: tool.to_string(),
            suggestion,
        }
    }

    /// Create a backend failure without a hint
    pub fn backend(backend: RunnerKind, message: impl Into<String>) -> Self {
        Self::BackendSubmissionFailure {
            backend,
            message: message.into(),
            help: None,
        }
    }

    /// Create an invalid-transition error
    pub fn transition(step: &str, from: Option<StepState>, to: StepState) -> Self {
        let help = match from {
            None => Some(format!("Initialize the pipeline before submitting '{}'", step)),
            Some(StepState::Done) => Some("The step is already finished".to_string()),
            Some(StepState::InitIncomplete) => {
                Some("Re-run 'pipestep init' to recreate the step".to_string())
            }
            _ => None,
        };

        Self::InvalidStateTransition {
            step: step.to_string(),
            from,
            to,
            help,
        }
    }

    /// Create an IO error that names the offending path
    pub fn io_at(path: &std::path::Path, e: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", path.display(), e),
        }
    }

    /// Label of the step this error concerns, when there is one
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::InvalidStateTransition { step, .. }
            | Self::UnknownTarget { step, .. }
            | Self::MissingTargets { step, .. }
            | Self::Terminated { step }
            | Self::StepFailed { step }
            | Self::UnresolvedDependency { step, .. }
            | Self::DuplicateStep { step }
            | Self::UnknownKind { step, .. }
            | Self::InvalidParams { step, .. }
            | Self::SubtaskExecutionFailure { step, .. }
            | Self::Timeout { step, .. }
            | Self::OwnershipConflict { step, .. } => Some(step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message_names_missing_state() {
        let err = PipestepError::transition("clean", None, StepState::Submitted);
        assert_eq!(
            err.to_string(),
            "Step 'clean' cannot move from <not created> to SUBMITTED"
        );
        assert_eq!(err.step(), Some("clean"));
    }

    #[test]
    fn test_ownership_conflict_message() {
        let err = PipestepError::OwnershipConflict {
            step: "train".into(),
            owner: RunnerKind::Slurm,
            requested: RunnerKind::Local,
        };
        assert!(err.to_string().contains("owned by the slurm runner"));
    }

    #[test]
    fn test_backend_unavailable_hint() {
        let err = PipestepError::backend_unavailable("sbatch");
        match err {
            PipestepError::BackendUnavailable { suggestion, .. } => {
                assert!(suggestion.contains("Slurm"));
            }
            _ => panic!("Expected BackendUnavailable"),
        }
    }
}
