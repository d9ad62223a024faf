// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! # pipestep - pipeline step orchestrator
//!
//! `pipestep` runs multi-step pipelines whose steps are long external jobs.
//! Each step is a directory with a persisted state, a list of target files
//! and a generated entry point. The entry point runs either the step's
//! *main task*, which submits one *subtask* per missing target file, or a
//! single subtask.
//!
//! ## Features
//!
//! - **Crash tolerant** - a target file that exists is complete; everything
//!   else is recomputed
//! - **Pluggable backends** - local processes, Slurm, HyperQueue and an
//!   in-process debug runner
//! - **Resubmission** - a running main task replaces itself on request or
//!   shortly before its time limit, and dependants are repointed
//!
//! ## Quick Start
//!
//! ```bash
//! pipestep init pipeline.yaml -p runs/exp1
//! pipestep run -p runs/exp1 --runner slurm --wait
//! pipestep status -p runs/exp1
//! ```

pub mod cli;
pub mod errors;
pub mod pipeline;
pub mod runner;
pub mod step;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{PipestepError, PipestepResult};
pub use pipeline::{Pipeline, PipelineGraph, PipelineSpec};
pub use runner::{Runner, RunnerKind, RunnerParams};
pub use step::{KindRegistry, Step, StepKind, StepState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
