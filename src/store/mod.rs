// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Persistence of step state
//!
//! The step's state, its submission record and pending control commands are
//! the only records shared between processes. They are loaded and saved
//! through [`StateStore`] so the orchestration logic can run against an
//! in-memory store in tests. Reads and writes are best-effort: two processes
//! racing on check-then-write of the same step are not serialized.

mod filesystem;
mod memory;

pub use filesystem::FilesystemStore;
pub(crate) use filesystem::write_atomic;
pub use memory::MemoryStore;

use crate::errors::PipestepResult;
use crate::runner::SubmissionInfo;
use crate::step::{StepCommand, StepState};

/// Storage adapter for per-step shared records
pub trait StateStore: Send + Sync {
    /// Load the persisted state (`None` when the step was never created)
    fn load_state(&self, step: &str) -> PipestepResult<Option<StepState>>;

    /// Persist a new state
    fn save_state(&self, step: &str, state: StepState) -> PipestepResult<()>;

    /// Load the submission record, if any
    fn load_submission(&self, step: &str) -> PipestepResult<Option<SubmissionInfo>>;

    /// Persist the submission record
    fn save_submission(&self, step: &str, info: &SubmissionInfo) -> PipestepResult<()>;

    /// Drop the submission record
    fn clear_submission(&self, step: &str) -> PipestepResult<()>;

    /// Queue a control command for the step's main task
    fn push_command(&self, step: &str, command: StepCommand) -> PipestepResult<()>;

    /// Remove and return the pending control command, if any
    fn take_command(&self, step: &str) -> PipestepResult<Option<StepCommand>>;

    /// Forget everything recorded for the step
    fn clear(&self, step: &str) -> PipestepResult<()>;
}
