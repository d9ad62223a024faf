// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! In-memory state store

use std::collections::HashMap;
use std::sync::Mutex;

use super::StateStore;
use crate::errors::PipestepResult;
use crate::runner::SubmissionInfo;
use crate::step::{StepCommand, StepState};

#[derive(Debug, Default)]
struct Records {
    states: HashMap<String, StepState>,
    submissions: HashMap<String, SubmissionInfo>,
    commands: HashMap<String, StepCommand>,
}

/// State store that keeps everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        // A poisoned lock only means another test thread panicked mid-update
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut records)
    }
}

impl StateStore for MemoryStore {
    fn load_state(&self, step: &str) -> PipestepResult<Option<StepState>> {
        Ok(self.with(|r| r.states.get(step).copied()))
    }

    fn save_state(&self, step: &str, state: StepState) -> PipestepResult<()> {
        self.with(|r| r.states.insert(step.to_string(), state));
        Ok(())
    }

    fn load_submission(&self, step: &str) -> PipestepResult<Option<SubmissionInfo>> {
        Ok(self.with(|r| r.submissions.get(step).cloned()))
    }

    fn save_submission(&self, step: &str, info: &SubmissionInfo) -> PipestepResult<()> {
        self.with(|r| r.submissions.insert(step.to_string(), info.clone()));
        Ok(())
    }

    fn clear_submission(&self, step: &str) -> PipestepResult<()> {
        self.with(|r| r.submissions.remove(step));
        Ok(())
    }

    fn push_command(&self, step: &str, command: StepCommand) -> PipestepResult<()> {
        self.with(|r| r.commands.insert(step.to_string(), command));
        Ok(())
    }

    fn take_command(&self, step: &str) -> PipestepResult<Option<StepCommand>> {
        Ok(self.with(|r| r.commands.remove(step)))
    }

    fn clear(&self, step: &str) -> PipestepResult<()> {
        self.with(|r| {
            r.states.remove(step);
            r.submissions.remove(step);
            r.commands.remove(step);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_forgets_step() {
        let store = MemoryStore::new();
        store.save_state("a", StepState::Failed).unwrap();
        store.push_command("a", StepCommand::Terminate).unwrap();

        store.clear("a").unwrap();
        assert_eq!(store.load_state("a").unwrap(), None);
        assert_eq!(store.take_command("a").unwrap(), None);
    }
}
