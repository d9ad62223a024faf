// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Filesystem-based state store
//!
//! Records live inside each step's directory:
//! `<root>/<label>/state`, `<root>/<label>/submission.json` and
//! `<root>/<label>/control`.

use std::path::{Path, PathBuf};

use super::StateStore;
use crate::errors::{PipestepError, PipestepResult};
use crate::runner::SubmissionInfo;
use crate::step::{StepCommand, StepState};

const STATE_FILE: &str = "state";
const SUBMISSION_FILE: &str = "submission.json";
const CONTROL_FILE: &str = "control";

/// Filesystem-based state store rooted at a pipeline directory
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Create a store for the pipeline rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pipeline directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, step: &str, file: &str) -> PathBuf {
        self.root.join(step).join(file)
    }

    fn read(&self, step: &str, file: &str) -> PipestepResult<Option<String>> {
        let path = self.path(step, file);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipestepError::io_at(&path, e)),
        }
    }

    fn remove(&self, step: &str, file: &str) -> PipestepResult<()> {
        let path = self.path(step, file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipestepError::io_at(&path, e)),
        }
    }
}

/// Write through a temporary file so readers never see half a record
pub(crate) fn write_atomic(path: &Path, content: &str) -> PipestepResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipestepError::io_at(parent, e))?;
    }

    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, content).map_err(|e| PipestepError::io_at(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| PipestepError::io_at(path, e))
}

impl StateStore for FilesystemStore {
    fn load_state(&self, step: &str) -> PipestepResult<Option<StepState>> {
        match self.read(step, STATE_FILE)? {
            Some(content) => content
                .parse::<StepState>()
                .map(Some)
                .map_err(|reason| PipestepError::InvalidParams {
                    step: step.to_string(),
                    reason,
                }),
            None => Ok(None),
        }
    }

    fn save_state(&self, step: &str, state: StepState) -> PipestepResult<()> {
        write_atomic(&self.path(step, STATE_FILE), &format!("{}\n", state))
    }

    fn load_submission(&self, step: &str) -> PipestepResult<Option<SubmissionInfo>> {
        match self.read(step, SUBMISSION_FILE)? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    fn save_submission(&self, step: &str, info: &SubmissionInfo) -> PipestepResult<()> {
        let json = serde_json::to_string_pretty(info)?;
        write_atomic(&self.path(step, SUBMISSION_FILE), &json)
    }

    fn clear_submission(&self, step: &str) -> PipestepResult<()> {
        self.remove(step, SUBMISSION_FILE)
    }

    fn push_command(&self, step: &str, command: StepCommand) -> PipestepResult<()> {
        let json = serde_json::to_string(&command)?;
        write_atomic(&self.path(step, CONTROL_FILE), &json)
    }

    fn take_command(&self, step: &str) -> PipestepResult<Option<StepCommand>> {
        let Some(content) = self.read(step, CONTROL_FILE)? else {
            return Ok(None);
        };
        self.remove(step, CONTROL_FILE)?;

        match serde_json::from_str(&content) {
            Ok(command) => Ok(Some(command)),
            Err(e) => {
                tracing::warn!(step, "Ignoring unreadable control command: {}", e);
                Ok(None)
            }
        }
    }

    fn clear(&self, step: &str) -> PipestepResult<()> {
        self.remove(step, CONTROL_FILE)?;
        self.remove(step, SUBMISSION_FILE)?;
        self.remove(step, STATE_FILE)
    }
}
