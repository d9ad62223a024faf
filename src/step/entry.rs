// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Executable entry point of a step
//!
//! Backends launch every task of a step through the same script. Without an
//! argument it runs the main task; with a single target path it computes
//! that target. Anything else is rejected by the `exec` command.

use std::path::{Path, PathBuf};

use crate::errors::{PipestepError, PipestepResult};

/// File name of the entry point inside the step directory
pub const ENTRY_POINT: &str = "step.sh";

/// Quote a string for POSIX shells
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Script content for a step
pub fn render(launcher: &Path, pipeline_dir: &Path, label: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # Entry point of step {label}\n\
         # usage: step.sh            run the main task\n\
         #        step.sh <target>   compute a single target\n\
         exec {launcher} exec --pipeline-dir {dir} {quoted} \"$@\"\n",
        label = label,
        launcher = shell_quote(&launcher.to_string_lossy()),
        dir = shell_quote(&pipeline_dir.to_string_lossy()),
        quoted = shell_quote(label),
    )
}

/// Write the entry point and mark it executable
pub fn write(step_dir: &Path, content: &str) -> PipestepResult<PathBuf> {
    let path = step_dir.join(ENTRY_POINT);
    std::fs::write(&path, content).map_err(|e| PipestepError::io_at(&path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&path, permissions).map_err(|e| PipestepError::io_at(&path, e))?;
    }

    Ok(path)
}

/// Command line that runs the main task (`None`) or one subtask
pub fn command(entry_point: &Path, target: Option<&Path>) -> Vec<String> {
    let mut command = vec![entry_point.to_string_lossy().to_string()];
    if let Some(target) = target {
        command.push(target.to_string_lossy().to_string());
    }
    command
}
