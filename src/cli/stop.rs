// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Stop command - cancel every active step

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, report, saved_params};
use crate::runner::{Runner, RunnerKind, RunnerParams};
use crate::utils::print_success;

/// Cancel the active steps of a pipeline
pub async fn run(pipeline_dir: PathBuf, runner: Option<RunnerKind>) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_dir)?;
    let params = match (saved_params(&pipeline), runner) {
        (Ok(saved), Some(kind)) if saved.kind != kind => RunnerParams::new(kind),
        (Ok(saved), _) => saved,
        (Err(_), Some(kind)) => RunnerParams::new(kind),
        (Err(e), None) => return Err(e),
    };
    let runner = Runner::for_pipeline(&pipeline, params).await?;

    let stopped = runner.stop_pipeline(&pipeline).await.map_err(report)?;
    if stopped.is_empty() {
        println!("{}", "Nothing is running.".dimmed());
    }
    for label in stopped {
        print_success(&format!("{} stopped", label));
    }
    Ok(())
}
