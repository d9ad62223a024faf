// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Resubmit command - restart a step under a new main task

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, report, saved_runner};
use crate::utils::create_spinner;

/// Resubmit one step
pub async fn run(pipeline_dir: PathBuf, label: String, all: bool) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_dir)?;
    let runner = saved_runner(&pipeline).await?;
    let step = pipeline.step(&label)?;

    let spinner = create_spinner(&format!("Resubmitting {}...", label));
    let result = runner.resubmit_step(step, !all).await;
    spinner.finish_and_clear();

    match result.map_err(report)?.and_then(|info| info.main_task) {
        Some(handle) => println!("{} {} as {}", "Resubmitted".green().bold(), label, handle),
        None => println!("{} is already done", label),
    }
    Ok(())
}
