// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Status command - show step states

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, saved_runner};
use crate::step::StepState;
use crate::utils::{print_header, state_label};

/// Print the state of every step
pub async fn run(pipeline_dir: PathBuf, check: bool, verbose: bool) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_dir)?;

    if check {
        let runner = saved_runner(&pipeline).await?;
        for step in pipeline.all_steps() {
            runner.reconcile(&step).await?;
        }
    }

    print_header(&format!("Pipeline '{}'", pipeline.name()));
    let mut failed = Vec::new();

    for status in pipeline.status()? {
        let marker = if status.is_target { "*" } else { " " };
        println!(
            "{} {:<24} {:<10} {}",
            marker,
            status.label,
            status.kind.dimmed(),
            state_label(status.state)
        );

        if verbose {
            let step = pipeline.step(&status.label)?;
            if let Some(info) = step.submission()? {
                if let Some(main) = &info.main_task {
                    println!("    {} {} on {}", "main".dimmed(), main, info.runner);
                }
                for subtask in &info.subtasks {
                    println!("    {} {}", "sub".dimmed(), subtask);
                }
            }
        }

        if status.state == Some(StepState::Failed) {
            failed.push(status.label);
        }
    }

    if !failed.is_empty() {
        println!();
        println!(
            "{} inspect the logs/ directory of {}, then run {}",
            "Hint:".yellow().bold(),
            failed.join(", "),
            "pipestep resubmit <label>".cyan()
        );
    }

    Ok(())
}
