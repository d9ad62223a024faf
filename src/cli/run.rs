// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Run command - submit the pipeline

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, report, RunnerArgs};
use crate::runner::{Runner, RunnerParams};
use crate::utils::{create_spinner, print_info, print_success};

/// Submit the targets of an initialized pipeline
pub async fn run(
    pipeline_dir: PathBuf,
    runner_args: RunnerArgs,
    targets: Vec<String>,
    rerun_finished: bool,
    wait: bool,
    verbose: bool,
) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_dir)?;
    let params = runner_args.resolve(RunnerParams::load(pipeline.dir())?);

    let runner = Runner::for_pipeline(&pipeline, params).await?;
    runner.check_available().await?;
    // Saved parameters must keep describing the runner that owns the steps
    runner
        .check_ownership(&pipeline, &targets)
        .map_err(report)?;
    runner.params().save(pipeline.dir())?;

    if verbose {
        print_info(&format!("Runner: {}", runner.kind()));
    }

    println!("{}", format!("Submitting '{}'...", pipeline.name()).bold());
    let submitted = runner
        .submit_pipeline(&pipeline, &targets, !rerun_finished)
        .await
        .map_err(report)?;

    for (label, info) in &submitted {
        match info.as_ref().and_then(|i| i.main_task.as_ref()) {
            Some(handle) => print_success(&format!("{} {}", label, handle.to_string().dimmed())),
            None => println!("  {} {} (done)", "○".dimmed(), label.dimmed()),
        }
    }

    if wait {
        let spinner = create_spinner("Waiting for the targets to finish...");
        let result = runner.wait_for_pipeline(&pipeline, &targets).await;
        spinner.finish_and_clear();
        result.map_err(report)?;
        println!("{}", "All targets are done.".green().bold());
    }

    Ok(())
}
