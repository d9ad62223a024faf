// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Init command - create the step directories of a pipeline

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::report;
use crate::pipeline::{PipelineGraph, PipelineSpec, PipelineValidator};
use crate::step::KindRegistry;
use crate::utils::{print_error, print_success, print_warning};

/// Run the init command
pub async fn run(spec_path: PathBuf, pipeline_dir: PathBuf, verbose: bool) -> Result<()> {
    let spec = PipelineSpec::from_file(&spec_path)?;
    let registry = KindRegistry::builtin();

    let validation = PipelineValidator::validate(&spec, &registry);
    if !validation.is_valid() {
        eprintln!("{}", "Pipeline validation failed:".red().bold());
        for error in &validation.errors {
            print_error(error);
        }
        return Err(miette::miette!("Pipeline definition is invalid"));
    }
    if verbose {
        for warning in &validation.warnings {
            print_warning(warning);
        }
    }

    let pipeline = PipelineGraph::new(&spec, &registry, &pipeline_dir)
        .build()
        .map_err(report)?;
    pipeline.init().map_err(report)?;

    println!(
        "{} pipeline '{}' in {}",
        "Initialized".green().bold(),
        pipeline.name(),
        pipeline_dir.display()
    );
    for status in pipeline.status()? {
        if let Some(state) = status.state {
            print_success(&format!("{} ({}): {}", status.label, status.kind, state));
        }
    }

    Ok(())
}
