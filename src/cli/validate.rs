// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Validate command - check a pipeline definition

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use crate::pipeline::{DagBuilder, PipelineSpec, PipelineValidator};
use crate::step::KindRegistry;

/// Run the validate command
pub async fn run(spec_path: PathBuf, verbose: bool) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    let spec = match PipelineSpec::from_file(&spec_path) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("  {} Failed to parse pipeline", "✗".red());
            eprintln!();
            return Err(e.into());
        }
    };

    println!("  {} Pipeline file is valid YAML", "✓".green());

    let registry = KindRegistry::builtin();
    let validation = PipelineValidator::validate(&spec, &registry);

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose && validation.is_valid() {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", spec.name);
        println!("  Targets: {}", spec.effective_targets().join(", "));
        if let Ok(dag) = DagBuilder::build(&spec) {
            for line in dag.to_text(&spec)?.lines() {
                println!("    {}", line.dimmed());
            }
        }
    }

    println!();

    if !validation.is_valid() {
        return Err(miette::miette!("Pipeline validation failed"));
    }
    if validation.has_warnings() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
    }
    Ok(())
}
