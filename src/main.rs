// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! pipestep - pipeline step orchestrator
//!
//! Runs long pipeline steps as local processes, Slurm jobs or HyperQueue tasks.

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipestep::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "pipestep=debug"
    } else {
        "pipestep=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    match cli.command {
        Commands::Init { spec, pipeline_dir } => {
            pipestep::cli::init::run(spec, pipeline_dir, cli.verbose).await
        }
        Commands::Run {
            pipeline_dir,
            runner,
            target,
            rerun_finished,
            wait,
        } => {
            pipestep::cli::run::run(pipeline_dir, runner, target, rerun_finished, wait, cli.verbose)
                .await
        }
        Commands::Exec {
            pipeline_dir,
            label,
            target,
        } => pipestep::cli::exec::run(pipeline_dir, label, target).await,
        Commands::Status {
            pipeline_dir,
            check,
        } => pipestep::cli::status::run(pipeline_dir, check, cli.verbose).await,
        Commands::Stop {
            pipeline_dir,
            runner,
        } => pipestep::cli::stop::run(pipeline_dir, runner).await,
        Commands::Resubmit {
            pipeline_dir,
            label,
            all,
        } => pipestep::cli::resubmit::run(pipeline_dir, label, all).await,
        Commands::Graph { spec, format } => {
            pipestep::cli::graph::run(spec, format, cli.verbose).await
        }
        Commands::Validate { spec } => pipestep::cli::validate::run(spec, cli.verbose).await,
    }
}
