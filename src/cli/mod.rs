// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for pipestep.

pub mod exec;
pub mod graph;
pub mod init;
pub mod resubmit;
pub mod run;
pub mod status;
pub mod stop;
pub mod validate;

use clap::{Parser, Subcommand};
use miette::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{PipestepError, RecoverySuggestion};
use crate::pipeline::Pipeline;
use crate::runner::{Runner, RunnerKind, RunnerParams};
use crate::step::KindRegistry;

/// Pipeline step orchestrator
///
/// Runs multi-step pipelines as local processes, Slurm jobs or HyperQueue
/// tasks, and recovers them after crashes and time limits.
#[derive(Parser, Debug)]
#[clap(
    name = "pipestep",
    version,
    about = "Orchestrate long-running pipeline steps on local, Slurm or HyperQueue backends",
    long_about = None,
    after_help = "Examples:\n\
        pipestep init pipeline.yaml -p runs/exp1     Create the step directories\n\
        pipestep run -p runs/exp1 --runner slurm     Submit every target step\n\
        pipestep status -p runs/exp1                 Show step states\n\
        pipestep resubmit -p runs/exp1 train         Restart a step's main task\n\n\
        See 'pipestep <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a pipeline from its definition and initialize its steps
    Init {
        /// Pipeline definition file
        #[clap(default_value = "pipeline.yaml")]
        spec: PathBuf,

        /// Directory the steps are created in
        #[clap(short, long = "pipeline-dir", default_value = ".")]
        pipeline_dir: PathBuf,
    },

    /// Submit the target steps and everything they depend on
    Run {
        #[clap(short, long = "pipeline-dir", default_value = ".")]
        pipeline_dir: PathBuf,

        #[clap(flatten)]
        runner: RunnerArgs,

        /// Submit only these steps (and their dependencies)
        #[clap(short, long)]
        target: Vec<String>,

        /// Recompute finished target files of failed steps
        #[clap(long)]
        rerun_finished: bool,

        /// Block until the targets are done
        #[clap(short, long)]
        wait: bool,
    },

    /// Run a step's main task, or one subtask when a target is given
    ///
    /// This is what the generated entry points call.
    Exec {
        #[clap(short, long = "pipeline-dir", default_value = ".")]
        pipeline_dir: PathBuf,

        /// Step label
        label: String,

        /// Target file to compute
        target: Option<PathBuf>,
    },

    /// Show the state of every step
    Status {
        #[clap(short, long = "pipeline-dir", default_value = ".")]
        pipeline_dir: PathBuf,

        /// Ask the backend whether active steps are still alive
        #[clap(long)]
        check: bool,
    },

    /// Cancel every active step and mark it failed
    Stop {
        #[clap(short, long = "pipeline-dir", default_value = ".")]
        pipeline_dir: PathBuf,

        /// Stop with this backend instead of the saved one
        #[clap(short, long, value_enum)]
        runner: Option<RunnerKind>,
    },

    /// Replace a step's main task with a fresh submission
    Resubmit {
        #[clap(short, long = "pipeline-dir", default_value = ".")]
        pipeline_dir: PathBuf,

        /// Step label
        label: String,

        /// Recompute target files that already exist
        #[clap(long)]
        all: bool,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline definition file
        #[clap(default_value = "pipeline.yaml")]
        spec: PathBuf,

        /// Output format
        #[clap(short, long, default_value = "text")]
        format: GraphFormat,
    },

    /// Validate a pipeline definition
    Validate {
        /// Pipeline definition file
        #[clap(default_value = "pipeline.yaml")]
        spec: PathBuf,
    },
}

/// Runner selection, with environment fallbacks
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunnerArgs {
    /// Backend (default: the one used last, else local)
    #[clap(short, long, env = "PIPESTEP_RUNNER", value_enum)]
    pub runner: Option<RunnerKind>,

    /// Slurm partition
    #[clap(long, env = "PIPESTEP_PARTITION")]
    pub partition: Option<String>,

    /// Slurm account
    #[clap(long, env = "PIPESTEP_ACCOUNT")]
    pub account: Option<String>,

    /// Extra sbatch argument (repeatable)
    #[clap(long = "sbatch-arg", allow_hyphen_values = true)]
    pub sbatch_args: Vec<String>,

    /// Existing HyperQueue job to add tasks to
    #[clap(long, env = "PIPESTEP_HQ_JOB")]
    pub hq_job: Option<u64>,

    /// Backend poll interval in milliseconds
    #[clap(long, env = "PIPESTEP_POLL_INTERVAL", value_name = "MS")]
    pub poll_interval: Option<u64>,
}

impl RunnerArgs {
    /// Apply the arguments to the saved parameters
    ///
    /// Choosing another backend starts from that backend's defaults.
    pub fn resolve(&self, saved: Option<RunnerParams>) -> RunnerParams {
        let mut params = match (saved, self.runner) {
            (Some(saved), Some(kind)) if saved.kind != kind => RunnerParams::new(kind),
            (Some(saved), _) => saved,
            (None, kind) => RunnerParams::new(kind.unwrap_or(RunnerKind::Local)),
        };

        if let Some(partition) = &self.partition {
            params.slurm.partition = Some(partition.clone());
        }
        if let Some(account) = &self.account {
            params.slurm.account = Some(account.clone());
        }
        if !self.sbatch_args.is_empty() {
            params.slurm.extra_args = self.sbatch_args.clone();
        }
        if let Some(job) = self.hq_job {
            params.queue.job = Some(job);
        }
        if let Some(ms) = self.poll_interval {
            params.poll_interval_ms = ms;
        }
        params
    }
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

impl std::str::FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "dot" => Ok(Self::Dot),
            "mermaid" => Ok(Self::Mermaid),
            _ => Err(format!("Unknown graph format: {}", s)),
        }
    }
}

/// Print how to recover from an error before handing it to miette
pub(crate) fn report(error: PipestepError) -> miette::Report {
    if let Some(suggestion) = RecoverySuggestion::for_error(&error) {
        eprintln!("{}", suggestion);
    }
    error.into()
}

/// Load an initialized pipeline with the built-in kinds
pub(crate) fn load_pipeline(dir: &Path) -> Result<Arc<Pipeline>> {
    let registry = KindRegistry::builtin();
    Ok(Arc::new(Pipeline::load(dir, &registry)?))
}

/// Rebuild the runner that submitted the pipeline
pub(crate) async fn saved_runner(pipeline: &Arc<Pipeline>) -> Result<Arc<Runner>> {
    let params = saved_params(pipeline)?;
    Ok(Runner::for_pipeline(pipeline, params).await?)
}

pub(crate) fn saved_params(pipeline: &Pipeline) -> Result<RunnerParams> {
    RunnerParams::load(pipeline.dir())?.ok_or_else(|| {
        miette::miette!(
            help = "Run 'pipestep run' first",
            "No runner parameters in {}",
            pipeline.dir().display()
        )
    })
}
