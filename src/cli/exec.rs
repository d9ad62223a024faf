// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Exec command - the process side of a step's entry point
//!
//! Without a target this runs the main task; with one it computes that
//! single target file.

use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, report, saved_runner};
use crate::step::{MainTask, MainTaskOutcome};

/// Run a main task or a subtask
pub async fn run(pipeline_dir: PathBuf, label: String, target: Option<PathBuf>) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_dir)?;
    let step = pipeline.step(&label)?.clone();

    match target {
        Some(target) => {
            step.run_subtask_until(&target, terminated())
                .await
                .map_err(report)?;
        }
        None => {
            let runner = saved_runner(&pipeline).await?;
            let outcome = MainTask::new(&pipeline, step, &runner)
                .listen_os_signals()?
                .run()
                .await
                .map_err(report)?;

            if let MainTaskOutcome::Resubmitted(info) = outcome {
                if let Some(handle) = info.main_task {
                    tracing::info!(step = %label, "Handed over to {}", handle);
                }
            }
        }
    }

    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT
async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
            }
            _ => std::future::pending::<()>().await,
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
