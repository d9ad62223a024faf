// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Commands delivered to a running main task
//!
//! Commands arrive concurrently with the main-task loop through two
//! transports: OS signals (`SIGTERM`/`SIGINT` terminate, `SIGUSR1` resubmits
//! keeping finished targets, `SIGUSR2` resubmits everything) and the step's
//! control record in the [`StateStore`]. Listeners only enqueue; the main
//! task consumes the queue from its poll step.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::PipestepResult;
use crate::store::StateStore;

/// A command for a step's main task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StepCommand {
    /// Mark the step failed, terminate tracked subtasks and exit
    Terminate,
    /// Replace the main task with a fresh submission
    Resubmit {
        /// Keep target files that already exist
        keep_finished: bool,
    },
}

impl std::fmt::Display for StepCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminate => write!(f, "terminate"),
            Self::Resubmit { keep_finished: true } => write!(f, "resubmit (keep finished)"),
            Self::Resubmit { keep_finished: false } => write!(f, "resubmit (all)"),
        }
    }
}

/// Queue of commands for one main task
pub struct CommandInbox {
    label: String,
    store: Arc<dyn StateStore>,
    tx: mpsc::UnboundedSender<StepCommand>,
    rx: mpsc::UnboundedReceiver<StepCommand>,
    listeners: Vec<JoinHandle<()>>,
}

impl CommandInbox {
    /// Create an inbox reading the step's control record
    pub fn new(label: &str, store: Arc<dyn StateStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            label: label.to_string(),
            store,
            tx,
            rx,
            listeners: Vec::new(),
        }
    }

    /// Sender for in-process command delivery
    pub fn sender(&self) -> mpsc::UnboundedSender<StepCommand> {
        self.tx.clone()
    }

    /// Spawn listeners translating OS signals into commands
    #[cfg(unix)]
    pub fn listen_os_signals(&mut self) -> PipestepResult<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mapping = [
            (SignalKind::terminate(), StepCommand::Terminate, "SIGTERM"),
            (SignalKind::interrupt(), StepCommand::Terminate, "SIGINT"),
            (
                SignalKind::user_defined1(),
                StepCommand::Resubmit { keep_finished: true },
                "SIGUSR1",
            ),
            (
                SignalKind::user_defined2(),
                StepCommand::Resubmit { keep_finished: false },
                "SIGUSR2",
            ),
        ];

        for (kind, command, name) in mapping {
            let mut stream = signal(kind)?;
            let tx = self.tx.clone();
            let label = self.label.clone();
            self.listeners.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    tracing::info!(step = %label, "Received {}, queueing {}", name, command);
                    if tx.send(command).is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn listen_os_signals(&mut self) -> PipestepResult<()> {
        let tx = self.tx.clone();
        self.listeners.push(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(StepCommand::Terminate);
            }
        }));
        Ok(())
    }

    /// Next pending command, from either transport
    pub fn poll(&mut self) -> PipestepResult<Option<StepCommand>> {
        if let Ok(command) = self.rx.try_recv() {
            return Ok(Some(command));
        }
        self.store.take_command(&self.label)
    }

    /// Discard every pending command
    pub fn drain(&mut self) -> PipestepResult<()> {
        while self.rx.try_recv().is_ok() {}
        self.store.take_command(&self.label)?;
        Ok(())
    }
}

impl Drop for CommandInbox {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}
