// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Step lifecycle states
//!
//! A step without a persisted state has not been created yet. Transitions
//! follow a fixed lattice:
//!
//! ```text
//! <none> ──> INIT_INCOMPLETE ──> INITED ──> SUBMITTED ──> RUNNING ──> DONE
//!                 ^    │                       ^  │  ^        │
//!                 └────┘                       │  └──┼────────┤
//!                                              │     │        v
//!                                              └──── FAILED <─┘
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Persisted state of a step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Initialization started but did not finish (crash or cycle guard)
    InitIncomplete,
    /// Directories, parameters and entry point are in place
    Inited,
    /// The main task was handed to a backend
    Submitted,
    /// The main task is running and its subtasks are submitted
    Running,
    /// A task failed or the step was terminated
    Failed,
    /// Every target file exists
    Done,
}

impl StepState {
    /// All states, in lifecycle order
    pub const ALL: [StepState; 6] = [
        Self::InitIncomplete,
        Self::Inited,
        Self::Submitted,
        Self::Running,
        Self::Failed,
        Self::Done,
    ];

    /// Whether `from -> to` is allowed (`from == None` means not created)
    pub fn can_transition(from: Option<Self>, to: Self) -> bool {
        use StepState::*;

        match (from, to) {
            (None, InitIncomplete) => true,
            (Some(InitIncomplete), InitIncomplete | Inited) => true,
            (Some(Inited), Submitted) => true,
            // Submitted -> Submitted happens when a queued main task is replaced
            (Some(Submitted), Submitted | Running | Failed) => true,
            (Some(Running), Submitted | Done | Failed) => true,
            (Some(Failed), Submitted) => true,
            _ => false,
        }
    }

    /// Whether a main task for this step may be live on some backend
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitIncomplete => write!(f, "INIT_INCOMPLETE"),
            Self::Inited => write!(f, "INITED"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Failed => write!(f, "FAILED"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.to_string() == s.trim())
            .ok_or_else(|| format!("Unknown step state: {}", s))
    }
}
