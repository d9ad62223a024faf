// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Terminal color utilities
//!
//! Provides consistent color schemes across the CLI.

use colored::{ColoredString, Colorize};

use crate::step::StepState;

/// Colored name of a step state
pub fn state_label(state: Option<StepState>) -> ColoredString {
    let Some(state) = state else {
        return "NOT CREATED".dimmed();
    };

    let name = state.to_string();
    match state {
        StepState::InitIncomplete => name.red(),
        StepState::Inited => name.normal(),
        StepState::Submitted => name.cyan(),
        StepState::Running => name.blue().bold(),
        StepState::Failed => name.red().bold(),
        StepState::Done => name.green(),
    }
}

/// Print a styled header
pub fn print_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "═".repeat(title.len().max(40)));
}

/// Print a success check
pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

/// Print an error cross
pub fn print_error(msg: &str) {
    println!("  {} {}", "✗".red(), msg);
}

/// Print a warning
pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠".yellow(), msg);
}

/// Print an info item
pub fn print_info(msg: &str) {
    println!("  {} {}", "→".blue(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_label_text() {
        colored::control::set_override(false);
        assert_eq!(state_label(None).to_string(), "NOT CREATED");
        assert_eq!(state_label(Some(StepState::Done)).to_string(), "DONE");
    }
}
