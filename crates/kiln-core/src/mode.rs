//! Entry mode detection.
//!
//! The container entrypoint either drops into an interactive shell or runs
//! the unattended build. The decision depends only on whether stdin is a
//! terminal and on the first positional argument.

use std::io::{self, IsTerminal};

use serde::{Deserialize, Serialize};

/// Literal argument that forces interactive mode.
pub const SHELL_ARG: &str = "shell";

/// What the entrypoint should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// Hand control to an interactive shell.
    Interactive,
    /// Run the build state machine.
    Batch,
}

/// Snapshot of the process context relevant to mode detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessContext {
    pub stdin_is_terminal: bool,
    pub first_arg: Option<String>,
}

impl ProcessContext {
    pub fn new(stdin_is_terminal: bool, first_arg: Option<impl Into<String>>) -> Self {
        Self {
            stdin_is_terminal,
            first_arg: first_arg.map(Into::into),
        }
    }

    /// Probe stdin of the running process; `first_arg` is the first
    /// positional argument after option parsing.
    pub fn capture(first_arg: Option<String>) -> Self {
        Self {
            stdin_is_terminal: io::stdin().is_terminal(),
            first_arg,
        }
    }
}

/// Decide the entry mode. Pure and total.
pub fn detect_mode(ctx: &ProcessContext) -> EntryMode {
    if ctx.stdin_is_terminal || ctx.first_arg.as_deref() == Some(SHELL_ARG) {
        EntryMode::Interactive
    } else {
        EntryMode::Batch
    }
}
