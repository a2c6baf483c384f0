//! Error types for the program runner.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while spawning or waiting on a child process.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// The child process could not be spawned.
    #[error("failed to spawn `{command}`: {source}")]
    #[diagnostic(code(gradecore::runner::spawn))]
    Spawn {
        /// The leader executable.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A redirection target could not be opened.
    #[error("failed to open redirection target {path}: {source}")]
    #[diagnostic(code(gradecore::runner::redirection))]
    Redirection {
        /// The path that failed to open.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// `wait4` failed (not the exit status of the child, the syscall itself).
    #[error("failed to wait for pid {pid}: {source}")]
    #[diagnostic(code(gradecore::runner::wait))]
    Wait {
        /// The pid that was being waited on.
        pid: i32,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}
