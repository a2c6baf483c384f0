//! Error types for the sandbox.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while preparing or running inside a sandbox scratch
/// directory.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// The scratch directory itself could not be created.
    #[error("failed to create sandbox scratch directory: {source}")]
    #[diagnostic(code(gradecore::sandbox::scratch))]
    Scratch {
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A filesystem operation inside the sandbox failed.
    #[error("failed to {operation} {path}: {source}")]
    #[diagnostic(code(gradecore::sandbox::io))]
    Io {
        /// The path the operation targeted, relative to the sandbox root.
        path: PathBuf,
        /// What was being attempted, e.g. `"create file"`.
        operation: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A glob pattern was not valid.
    #[error("invalid glob pattern `{pattern}`: {source}")]
    #[diagnostic(code(gradecore::sandbox::glob))]
    Glob {
        /// The offending pattern.
        pattern: String,
        /// The underlying parse error.
        #[source]
        source: glob::PatternError,
    },

    /// A blob store operation failed while staging or harvesting a file.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] gradecore_storage::Error),

    /// The program runner failed to spawn or wait on a process.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runner(#[from] gradecore_runner::Error),
}

impl Error {
    /// Builds an [`Error::Io`] from a path, an operation label, and the
    /// underlying OS error.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>, operation: &'static str) -> Self {
        Self::Io {
            path: path.into(),
            operation,
            source,
        }
    }
}
