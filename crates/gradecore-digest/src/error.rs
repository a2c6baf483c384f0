//! Error types for streaming digest computation.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors that can occur while computing a digest.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// An I/O error occurred while reading the stream or file being digested.
    #[error("I/O error during {operation} on {path}: {source}")]
    #[diagnostic(
        code(gradecore::digest::io),
        help("check that the path exists and is readable")
    )]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// The path involved, if any (empty for anonymous streams).
        path: PathBuf,
        /// What was being attempted.
        operation: &'static str,
    },
}

impl Error {
    /// Builds an [`Error::Io`] for a failure opening or reading a file.
    #[must_use]
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>, operation: &'static str) -> Self {
        Self::Io {
            source,
            path: path.into(),
            operation,
        }
    }
}
