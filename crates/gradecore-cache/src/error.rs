//! Error types for the dependency cache.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while looking up, verifying, or storing a cache entry.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// A cached file's content no longer matches the digest that was stored
    /// for it: something outside the cache modified it.
    #[error("cache was tampered with: file {path} has changed since it was cached")]
    #[diagnostic(
        code(gradecore::cache::tampered),
        help("clear the dependency-cache directory and re-run to rebuild a trustworthy cache")
    )]
    Tampered {
        /// The host-side path whose content no longer matches.
        path: PathBuf,
    },

    /// The underlying SQLite database could not be opened or queried.
    #[error("dependency cache database error: {source}")]
    #[diagnostic(code(gradecore::cache::database))]
    Database {
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A stored `CacheFingerprint` failed to deserialize; the entry is
    /// treated as corrupt rather than propagated as a hard failure.
    #[error("cache entry for key {key} is corrupt: {source}")]
    #[diagnostic(
        code(gradecore::cache::corrupt_entry),
        help("this entry will be evicted automatically on the next lookup")
    )]
    CorruptEntry {
        /// The cache key whose stored value failed to parse.
        key: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A filesystem operation while fingerprinting or rematerializing an
    /// artifact failed.
    #[error("failed to {operation} {path}: {source}")]
    #[diagnostic(code(gradecore::cache::io))]
    Io {
        /// The path involved.
        path: PathBuf,
        /// What was being attempted.
        operation: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A grading step (staging, command shaping, harvest) failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Grading(#[from] gradecore_grading::Error),

    /// A blob store operation failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] gradecore_storage::Error),
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

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Database { source }
    }
}
