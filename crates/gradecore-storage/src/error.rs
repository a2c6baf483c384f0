//! Error types for the blob store and file cacher.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by [`crate::blobstore::BlobStore`] and [`crate::filecacher::FileCacher`].
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// An I/O error occurred against the store or scratch directory.
    #[error("I/O error during {operation} on {path}: {source}")]
    #[diagnostic(code(gradecore::storage::io))]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// The path involved.
        path: PathBuf,
        /// What was being attempted.
        operation: &'static str,
    },

    /// No blob exists under the given digest.
    #[error("no blob found for digest {digest}")]
    #[diagnostic(
        code(gradecore::storage::not_found),
        help("the producer of this digest may not have committed yet, or it was evicted")
    )]
    NotFound {
        /// The digest that was looked up.
        digest: String,
    },

    /// The tombstone sentinel digest (`"x"`) was read.
    #[error("digest is a tombstone and cannot be read")]
    #[diagnostic(
        code(gradecore::storage::tombstone),
        help("this digest was explicitly deleted; re-run whatever step produces it")
    )]
    Tombstone,

    /// A metadata entry failed to (de)serialize.
    #[error("failed to (de)serialize metadata for digest {digest}, key {key}: {message}")]
    #[diagnostic(code(gradecore::storage::metadata))]
    Metadata {
        /// The digest the metadata is attached to.
        digest: String,
        /// The metadata key.
        key: String,
        /// The serde error message.
        message: String,
    },

    /// A symlink resolved outside the store root, or exceeded the bounded
    /// chain-following depth, or formed a cycle.
    #[error("symlink at {path} does not resolve to a regular file inside the store")]
    #[diagnostic(code(gradecore::storage::symlink_escape))]
    SymlinkEscape {
        /// The symlink that was being followed.
        path: PathBuf,
    },

    /// A cached file was tampered with out-of-band: its current content does not
    /// match the digest recorded when it was cached.
    #[error("cache entry at {path} was modified outside the cache and no longer matches its recorded digest")]
    #[diagnostic(
        code(gradecore::storage::tampered),
        help("delete the dependency-cache directory and re-run to rebuild it from scratch")
    )]
    Tampered {
        /// The file that failed its integrity check.
        path: PathBuf,
    },
}

impl Error {
    /// Builds an [`Error::Io`] for a failure against `path`.
    #[must_use]
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>, operation: &'static str) -> Self {
        Self::Io {
            source,
            path: path.into(),
            operation,
        }
    }
}
