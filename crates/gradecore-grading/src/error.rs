//! Error types for the grading steps.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while staging inputs, shaping a command, running it, or
/// harvesting outputs.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// A required (non-optional) output was not produced.
    #[error("required output `{path}` was not produced by the command")]
    #[diagnostic(
        code(gradecore::grading::missing_output),
        help("mark the output `optional` if it is not always produced, or check the command's exit status")
    )]
    MissingOutput {
        /// The sandbox-relative path that was expected.
        path: PathBuf,
    },

    /// A `DigestHolder` was read before any producer set it.
    #[error("digest for `{label}` was consumed before it was produced")]
    #[diagnostic(
        code(gradecore::grading::digest_not_produced),
        help("declare the producing output earlier in the manifest list than this consumer")
    )]
    DigestNotProduced {
        /// A human-readable label for the holder (its declared path).
        label: String,
    },

    /// A `DigestHolder` was set a second time within one invocation.
    #[error("digest for `{label}` was produced more than once")]
    #[diagnostic(
        code(gradecore::grading::digest_produced_twice),
        help("each DigestHolder may be assigned by exactly one output per cache-block invocation")
    )]
    DigestProducedTwice {
        /// A human-readable label for the holder.
        label: String,
    },

    /// GCC cannot sanitize on macOS; this is a host-level limitation, not a
    /// solution bug.
    #[error("sanitizer flags were requested with GCC on macOS, which GCC cannot honor there")]
    #[diagnostic(
        code(gradecore::grading::sanitizer_unsupported),
        help("use Clang on macOS when sanitizer instrumentation is required")
    )]
    SanitizerUnsupportedOnMacosGcc,

    /// A filesystem operation while staging or harvesting failed.
    #[error("failed to {operation} {path}: {source}")]
    #[diagnostic(code(gradecore::grading::io))]
    Io {
        /// The path involved.
        path: PathBuf,
        /// What was being attempted.
        operation: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The sandbox failed to spawn or supervise a command.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sandbox(#[from] gradecore_sandbox::Error),

    /// A blob store operation failed while staging or harvesting.
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
