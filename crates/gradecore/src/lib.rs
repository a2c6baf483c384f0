//! `gradecore`: a sandboxed grading engine with dependency-aware caching.
//!
//! This crate is a thin facade over the seven component crates:
//!
//! - [`gradecore_digest`] — content digests and canonical JSON.
//! - [`gradecore_config`] — scoped cache-level and compression overrides.
//! - [`gradecore_storage`] — content-addressed blob storage.
//! - [`gradecore_runner`] — resource-limited process execution.
//! - [`gradecore_sandbox`] — per-task scratch directories built on the runner.
//! - [`gradecore_grading`] — declarative I/O manifests and grading steps.
//! - [`gradecore_cache`] — the fingerprinting dependency cache.
//!
//! Most callers only need `gradecore::init_tracing` plus the re-exports
//! below; the submodules remain available under their own crate names for
//! anything not re-exported here.

pub use gradecore_cache::{cached, CacheFingerprint, CacheInput, CacheOutcome, DependencyCache};
pub use gradecore_config::{
    cache_level, check_integrity, enter_cache_level, use_compression, CacheLevel,
};
pub use gradecore_digest::{digest_bytes, digest_file};
pub use gradecore_grading::{
    compile, run, run_coordinated, validate_digest_sequencing, ArtifactManifest, DigestHolder,
    FifoDeclaration, InputDeclaration, InputSource, ManifestLogs, OutputDeclaration,
    PreprocessLog, RunLog, RunMetadata,
};
pub use gradecore_runner::{reap_group, Program, ProgramCode};
pub use gradecore_sandbox::{Sandbox, SandboxExitStatus, SandboxLog, SandboxParams};
pub use gradecore_storage::{BlobStore, FileCacher};

use std::io;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Compact single-line format, for interactive use.
    Compact,
    /// Structured JSON, for grading workers piping logs to a collector.
    Json,
}

/// Initializes a process-wide `tracing` subscriber writing to stderr.
///
/// Respects `RUST_LOG` if set; otherwise defaults every `gradecore*` target
/// to `level`. Intended to be called once, near the top of a binary's
/// `main`, mirroring how hosting CLIs wire up logging before touching any
/// sandbox or cache state. Panics if a global subscriber is already set.
pub fn init_tracing(format: TracingFormat, level: tracing::Level) {
    let level_str = level.as_str().to_lowercase();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gradecore={level_str},gradecore_digest={level_str},gradecore_config={level_str},\
             gradecore_storage={level_str},gradecore_runner={level_str},gradecore_sandbox={level_str},\
             gradecore_grading={level_str},gradecore_cache={level_str}"
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        TracingFormat::Compact => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_target(true);
            registry.with(layer).init();
        }
        TracingFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_current_span(true)
                .with_span_list(true);
            registry.with(layer).init();
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), ?format, "gradecore tracing initialized");
}
