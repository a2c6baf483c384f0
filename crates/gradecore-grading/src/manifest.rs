//! The declarative I/O description of one grading invocation, and the
//! write-once shared cells used to wire a producing output to a consuming
//! input across a list of manifests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use gradecore_sandbox::SandboxExitStatus;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A mutable, shared cell assigned once by a producing output and read by
/// zero or more later consumers.
#[derive(Debug, Clone, Default)]
pub struct DigestHolder {
    label: String,
    value: Arc<Mutex<Option<String>>>,
}

impl DigestHolder {
    /// Creates an unset holder, labeled for error messages.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// Assigns the digest. Fails if this holder already has a value.
    pub fn set(&self, digest: impl Into<String>) -> Result<(), Error> {
        let mut slot = self.value.lock().expect("digest holder mutex poisoned");
        if slot.is_some() {
            return Err(Error::DigestProducedTwice {
                label: self.label.clone(),
            });
        }
        *slot = Some(digest.into());
        Ok(())
    }

    /// Reads the digest. Fails if no producer has set it yet.
    pub fn get(&self) -> Result<String, Error> {
        self.value
            .lock()
            .expect("digest holder mutex poisoned")
            .clone()
            .ok_or_else(|| Error::DigestNotProduced {
                label: self.label.clone(),
            })
    }

    /// Reads the digest if already set, without failing.
    #[must_use]
    pub fn peek(&self) -> Option<String> {
        self.value.lock().expect("digest holder mutex poisoned").clone()
    }

    /// Clears a previously-assigned value, e.g. when a cache lookup that
    /// tentatively populated this holder turns out to be invalid and must be
    /// rolled back.
    pub fn reset(&self) {
        *self.value.lock().expect("digest holder mutex poisoned") = None;
    }
}

/// Where an input's bytes come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// A path under the manifest's `root`.
    Path(PathBuf),
    /// A blob store digest, possibly not yet produced.
    Digest(DigestHolder),
}

/// One declared input: a file materialized into the sandbox before the
/// command runs.
#[derive(Debug, Clone)]
pub struct InputDeclaration {
    /// Sandbox-relative destination.
    pub dest: PathBuf,
    /// Where the bytes come from.
    pub source: InputSource,
    /// Materialize with the execute bit set.
    pub executable: bool,
    /// Whether this input contributes to the cache fingerprint.
    pub hash: bool,
}

/// One declared output: a file harvested from the sandbox after the command
/// runs.
#[derive(Debug, Clone, Default)]
pub struct OutputDeclaration {
    /// Sandbox-relative source.
    pub src: PathBuf,
    /// Host-relative destination under `root`, if the caller wants a copy.
    pub dest: Option<PathBuf>,
    /// Receives the blob digest of the produced file, if set.
    pub digest: Option<DigestHolder>,
    /// Materialize at `dest` with the execute bit set.
    pub executable: bool,
    /// Missing is not an error.
    pub optional: bool,
    /// Not part of the cache fingerprint's `output_fingerprints`.
    pub intermediate: bool,
    /// Contributes to the cache fingerprint via its digest.
    pub hash: bool,
    /// Create an empty file at `src` before the command runs.
    pub touch: bool,
    /// Truncate the copy at `dest` to this many bytes.
    pub maxlen: Option<u64>,
}

/// A named pipe to create inside the sandbox before the command runs.
#[derive(Debug, Clone)]
pub struct FifoDeclaration {
    /// Sandbox-relative path of the fifo.
    pub path: PathBuf,
    /// If set, symlink `path` to this target instead of calling `mkfifo`.
    pub symlink: Option<PathBuf>,
}

/// Observable behavior of one process execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLog {
    /// Raw exit code.
    pub exit_code: i32,
    /// The sandbox-level classification.
    pub exit_status: SandboxExitStatus,
    /// Wall-clock time, in seconds.
    pub wall_time: f64,
    /// CPU time, in seconds.
    pub cpu_time: f64,
    /// Peak resident memory, in bytes.
    pub memory_used: u64,
    /// Sanitizer warning lines were detected on stderr.
    pub warnings: bool,
    /// Reap order among two coordinated processes.
    pub exit_index: Option<u8>,
    /// Caller-attached metadata (language tag, sanitizer flag, limits, ...).
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One compile command's recorded outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreprocessLog {
    /// The argv that was run.
    pub command: Vec<String>,
    /// The sandbox-level classification.
    pub exit_status: SandboxExitStatus,
    /// stdout and stderr, concatenated.
    pub combined_output: String,
    /// Sanitizer/compiler warning lines were detected.
    pub warnings: bool,
    /// Wall-clock time, in seconds.
    pub wall_time: f64,
    /// Peak resident memory, in bytes.
    pub memory_used: u64,
}

/// Where `compile`/`run`/`run_coordinated` record their logs, shared with the
/// caller so a cache block (C7) can read them back after a hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestLogs {
    /// One entry per compile command.
    pub preprocess: Vec<PreprocessLog>,
    /// The primary process's log, from `run` or `run_coordinated`.
    pub run: Option<RunLog>,
    /// The secondary (interactor) process's log, from `run_coordinated`.
    pub interactor_run: Option<RunLog>,
    /// Set only on a cache hit.
    pub cached: bool,
}

/// A declarative description of one invocation's I/O.
#[derive(Debug, Clone)]
pub struct ArtifactManifest {
    /// Host directory resolving `src`/`dest` of inputs and outputs.
    pub root: PathBuf,
    /// Files materialized into the sandbox before the command runs.
    pub inputs: Vec<InputDeclaration>,
    /// Files harvested from the sandbox after the command runs.
    pub outputs: Vec<OutputDeclaration>,
    /// Named pipes to create inside the sandbox.
    pub fifos: Vec<FifoDeclaration>,
    /// Optional sink for this invocation's logs.
    pub logs: Option<Arc<Mutex<ManifestLogs>>>,
}

impl ArtifactManifest {
    /// An empty manifest rooted at `root`, with no log sink.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            fifos: Vec::new(),
            logs: None,
        }
    }

    /// Attaches a fresh log sink, returning a handle the caller can read
    /// after the invocation completes.
    pub fn with_logs(mut self) -> (Self, Arc<Mutex<ManifestLogs>>) {
        let sink = Arc::new(Mutex::new(ManifestLogs::default()));
        self.logs = Some(Arc::clone(&sink));
        (self, sink)
    }
}

/// Validates that every input referencing a [`DigestHolder`] that some output
/// in the same manifest list is meant to produce references a holder that
/// either already has a value or will be produced by an earlier manifest.
/// Checked eagerly, before any manifest in the list runs.
pub fn validate_digest_sequencing(manifests: &[&ArtifactManifest]) -> Result<(), Error> {
    let mut produced: std::collections::HashSet<*const Mutex<Option<String>>> = std::collections::HashSet::new();
    for manifest in manifests {
        for input in &manifest.inputs {
            if let InputSource::Digest(holder) = &input.source {
                let ptr = Arc::as_ptr(&holder.value);
                if holder.peek().is_none() && !produced.contains(&ptr) {
                    return Err(Error::DigestNotProduced {
                        label: holder.label.clone(),
                    });
                }
            }
        }
        for output in &manifest.outputs {
            if let Some(holder) = &output.digest {
                let ptr = Arc::as_ptr(&holder.value);
                if !produced.insert(ptr) && holder.peek().is_none() {
                    return Err(Error::DigestProducedTwice {
                        label: holder.label.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
