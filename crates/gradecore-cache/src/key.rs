//! `CacheInput` (the key material) and `CacheFingerprint` (the stored
//! verification record), built by deeply snapshotting an `ArtifactManifest`
//! list with everything irrelevant to cache identity stripped out.

use std::path::{Path, PathBuf};

use gradecore_grading::{ArtifactManifest, InputSource, ManifestLogs};
use gradecore_storage::FileCacher;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize)]
struct CacheInputInput {
    dest: PathBuf,
    src: Option<PathBuf>,
    digest: Option<String>,
    executable: bool,
    hash: bool,
}

#[derive(Debug, Clone, Serialize)]
struct CacheInputOutput {
    src: PathBuf,
    dest: Option<PathBuf>,
    executable: bool,
    optional: bool,
    intermediate: bool,
    hash: bool,
    touch: bool,
    maxlen: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct CacheInputManifest {
    root: PathBuf,
    inputs: Vec<CacheInputInput>,
    outputs: Vec<CacheInputOutput>,
    fifos: Vec<PathBuf>,
}

/// The key material for one cache block invocation: every manifest with
/// logs cleared, symlinked inputs resolved to their digest, hashed outputs'
/// placement stripped, and not-yet-produced digests left as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInput {
    manifests: Vec<CacheInputManifest>,
    extra_params: serde_json::Value,
}

fn snapshot_manifest(manifest: &ArtifactManifest, cacher: &FileCacher) -> Result<CacheInputManifest, Error> {
    let mut inputs = Vec::with_capacity(manifest.inputs.len());
    for input in &manifest.inputs {
        let (src, digest) = match &input.source {
            InputSource::Path(path) => {
                let host_path = manifest.root.join(path);
                match cacher.digest_from_symlink(&host_path)? {
                    Some(digest) => (None, Some(digest)),
                    None => (Some(path.clone()), None),
                }
            }
            InputSource::Digest(holder) => (None, holder.peek()),
        };
        inputs.push(CacheInputInput {
            dest: input.dest.clone(),
            src,
            digest,
            executable: input.executable,
            hash: input.hash,
        });
    }

    let outputs = manifest
        .outputs
        .iter()
        .map(|output| CacheInputOutput {
            src: output.src.clone(),
            dest: if output.hash { None } else { output.dest.clone() },
            executable: output.executable,
            optional: output.optional,
            intermediate: output.intermediate,
            hash: output.hash,
            touch: output.touch,
            maxlen: output.maxlen,
        })
        .collect();

    let fifos = manifest.fifos.iter().map(|f| f.path.clone()).collect();

    Ok(CacheInputManifest {
        root: manifest.root.clone(),
        inputs,
        outputs,
        fifos,
    })
}

impl CacheInput {
    /// Builds the key material from a manifest list and the caller's extra
    /// cacheable parameters (e.g. language, limits).
    pub fn build(manifests: &[&ArtifactManifest], cacher: &FileCacher, extra_params: serde_json::Value) -> Result<Self, Error> {
        let manifests = manifests.iter().map(|m| snapshot_manifest(m, cacher)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { manifests, extra_params })
    }

    /// The SHA-1 of this input's canonical JSON serialization, as 40 lower-
    /// case hex characters.
    #[must_use]
    pub fn key(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("CacheInput always serializes");
        gradecore_digest::digest_bytes(&canonical)
    }
}

/// The stored verification record for one cache key: enough to decide
/// whether a hit is still valid, and to rematerialize its outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheFingerprint {
    /// The resolved digest for every output that declared one, in
    /// declaration order across all manifests; `None` for outputs that
    /// don't carry a digest.
    pub digests: Vec<Option<String>>,
    /// SHA-1 of every hashed input whose `src` was not already a symlink
    /// into the blob store, in declaration order.
    pub fingerprints: Vec<String>,
    /// SHA-1 of the file at `dest` for every non-hashed, non-intermediate
    /// output with a `dest` (or the empty string if absent), in declaration
    /// order.
    pub output_fingerprints: Vec<String>,
    /// The recorded logs for every manifest that declared a log sink.
    pub logs: Vec<ManifestLogs>,
}

fn hash_file_or_empty(path: &Path) -> Result<String, Error> {
    if path.is_file() {
        gradecore_digest::digest_file(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            operation: "hash file",
            source: std::io::Error::other(source),
        })
    } else {
        Ok(String::new())
    }
}

/// Recomputes a [`CacheFingerprint`] from the manifests' *current* state
/// (after the body has run, so output digests are populated).
pub fn compute_fingerprint(manifests: &[&ArtifactManifest], cacher: &FileCacher) -> Result<CacheFingerprint, Error> {
    let mut digests = Vec::new();
    let mut fingerprints = Vec::new();
    let mut output_fingerprints = Vec::new();
    let mut logs = Vec::new();

    for manifest in manifests {
        for input in &manifest.inputs {
            if !input.hash {
                continue;
            }
            if let InputSource::Path(path) = &input.source {
                let host_path = manifest.root.join(path);
                if cacher.digest_from_symlink(&host_path)?.is_none() {
                    fingerprints.push(hash_file_or_empty(&host_path)?);
                }
            }
        }
        for output in &manifest.outputs {
            if output.digest.is_some() || output.hash {
                digests.push(output.digest.as_ref().and_then(gradecore_grading::DigestHolder::peek));
            }
            if !output.hash && !output.intermediate {
                if let Some(dest) = &output.dest {
                    let host_dest = manifest.root.join(dest);
                    output_fingerprints.push(hash_file_or_empty(&host_dest)?);
                }
            }
        }
        if let Some(sink) = &manifest.logs {
            logs.push(sink.lock().expect("manifest log sink poisoned").clone());
        }
    }

    Ok(CacheFingerprint {
        digests,
        fingerprints,
        output_fingerprints,
        logs,
    })
}

/// Recomputes only the parts of a [`CacheFingerprint`] that must match the
/// *pre-run* manifest state for a stored entry to still be a valid hit:
/// hashed-input content and non-hashed-output content on disk.
pub fn compute_invalidation_probe(manifests: &[&ArtifactManifest], cacher: &FileCacher) -> Result<(Vec<String>, Vec<String>), Error> {
    let fingerprint = compute_fingerprint(manifests, cacher)?;
    Ok((fingerprint.fingerprints, fingerprint.output_fingerprints))
}
