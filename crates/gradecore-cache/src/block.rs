//! The transactional cache-block orchestration (§4.7's `with cache(...) as
//! hit:` scaffold), reimplemented as an async function plus a sentinel
//! return type instead of an exception.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;

use gradecore_config::CacheLevel;
use gradecore_grading::ArtifactManifest;
use gradecore_storage::FileCacher;

use crate::backend::DependencyCache;
use crate::error::Error;
use crate::key::{compute_fingerprint, CacheFingerprint, CacheInput};

/// What a cache block's body wants to happen to its result: `Store` records
/// a fresh fingerprint on clean exit, `Skip` runs the body but (like the
/// reference implementation's swallowed `NoCacheException`) leaves any
/// existing entry untouched and stores nothing new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome<T> {
    /// Store a fresh fingerprint after this body run.
    Store(T),
    /// Run, but do not record or evict any cache entry.
    Skip(T),
}

impl<T> CacheOutcome<T> {
    /// The wrapped value, regardless of which variant.
    pub fn into_inner(self) -> T {
        match self {
            Self::Store(value) | Self::Skip(value) => value,
        }
    }
}

fn are_artifacts_ok(manifests: &[&ArtifactManifest], cacher: &FileCacher) -> bool {
    for manifest in manifests {
        for output in &manifest.outputs {
            if output.optional {
                continue;
            }
            let has_digest = output.digest.as_ref().and_then(gradecore_grading::DigestHolder::peek).is_some_and(|d| cacher.exists(&d));
            let has_dest = output.dest.as_ref().is_some_and(|dest| {
                let path = manifest.root.join(dest);
                if !path.is_file() {
                    return false;
                }
                if output.executable {
                    std::fs::metadata(&path).map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
                } else {
                    true
                }
            });
            if !has_digest && !has_dest {
                return false;
            }
        }
    }
    true
}

fn verify_integrity(manifests: &[&ArtifactManifest], cacher: &FileCacher) -> Result<(), Error> {
    if !gradecore_config::check_integrity() {
        return Ok(());
    }
    for manifest in manifests {
        for output in &manifest.outputs {
            if !output.hash {
                continue;
            }
            let Some(dest) = &output.dest else { continue };
            let host_dest = manifest.root.join(dest);
            if !host_dest.is_file() {
                continue;
            }
            let Some(symlink_digest) = cacher.digest_from_symlink(&host_dest)? else {
                continue;
            };
            let actual = gradecore_digest::digest_file(&host_dest).map_err(|source| Error::Io {
                path: host_dest.clone(),
                operation: "hash cached output for integrity check",
                source: std::io::Error::other(source),
            })?;
            if actual != symlink_digest {
                return Err(Error::Tampered { path: host_dest });
            }
        }
    }
    Ok(())
}

fn clear_output_holders(manifests: &[&ArtifactManifest]) {
    for manifest in manifests {
        for output in &manifest.outputs {
            if let Some(holder) = &output.digest {
                holder.reset();
            }
        }
    }
}

fn rematerialize_outputs(manifests: &[&ArtifactManifest], fingerprint: &CacheFingerprint, cacher: &FileCacher) -> Result<(), Error> {
    let mut digest_index = 0;
    for manifest in manifests {
        for output in &manifest.outputs {
            if output.digest.is_none() && !output.hash {
                continue;
            }
            let Some(Some(digest)) = fingerprint.digests.get(digest_index) else {
                digest_index += 1;
                continue;
            };
            digest_index += 1;
            if let Some(holder) = &output.digest {
                holder.set(digest.clone())?;
            }
            let Some(dest) = &output.dest else { continue };
            let host_dest = manifest.root.join(dest);
            if let Some(parent) = host_dest.parent() {
                std::fs::create_dir_all(parent).map_err(|source| Error::io(source, dest, "create destination directory"))?;
            }
            match cacher.path_for_symlink(digest)? {
                Some(target) if output.maxlen.is_none() => {
                    let _ = std::fs::remove_file(&host_dest);
                    std::os::unix::fs::symlink(&target, &host_dest).map_err(|source| Error::io(source, dest, "symlink output"))?;
                }
                _ => {
                    let mut contents = cacher.get_file_content(digest)?;
                    if let Some(maxlen) = output.maxlen {
                        contents.truncate(usize::try_from(maxlen).unwrap_or(usize::MAX));
                    }
                    std::fs::write(&host_dest, &contents).map_err(|source| Error::io(source, dest, "write output"))?;
                }
            }
            if output.executable {
                let _ = std::fs::set_permissions(&host_dest, std::fs::Permissions::from_mode(0o755));
            }
        }
    }
    Ok(())
}

fn restore_logs(manifests: &[&ArtifactManifest], fingerprint: &CacheFingerprint) {
    let mut logs_index = 0;
    for manifest in manifests {
        let Some(sink) = &manifest.logs else { continue };
        if let Some(stored) = fingerprint.logs.get(logs_index) {
            let mut logs = sink.lock().expect("manifest log sink poisoned");
            *logs = stored.clone();
            logs.cached = true;
        }
        logs_index += 1;
    }
}

/// Runs `body` only if no valid cache entry exists for `manifests` +
/// `extra_params`; otherwise rematerializes the prior outputs and logs.
/// Returns `true` on a cache hit.
#[tracing::instrument(skip_all)]
pub async fn cached<T, F, Fut>(
    manifests: &[&ArtifactManifest],
    cacher: &FileCacher,
    backend: &DependencyCache,
    extra_params: serde_json::Value,
    body: F,
) -> Result<bool, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CacheOutcome<T>, Error>>,
{
    gradecore_grading::validate_digest_sequencing(manifests)?;

    let level = gradecore_config::cache_level();
    if level == CacheLevel::NoCache {
        body().await?;
        return Ok(false);
    }

    let cache_input = CacheInput::build(manifests, cacher, extra_params)?;
    let key = cache_input.key();

    if let Some(fingerprint) = backend.lookup(&key).await? {
        let (current_fingerprints, current_output_fingerprints) = crate::key::compute_invalidation_probe(manifests, cacher)?;
        let invalidated = current_fingerprints != fingerprint.fingerprints || current_output_fingerprints != fingerprint.output_fingerprints;

        if !invalidated {
            verify_integrity(manifests, cacher)?;
            rematerialize_outputs(manifests, &fingerprint, cacher)?;
            if are_artifacts_ok(manifests, cacher) {
                restore_logs(manifests, &fingerprint);
                return Ok(true);
            }
            clear_output_holders(manifests);
        }
        backend.evict(&key).await?;
    }

    let outcome = body().await?;
    if let CacheOutcome::Store(_) = outcome {
        if are_artifacts_ok(manifests, cacher) {
            let fresh = compute_fingerprint(manifests, cacher)?;
            backend.store(&key, &fresh).await?;
        }
    }
    Ok(false)
}
