//! The transactional dependency cache (C7): fingerprints a grading
//! invocation's declared I/O, looks it up in a SQLite-backed key→value
//! store, and on a miss lets the caller's grading step (C6) run and store a
//! fresh fingerprint on clean exit.

pub mod backend;
pub mod block;
pub mod error;
pub mod key;

pub use backend::DependencyCache;
pub use block::{cached, CacheOutcome};
pub use error::Error;
pub use key::{CacheFingerprint, CacheInput};

#[cfg(test)]
mod tests {
    use super::*;
    use gradecore_grading::{ArtifactManifest, DigestHolder, OutputDeclaration, RunMetadata};
    use gradecore_sandbox::{Sandbox, SandboxParams};
    use gradecore_storage::{BlobStore, FileCacher};
    use std::sync::Arc;

    fn new_cacher() -> (FileCacher, tempfile::TempDir, tempfile::TempDir) {
        let store_dir = tempfile::tempdir().expect("store dir");
        let scratch_dir = tempfile::tempdir().expect("scratch dir");
        let backend = Arc::new(BlobStore::open(store_dir.path()).expect("open backend"));
        let cacher = FileCacher::shared(backend, scratch_dir.path(), false).expect("cacher");
        (cacher, store_dir, scratch_dir)
    }

    async fn run_once(root: &std::path::Path, cacher: &FileCacher, db: &DependencyCache, counter: &std::sync::atomic::AtomicU32) -> (bool, String) {
        let sandbox = Sandbox::new("test").expect("sandbox");
        let holder = DigestHolder::new("out.txt");
        let mut manifest = ArtifactManifest::new(root);
        manifest.outputs.push(OutputDeclaration {
            src: "out.txt".into(),
            digest: Some(holder.clone()),
            ..Default::default()
        });
        let manifests = vec![&manifest];

        let was_hit = cached(&manifests, cacher, db, serde_json::json!({}), || async {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let command = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi > out.txt".to_string()];
            gradecore_grading::run(&command, &SandboxParams::default(), &sandbox, &manifest, cacher, RunMetadata::default())
                .map_err(Error::from)?;
            Ok(CacheOutcome::Store(()))
        })
        .await
        .expect("cached");

        (was_hit, holder.get().unwrap_or_default())
    }

    #[tokio::test]
    async fn second_call_with_identical_inputs_is_a_hit() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let db = DependencyCache::open_transient().await.expect("db");
        let root = tempfile::tempdir().expect("root");
        let counter = std::sync::atomic::AtomicU32::new(0);

        let (first_hit, first_digest) = run_once(root.path(), &cacher, &db, &counter).await;
        let (second_hit, second_digest) = run_once(root.path(), &cacher, &db, &counter).await;

        assert!(!first_hit);
        assert!(second_hit);
        assert_eq!(first_digest, second_digest);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_cache_level_never_stores() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let db = DependencyCache::open_transient().await.expect("db");
        let root = tempfile::tempdir().expect("root");
        let counter = std::sync::atomic::AtomicU32::new(0);

        let _guard = gradecore_config::enter_cache_level(gradecore_config::CacheLevel::NoCache);
        let (first_hit, _) = run_once(root.path(), &cacher, &db, &counter).await;
        let (second_hit, _) = run_once(root.path(), &cacher, &db, &counter).await;

        assert!(!first_hit);
        assert!(!second_hit);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_outcome_into_inner_unwraps_either_variant() {
        assert_eq!(CacheOutcome::Store(5).into_inner(), 5);
        assert_eq!(CacheOutcome::Skip(7).into_inner(), 7);
    }
}
