//! Compile/run/run_coordinated grading steps (C6): the fixed stage → shape
//! → execute → harvest scaffold shared by compilation and test execution,
//! built on top of `gradecore-sandbox`.

pub mod error;
pub mod manifest;
pub mod steps;

pub use error::Error;
pub use manifest::{
    ArtifactManifest, DigestHolder, FifoDeclaration, InputDeclaration, InputSource, ManifestLogs, OutputDeclaration, PreprocessLog, RunLog,
    validate_digest_sequencing,
};
pub use steps::{compile, harvest_outputs, run, run_coordinated, stage_fifos, stage_inputs, RunMetadata};

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn run_harvests_a_digest_output() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let sandbox = Sandbox::new("test").expect("sandbox");
        let root = tempfile::tempdir().expect("root");

        let holder = DigestHolder::new("out.txt");
        let mut manifest = ArtifactManifest::new(root.path());
        manifest.outputs.push(OutputDeclaration {
            src: "out.txt".into(),
            digest: Some(holder.clone()),
            ..Default::default()
        });

        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi > out.txt".to_string()];
        let log = run(&command, &SandboxParams::default(), &sandbox, &manifest, &cacher, RunMetadata::default()).expect("run");
        assert_eq!(log.exit_status, gradecore_sandbox::SandboxExitStatus::Ok);
        let digest = holder.get().expect("digest produced");
        assert_eq!(cacher.get_file_content(&digest).expect("read back"), b"hi\n");
    }

    #[test]
    fn run_fails_on_missing_required_output() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let sandbox = Sandbox::new("test").expect("sandbox");
        let root = tempfile::tempdir().expect("root");

        let mut manifest = ArtifactManifest::new(root.path());
        manifest.outputs.push(OutputDeclaration {
            src: "missing.txt".into(),
            ..Default::default()
        });

        let command = vec!["/bin/true".to_string()];
        let result = run(&command, &SandboxParams::default(), &sandbox, &manifest, &cacher, RunMetadata::default());
        assert!(matches!(result, Err(Error::MissingOutput { .. })));
    }

    #[test]
    fn optional_missing_output_is_not_an_error() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let sandbox = Sandbox::new("test").expect("sandbox");
        let root = tempfile::tempdir().expect("root");

        let mut manifest = ArtifactManifest::new(root.path());
        manifest.outputs.push(OutputDeclaration {
            src: "missing.txt".into(),
            optional: true,
            ..Default::default()
        });

        let command = vec!["/bin/true".to_string()];
        let log = run(&command, &SandboxParams::default(), &sandbox, &manifest, &cacher, RunMetadata::default()).expect("run");
        assert_eq!(log.exit_status, gradecore_sandbox::SandboxExitStatus::Ok);
    }

    #[test]
    fn compile_stops_at_first_failure() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let sandbox = Sandbox::new("test").expect("sandbox");
        let root = tempfile::tempdir().expect("root");
        let (manifest, sink) = ArtifactManifest::new(root.path()).with_logs();

        let commands = vec![
            vec!["/bin/true".to_string()],
            vec!["/bin/sh".to_string(), "-c".to_string(), "exit 1".to_string()],
            vec!["/bin/true".to_string()],
        ];
        let ok = compile(&commands, &SandboxParams::default(), &sandbox, &manifest, &cacher).expect("compile");
        assert!(!ok);
        assert_eq!(sink.lock().expect("lock").preprocess.len(), 2);
    }

    #[test]
    fn digest_holder_rejects_double_production() {
        let holder = DigestHolder::new("x");
        holder.set("a".repeat(40)).expect("first set");
        assert!(matches!(holder.set("b".repeat(40)), Err(Error::DigestProducedTwice { .. })));
    }

    #[test]
    fn digest_holder_rejects_read_before_produced() {
        let holder = DigestHolder::new("x");
        assert!(matches!(holder.get(), Err(Error::DigestNotProduced { .. })));
    }

    #[test]
    fn staging_a_digest_input_materializes_it() {
        let (cacher, _store_dir, _scratch_dir) = new_cacher();
        let digest = cacher
            .put_file_from_fobj(&b"payload"[..], std::collections::BTreeMap::new(), false, 1)
            .expect("put");
        let holder = DigestHolder::new("input");
        holder.set(digest).expect("set");

        let sandbox = Sandbox::new("test").expect("sandbox");
        let root = tempfile::tempdir().expect("root");
        let mut manifest = ArtifactManifest::new(root.path());
        manifest.inputs.push(InputDeclaration {
            dest: "in.txt".into(),
            source: InputSource::Digest(holder),
            executable: false,
            hash: true,
        });

        stage_inputs(&sandbox, &manifest, &cacher).expect("stage");
        assert_eq!(sandbox.get_file_to_bytes("in.txt").expect("read"), b"payload");
    }
}
