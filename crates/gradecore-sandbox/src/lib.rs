//! A per-task scratch directory, the file/FIFO/symlink operations allowed
//! inside it, and single-process and coordinated two-process runs built on
//! top of `gradecore-runner` (C5).

pub mod error;
pub mod sandbox;
pub mod types;

pub use error::Error;
pub use sandbox::Sandbox;
pub use types::{classify, SandboxExitStatus, SandboxLog, SandboxParams};

#[cfg(test)]
mod tests {
    use super::*;
    use gradecore_storage::{BlobStore, FileCacher};
    use std::sync::Arc;

    #[test]
    fn create_and_run_a_shell_script() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        sandbox
            .create_file_from_string("run.sh", "#!/bin/sh\necho hello\n", true)
            .expect("create file");
        let result = sandbox
            .run(
                &["/bin/sh".to_string(), "run.sh".to_string()],
                SandboxParams::default(),
            )
            .expect("run");
        assert_eq!(result.exit_status, SandboxExitStatus::Ok);
    }

    #[test]
    fn glob_expansion_is_sorted() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        sandbox.create_file_from_bytes("b.txt", b"b", false).expect("create");
        sandbox.create_file_from_bytes("a.txt", b"a", false).expect("create");
        let matches = sandbox.glob("*.txt").expect("glob");
        assert_eq!(matches, vec![std::path::PathBuf::from("a.txt"), std::path::PathBuf::from("b.txt")]);
    }

    #[test]
    fn at_glob_word_expands_in_command() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        sandbox.create_file_from_bytes("one.txt", b"1", false).expect("create");
        sandbox.create_file_from_bytes("two.txt", b"2", false).expect("create");
        let result = sandbox
            .run(
                &["/bin/cat".to_string(), "@glob:*.txt".to_string()],
                SandboxParams::default(),
            )
            .expect("run");
        assert_eq!(result.exit_status, SandboxExitStatus::Ok);
    }

    #[test]
    fn memory_placeholder_is_substituted() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        let result = sandbox
            .run(
                &["/bin/sh".to_string(), "-c".to_string(), "test \"$0\" = 2048".to_string(), "{memory}".to_string()],
                SandboxParams::default(),
            )
            .expect("run");
        assert_eq!(result.exit_status, SandboxExitStatus::Ok);
    }

    #[test]
    fn nonzero_exit_maps_to_nonzero_return() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        let result = sandbox
            .run(&["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()], SandboxParams::default())
            .expect("run");
        assert_eq!(result.exit_status, SandboxExitStatus::NonzeroReturn);
    }

    #[test]
    fn cpu_timeout_maps_to_timeout() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        let params = SandboxParams {
            timeout_ms: Some(200),
            ..Default::default()
        };
        let result = sandbox
            .run(&["/bin/sh".to_string(), "-c".to_string(), "while true; do :; done".to_string()], params)
            .expect("run");
        assert_eq!(result.exit_status, SandboxExitStatus::Timeout);
    }

    #[test]
    fn file_to_storage_and_back_round_trips() {
        let store_dir = tempfile::tempdir().expect("store dir");
        let backend = Arc::new(BlobStore::open(store_dir.path()).expect("open backend"));
        let scratch_dir = tempfile::tempdir().expect("scratch dir");
        let cacher = FileCacher::shared(backend, scratch_dir.path(), false).expect("cacher");

        let sandbox = Sandbox::new("test").expect("sandbox");
        sandbox.create_file_from_bytes("input.txt", b"payload", false).expect("create");
        let digest = sandbox.get_file_to_storage("input.txt", &cacher).expect("to storage");

        sandbox
            .create_file_from_storage("output.txt", &cacher, &digest, false)
            .expect("from storage");
        let roundtrip = sandbox.get_file_to_bytes("output.txt").expect("read back");
        assert_eq!(roundtrip, b"payload");
    }

    #[test]
    fn run_communication_reaps_both_sides() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        let solution = vec!["/bin/sh".to_string(), "-c".to_string(), "read line; echo \"$line\"".to_string()];
        let interactor = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi; read line".to_string()];
        let (solution_log, interactor_log) = sandbox
            .run_communication(&solution, SandboxParams::default(), &interactor, SandboxParams::default(), None)
            .expect("run_communication");
        assert!(solution_log.exit_index.is_some());
        assert!(interactor_log.exit_index.is_some());
        assert_ne!(solution_log.exit_index, interactor_log.exit_index);
    }

    #[test]
    fn run_communication_can_tee_a_merged_capture() {
        let sandbox = Sandbox::new("test").expect("sandbox");
        let solution = vec!["/bin/sh".to_string(), "-c".to_string(), "read line; echo \"$line\"".to_string()];
        let interactor = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi; read line".to_string()];
        let capture_path = sandbox.root().join("merged.log");
        let (_solution_log, _interactor_log) = sandbox
            .run_communication(&solution, SandboxParams::default(), &interactor, SandboxParams::default(), Some(&capture_path))
            .expect("run_communication");
        assert!(capture_path.exists());
    }
}
