//! Spawns a single child process under CPU/wall/memory/output-size limits and
//! classifies its termination cause (C4).
//!
//! Two daemon threads watch every running child: a wall-clock deadline timer
//! and a periodic CPU/RSS poll. Either may kill the child; [`Program::wait`]
//! always returns an authoritative [`ProgramResult`] built from the `wait4`
//! rusage, never from the watchdogs' own samples.

pub mod error;
pub mod runner;
pub mod types;

pub use error::Error;
pub use runner::{is_process_alive, reap_group, Program};
pub use types::{ProgramCode, ProgramIo, ProgramParams, ProgramResult, Redirection};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn run(command: &[&str], params: ProgramParams) -> ProgramResult {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let program = Program::spawn(&command, params).expect("spawn");
        program.wait().expect("wait")
    }

    #[test]
    fn successful_run_is_ok() {
        let result = run(&["/bin/true"], ProgramParams::default());
        assert!(result.ok());
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn nonzero_exit_is_re() {
        let result = run(&["/bin/sh", "-c", "exit 7"], ProgramParams::default());
        assert_eq!(result.exit_code, 7);
        assert!(result.program_codes.contains(&ProgramCode::Re));
    }

    #[test]
    fn cpu_timeout_is_classified_as_timeout() {
        let params = ProgramParams {
            time_limit: Some(0.2),
            ..Default::default()
        };
        let result = run(&["/bin/sh", "-c", "while true; do :; done"], params);
        assert!(result.program_codes.contains(&ProgramCode::To));
    }

    #[test]
    fn wall_timeout_sets_wt_and_to() {
        let params = ProgramParams {
            wall_time_limit: Some(0.3),
            ..Default::default()
        };
        let result = run(&["/bin/sleep", "5"], params);
        assert!(result.program_codes.contains(&ProgramCode::Wt));
        assert!(result.program_codes.contains(&ProgramCode::To));
    }

    #[test]
    fn output_limit_is_honored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stdout_path = dir.path().join("stdout.txt");
        let params = ProgramParams {
            io: ProgramIo {
                stdout: Some(Redirection::Path(stdout_path.clone())),
                ..Default::default()
            },
            fs_limit: Some(1),
            ..Default::default()
        };
        let result = run(
            &["/bin/sh", "-c", "head -c 100000 /dev/zero"],
            params,
        );
        assert!(result.program_codes.contains(&ProgramCode::Ol));
        let _ = stdout_path;
    }

    #[test]
    fn signal_kill_is_sg() {
        let result = run(&["/bin/sh", "-c", "kill -TERM $$"], ProgramParams::default());
        assert!(result.program_codes.contains(&ProgramCode::Sg));
        assert!(result.killing_signal.is_some());
    }

    #[test]
    fn staying_within_limits_is_ok() {
        let params = ProgramParams {
            time_limit: Some(5.0),
            wall_time_limit: Some(5.0),
            memory_limit: Some(200),
            ..Default::default()
        };
        let result = run(&["/bin/true"], params);
        assert!(result.ok());
    }

    #[test]
    fn external_terminate_sets_te() {
        let program = Program::spawn(
            &["/bin/sleep".to_string(), "5".to_string()],
            ProgramParams::default(),
        )
        .expect("spawn");
        program.terminate();
        let result = program.wait().expect("wait");
        assert!(result.program_codes.contains(&ProgramCode::Te));
    }

    #[test]
    fn chdir_is_respected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("marker");
        std::fs::write(&marker, b"present").expect("write");
        let stdout_path: PathBuf = dir.path().join("out.txt");
        let params = ProgramParams {
            chdir: Some(dir.path().to_path_buf()),
            io: ProgramIo {
                stdout: Some(Redirection::Path(stdout_path.clone())),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = run(&["/bin/sh", "-c", "cat marker"], params);
        assert!(result.ok());
        assert_eq!(std::fs::read_to_string(&stdout_path).expect("read"), "present");
    }
}
