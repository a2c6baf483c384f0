//! Sandbox-level parameters and the classified outcome of one sandboxed run.

use std::path::PathBuf;

use gradecore_runner::ProgramCode;
use serde::{Deserialize, Serialize};

/// Highest-priority classification of one sandboxed execution, ordered the
/// same way a caller would want to report it: a coordinated peer's forced
/// termination outranks everything, a hard resource violation outranks a
/// signal, and a signal outranks a plain nonzero exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxExitStatus {
    /// Exit code zero, no limit exceeded.
    Ok,
    /// Exit code nonzero.
    NonzeroReturn,
    /// Killed by a signal other than one of the sandbox's own limits.
    Signal,
    /// CPU or wall-clock time limit exceeded.
    Timeout,
    /// Wall-clock time limit exceeded specifically (CPU time was still under
    /// budget).
    TimeoutWall,
    /// Resident memory limit exceeded.
    MemoryLimitExceeded,
    /// Combined stdout/stderr size limit exceeded.
    OutputLimitExceeded,
    /// The sandbox itself failed to spawn or supervise the process.
    SandboxError,
    /// Killed because a coordinated peer finished or failed first.
    Terminated,
}

/// Picks the single [`SandboxExitStatus`] that best summarizes a set of raw
/// [`ProgramCode`]s, in priority order (highest first): `Te`, `Wt`, `Ml`,
/// `Ol`, `To`, `Sg`, `Re`.
#[must_use]
pub fn classify(codes: &std::collections::HashSet<ProgramCode>) -> SandboxExitStatus {
    if codes.contains(&ProgramCode::Te) {
        SandboxExitStatus::Terminated
    } else if codes.contains(&ProgramCode::Wt) {
        SandboxExitStatus::TimeoutWall
    } else if codes.contains(&ProgramCode::Ml) {
        SandboxExitStatus::MemoryLimitExceeded
    } else if codes.contains(&ProgramCode::Ol) {
        SandboxExitStatus::OutputLimitExceeded
    } else if codes.contains(&ProgramCode::To) {
        SandboxExitStatus::Timeout
    } else if codes.contains(&ProgramCode::Sg) {
        SandboxExitStatus::Signal
    } else if codes.contains(&ProgramCode::Re) {
        SandboxExitStatus::NonzeroReturn
    } else {
        SandboxExitStatus::Ok
    }
}

/// Inputs to one sandboxed run, all paths relative to the sandbox scratch
/// root unless noted otherwise.
#[derive(Debug, Clone, Default)]
pub struct SandboxParams {
    /// File to feed the child's stdin, if any.
    pub stdin_file: Option<PathBuf>,
    /// File to capture the child's stdout into, if any.
    pub stdout_file: Option<PathBuf>,
    /// File to capture the child's stderr into, if any.
    pub stderr_file: Option<PathBuf>,
    /// CPU time limit in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Wall-clock time limit in milliseconds.
    pub wallclock_timeout_ms: Option<u64>,
    /// Resident memory limit in megabytes.
    pub address_space_mb: Option<u64>,
    /// Combined output size limit in kilobytes.
    pub fsize_kb: Option<u64>,
    /// Environment variables to set in addition to the parent's.
    pub set_env: Vec<(String, String)>,
}

/// The record of one sandboxed run: what was asked for, and how it ended.
#[derive(Debug, Clone)]
pub struct SandboxLog {
    /// The parameters the run was invoked with (after placeholder
    /// expansion has been applied to the command, not to this struct).
    pub params: SandboxParams,
    /// Wall-clock time elapsed, in seconds.
    pub execution_time: f64,
    /// Peak resident memory usage, in bytes.
    pub memory_used: u64,
    /// Raw process exit code (negative if killed by signal).
    pub exit_code: i32,
    /// The summarized classification.
    pub exit_status: SandboxExitStatus,
    /// The signal that killed the process, if any.
    pub killing_signal: Option<i32>,
    /// Reap order among a coordinated pair: `0` for whichever side the
    /// kernel handed back to `wait4` first. `None` for a standalone run.
    pub exit_index: Option<u8>,
    /// Every raw code the runner observed, for diagnostics.
    pub program_codes: std::collections::HashSet<ProgramCode>,
    /// The watchdog message, if a watchdog fired.
    pub alarm_msg: Option<String>,
}
