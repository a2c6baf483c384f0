//! Types shared by [`crate::Program`]'s inputs and outputs.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Where one of a child's standard streams should be connected.
#[derive(Debug, Clone)]
pub enum Redirection {
    /// Open (or create) the file at this path.
    Path(PathBuf),
    /// Use an already-open file descriptor, inherited as-is.
    Fd(RawFd),
    /// Create an OS pipe; the parent keeps the other end.
    Pipe,
}

/// The three standard streams, each independently redirected.
#[derive(Debug, Clone, Default)]
pub struct ProgramIo {
    /// Redirection for the child's stdin.
    pub stdin: Option<Redirection>,
    /// Redirection for the child's stdout.
    pub stdout: Option<Redirection>,
    /// Redirection for the child's stderr.
    pub stderr: Option<Redirection>,
}

/// Inputs to a single child process invocation.
#[derive(Debug, Clone, Default)]
pub struct ProgramParams {
    /// Standard stream redirections.
    pub io: ProgramIo,
    /// Working directory for the child.
    pub chdir: Option<PathBuf>,
    /// Environment variables to set (merged over the parent's environment).
    pub env: Vec<(String, String)>,
    /// CPU time limit in seconds. `None` disables the limit.
    pub time_limit: Option<f64>,
    /// Wall-clock time limit in seconds. `None` disables the limit.
    pub wall_time_limit: Option<f64>,
    /// Resident memory limit in megabytes. `None` disables the limit.
    pub memory_limit: Option<u64>,
    /// Maximum combined output size in kilobytes. `None` disables the limit.
    pub fs_limit: Option<u64>,
    /// If set, join this existing process group instead of leading a new one.
    pub pgid: Option<i32>,
}

/// One raw failure-code observed while classifying a finished child. A single
/// run may set more than one of these; [`crate::sandbox_exit_status`] (in the
/// sandbox crate) picks the highest-priority one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramCode {
    /// Nonzero exit code.
    Re,
    /// Killed by a signal.
    Sg,
    /// CPU time limit exceeded.
    To,
    /// Wall-clock time limit exceeded.
    Wt,
    /// Memory limit exceeded.
    Ml,
    /// Output size limit exceeded.
    Ol,
    /// Terminated by an external request (e.g. a coordinated peer's failure).
    Te,
}

/// The classified outcome of one child process execution.
#[derive(Debug, Clone)]
pub struct ProgramResult {
    /// Raw exit code; negative values indicate the child was killed by signal
    /// `-exit_code`.
    pub exit_code: i32,
    /// Every raw failure code that applies to this run.
    pub program_codes: HashSet<ProgramCode>,
    /// Wall-clock time elapsed, in seconds.
    pub wall_time: f64,
    /// CPU time consumed (user + system), in seconds.
    pub cpu_time: f64,
    /// Peak resident memory usage, in bytes.
    pub memory_used: u64,
    /// The watchdog message, if a watchdog fired (`"timelimit"`, `"wall
    /// timelimit"`, `"memorylimit"`).
    pub alarm_msg: Option<String>,
    /// The signal that killed the child, if any.
    pub killing_signal: Option<i32>,
}

impl ProgramResult {
    /// Convenience: `true` if no failure code was set.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.program_codes.is_empty()
    }
}
