//! Spawns one child process under resource limits, watches it with two
//! daemon threads, and classifies its termination cause once it exits.

use std::io;
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt as _;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::types::{ProgramCode, ProgramParams, ProgramResult, Redirection};

const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// No watchdog has killed the child yet.
const KILL_REASON_NONE: u8 = 0;
/// The wall-clock watchdog fired.
const KILL_REASON_WALL: u8 = 1;
/// The poll watchdog fired because of CPU time.
const KILL_REASON_CPU_POLL: u8 = 2;
/// The poll watchdog fired because of memory.
const KILL_REASON_MEMORY_POLL: u8 = 3;
/// An external caller (e.g. a coordinated peer's failure) requested a kill.
const KILL_REASON_EXTERNAL: u8 = 4;

fn open_redirection_for_write(r: &Redirection) -> Result<Stdio, Error> {
    match r {
        Redirection::Path(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|source| Error::Redirection {
                    path: path.clone(),
                    source,
                })?;
            Ok(Stdio::from(file))
        }
        #[expect(unsafe_code, reason = "wrapping a caller-owned inherited fd")]
        Redirection::Fd(fd) => Ok(unsafe { Stdio::from_raw_fd(*fd) }),
        Redirection::Pipe => Ok(Stdio::piped()),
    }
}

fn open_redirection_for_read(r: &Redirection) -> Result<Stdio, Error> {
    match r {
        Redirection::Path(path) => {
            let file = std::fs::File::open(path).map_err(|source| Error::Redirection {
                path: path.clone(),
                source,
            })?;
            Ok(Stdio::from(file))
        }
        #[expect(unsafe_code, reason = "wrapping a caller-owned inherited fd")]
        Redirection::Fd(fd) => Ok(unsafe { Stdio::from_raw_fd(*fd) }),
        Redirection::Pipe => Ok(Stdio::piped()),
    }
}

/// One spawned child under resource limits, prior to [`Program::wait`].
pub struct Program {
    pid: libc::pid_t,
    pgid: libc::pid_t,
    params: ProgramParams,
    spawned_at: Instant,
    kill_reason: Arc<AtomicU8>,
    finished: Arc<(Mutex<bool>, Condvar)>,
    wall_handle: Option<JoinHandle<()>>,
    poll_handle: Option<JoinHandle<()>>,
    child: std::process::Child,
}

impl Program {
    /// The process id of the spawned child.
    #[must_use]
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// The process group id the child was placed into.
    #[must_use]
    pub fn pgid(&self) -> libc::pid_t {
        self.pgid
    }

    /// Takes the parent end of stdin, if it was redirected as a pipe.
    pub fn take_stdin(&mut self) -> Option<std::process::ChildStdin> {
        self.child.stdin.take()
    }

    /// Takes the parent end of stdout, if it was redirected as a pipe.
    pub fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Takes the parent end of stderr, if it was redirected as a pipe.
    pub fn take_stderr(&mut self) -> Option<std::process::ChildStderr> {
        self.child.stderr.take()
    }

    /// Spawns `command` (already split into argv) under `params`.
    #[tracing::instrument(skip(params), fields(leader = command.first().map(String::as_str)))]
    pub fn spawn(command: &[String], params: ProgramParams) -> Result<Self, Error> {
        let leader = command.first().cloned().unwrap_or_default();
        let mut cmd = Command::new(&leader);
        cmd.args(command.iter().skip(1));

        if let Some(chdir) = &params.chdir {
            cmd.current_dir(chdir);
        }
        for (key, value) in &params.env {
            cmd.env(key, value);
        }

        if let Some(r) = &params.io.stdin {
            cmd.stdin(open_redirection_for_read(r)?);
        }
        if let Some(r) = &params.io.stdout {
            cmd.stdout(open_redirection_for_write(r)?);
        }
        if let Some(r) = &params.io.stderr {
            cmd.stderr(open_redirection_for_write(r)?);
        }

        let target_pgid = params.pgid.unwrap_or(0);
        let time_limit = params.time_limit;
        let fs_limit = params.fs_limit;

        #[expect(
            unsafe_code,
            reason = "pre_exec runs in the forked child before exec; only async-signal-safe libc calls are made"
        )]
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, target_pgid) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(t) = time_limit {
                    let soft = t.ceil() as libc::rlim_t;
                    let rlim = libc::rlimit {
                        rlim_cur: soft,
                        rlim_max: soft + 1,
                    };
                    libc::setrlimit(libc::RLIMIT_CPU, &rlim);
                }
                if let Some(fs) = fs_limit {
                    let rlim = libc::rlimit {
                        rlim_cur: fs * 1024 + 1,
                        rlim_max: fs * 2048,
                    };
                    libc::setrlimit(libc::RLIMIT_FSIZE, &rlim);
                }
                #[cfg(not(target_os = "macos"))]
                {
                    let rlim = libc::rlimit {
                        rlim_cur: libc::RLIM_INFINITY,
                        rlim_max: libc::RLIM_INFINITY,
                    };
                    libc::setrlimit(libc::RLIMIT_STACK, &rlim);
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: leader,
            source,
        })?;
        let pid = child.id() as libc::pid_t;
        let pgid = if target_pgid == 0 { pid } else { target_pgid };

        let kill_reason = Arc::new(AtomicU8::new(KILL_REASON_NONE));
        let finished = Arc::new((Mutex::new(false), Condvar::new()));

        let wall_handle = params.wall_time_limit.map(|limit| {
            let kill_reason = Arc::clone(&kill_reason);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                let (lock, cvar) = &*finished;
                let guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let (guard, timed_out) = cvar
                    .wait_timeout_while(guard, Duration::from_secs_f64(limit.max(0.0)), |done| !*done)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                drop(guard);
                if timed_out.timed_out() {
                    if kill_reason
                        .compare_exchange(
                            KILL_REASON_NONE,
                            KILL_REASON_WALL,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        send_group_kill(pgid);
                    }
                }
            })
        });

        let poll_handle = {
            let kill_reason = Arc::clone(&kill_reason);
            let finished = Arc::clone(&finished);
            let time_limit = params.time_limit;
            let memory_limit = params.memory_limit;
            Some(std::thread::spawn(move || {
                let (lock, cvar) = &*finished;
                loop {
                    let guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    let (guard, timed_out) = cvar
                        .wait_timeout_while(guard, POLL_INTERVAL, |done| !*done)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let done = *guard;
                    drop(guard);
                    if done {
                        break;
                    }
                    let _ = timed_out;

                    if let Some(t) = time_limit {
                        if let Some(cpu) = read_proc_cpu_time_seconds(pid) {
                            if cpu > t
                                && kill_reason
                                    .compare_exchange(
                                        KILL_REASON_NONE,
                                        KILL_REASON_CPU_POLL,
                                        Ordering::SeqCst,
                                        Ordering::SeqCst,
                                    )
                                    .is_ok()
                            {
                                send_group_kill(pgid);
                                break;
                            }
                        }
                    }
                    if let Some(m) = memory_limit {
                        if let Some(rss) = read_proc_rss_bytes(pid) {
                            if rss > m * 1024 * 1024
                                && kill_reason
                                    .compare_exchange(
                                        KILL_REASON_NONE,
                                        KILL_REASON_MEMORY_POLL,
                                        Ordering::SeqCst,
                                        Ordering::SeqCst,
                                    )
                                    .is_ok()
                            {
                                send_group_kill(pgid);
                                break;
                            }
                        }
                    }
                }
            }))
        };

        Ok(Self {
            pid,
            pgid,
            params,
            spawned_at: Instant::now(),
            kill_reason,
            finished,
            wall_handle,
            poll_handle,
            child,
        })
    }

    /// Requests termination from an external caller (e.g. a coordinated peer
    /// that has already failed). Idempotent with the watchdogs: whichever
    /// fires first wins.
    pub fn terminate(&self) {
        if self
            .kill_reason
            .compare_exchange(
                KILL_REASON_NONE,
                KILL_REASON_EXTERNAL,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            send_group_kill(self.pgid);
        }
    }

    /// Blocks until the child exits, reaps it, stops the watchdogs, and
    /// returns the classified result.
    #[tracing::instrument(skip_all, fields(pid = self.pid))]
    pub fn wait(self) -> Result<ProgramResult, Error> {
        #[expect(unsafe_code, reason = "wait4 is the only way to get rusage alongside exit status")]
        let (status, rusage) = unsafe {
            let mut status: libc::c_int = 0;
            let mut rusage: libc::rusage = std::mem::zeroed();
            let ret = libc::wait4(self.pid, &mut status, 0, &mut rusage);
            if ret < 0 {
                return Err(Error::Wait {
                    pid: self.pid,
                    source: io::Error::last_os_error(),
                });
            }
            (status, rusage)
        };
        Ok(self.finish_with(status, &rusage))
    }

    /// Finalizes this program given an exit status and rusage obtained by a
    /// caller who reaped it directly (e.g. a coordinated run reaping by
    /// process group rather than by pid). Stops the watchdogs and classifies
    /// the result exactly as [`Program::wait`] would.
    #[must_use]
    pub fn finish_with(mut self, status: libc::c_int, rusage: &libc::rusage) -> ProgramResult {
        {
            let (lock, cvar) = &*self.finished;
            let mut done = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *done = true;
            cvar.notify_all();
        }
        if let Some(h) = self.wall_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.poll_handle.take() {
            let _ = h.join();
        }
        self.process_exit(status, rusage)
    }

    fn output_bytes_written(&self) -> u64 {
        [&self.params.io.stdout, &self.params.io.stderr]
            .into_iter()
            .flatten()
            .filter_map(|r| match r {
                Redirection::Path(path) => std::fs::metadata(path).ok().map(|m| m.len()),
                _ => None,
            })
            .sum()
    }

    fn process_exit(&self, status: libc::c_int, rusage: &libc::rusage) -> ProgramResult {
        let wall_time = self.spawned_at.elapsed().as_secs_f64();
        let cpu_time = timeval_secs(rusage.ru_utime) + timeval_secs(rusage.ru_stime);
        let memory_used = memory_used_bytes(rusage);

        let mut codes = std::collections::HashSet::new();
        let mut killing_signal = None;
        let exit_code;

        if libc_wifsignaled(status) {
            let sig = libc_wtermsig(status);
            killing_signal = Some(sig);
            exit_code = -sig;
            codes.insert(ProgramCode::Sg);
        } else {
            let code = libc_wexitstatus(status);
            exit_code = code;
            if code != 0 {
                codes.insert(ProgramCode::Re);
            }
        }

        let reason = self.kill_reason.load(Ordering::SeqCst);
        let mut alarm_msg = None;

        if let Some(t) = self.params.time_limit {
            if cpu_time > t || exit_code == -24 {
                codes.insert(ProgramCode::To);
            }
        }
        if reason == KILL_REASON_CPU_POLL {
            codes.insert(ProgramCode::To);
            alarm_msg = Some("timelimit".to_string());
        }
        if let Some(w) = self.params.wall_time_limit {
            if wall_time > w {
                codes.insert(ProgramCode::Wt);
                codes.insert(ProgramCode::To);
            }
        }
        if reason == KILL_REASON_WALL {
            codes.insert(ProgramCode::Wt);
            codes.insert(ProgramCode::To);
            alarm_msg = Some("wall timelimit".to_string());
        }
        if let Some(m) = self.params.memory_limit {
            if memory_used > m * 1024 * 1024 {
                codes.insert(ProgramCode::Ml);
            }
        }
        if reason == KILL_REASON_MEMORY_POLL {
            codes.insert(ProgramCode::Ml);
            alarm_msg = Some("memorylimit".to_string());
        }
        if let Some(fs) = self.params.fs_limit {
            if self.output_bytes_written() > fs * 1024 {
                codes.insert(ProgramCode::Ol);
            }
        }
        if reason == KILL_REASON_EXTERNAL {
            codes.insert(ProgramCode::Te);
        }

        ProgramResult {
            exit_code,
            program_codes: codes,
            wall_time,
            cpu_time,
            memory_used,
            alarm_msg,
            killing_signal,
        }
    }
}

fn send_group_kill(pgid: libc::pid_t) {
    tracing::debug!(pgid, "sending SIGKILL to process group");
    #[expect(unsafe_code, reason = "kill with a negative pid signals an entire process group")]
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn timeval_secs(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + (tv.tv_usec as f64) / 1_000_000.0
}

#[cfg(target_os = "macos")]
fn memory_used_bytes(ru: &libc::rusage) -> u64 {
    ru.ru_maxrss as u64 + (ru.ru_ixrss as u64) * 1024
}

#[cfg(not(target_os = "macos"))]
fn memory_used_bytes(ru: &libc::rusage) -> u64 {
    (ru.ru_maxrss as u64 + ru.ru_ixrss as u64 + ru.ru_idrss as u64 + ru.ru_isrss as u64) * 1024
}

fn libc_wifsignaled(status: libc::c_int) -> bool {
    (status & 0x7f) != 0 && (status & 0x7f) != 0x7f
}

fn libc_wtermsig(status: libc::c_int) -> i32 {
    status & 0x7f
}

fn libc_wexitstatus(status: libc::c_int) -> i32 {
    (status >> 8) & 0xff
}

/// Best-effort CPU-time sample (user+system, seconds) for a running process,
/// used only by the poll watchdog to decide whether to kill early. The
/// authoritative figure used for final classification comes from `wait4`'s
/// rusage in [`Program::process_exit`].
#[cfg(target_os = "linux")]
fn read_proc_cpu_time_seconds(pid: libc::pid_t) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = stat.rsplit_once(") ")?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Fields are 1-indexed in proc(5); utime/stime are fields 14/15, i.e. index 11/12 here.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = 100.0; // sysconf(_SC_CLK_TCK) is 100 on the overwhelming majority of Linux builds
    Some((utime + stime) as f64 / ticks_per_sec)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_cpu_time_seconds(_pid: libc::pid_t) -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn read_proc_rss_bytes(pid: libc::pid_t) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().strip_suffix("kB")?.trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_proc_rss_bytes(_pid: libc::pid_t) -> Option<u64> {
    None
}

/// Reaps the next child to exit within process group `pgid`, returning its
/// pid, exit status, and resource usage. Used by coordinated (two-process)
/// runs, which must reap by group rather than by individual pid so that
/// whichever side exits first is observed first.
#[tracing::instrument]
pub fn reap_group(pgid: libc::pid_t) -> Result<(libc::pid_t, libc::c_int, libc::rusage), Error> {
    #[expect(unsafe_code, reason = "wait4 is the only way to get rusage alongside exit status")]
    unsafe {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = std::mem::zeroed();
        let ret = libc::wait4(-pgid, &mut status, 0, &mut rusage);
        if ret < 0 {
            return Err(Error::Wait {
                pid: -pgid,
                source: io::Error::last_os_error(),
            });
        }
        Ok((ret, status, rusage))
    }
}

/// Checks whether a pid is still alive, without sending a real signal.
#[must_use]
pub fn is_process_alive(pid: libc::pid_t) -> bool {
    #[expect(unsafe_code, reason = "signal 0 is the standard POSIX liveness probe")]
    unsafe {
        libc::kill(pid, 0) == 0
    }
}
