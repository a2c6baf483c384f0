//! A per-task scratch directory wrapping [`gradecore_runner`] for
//! single-process and coordinated two-process runs.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use gradecore_runner::{reap_group, Program, ProgramCode, ProgramIo, ProgramParams, Redirection};
use gradecore_storage::FileCacher;
use tempfile::TempDir;

use crate::error::Error;
use crate::types::{classify, SandboxExitStatus, SandboxLog, SandboxParams};

const EXECUTABLE_MODE: u32 = 0o755;
const REGULAR_MODE: u32 = 0o644;
const DEFAULT_ADDRESS_SPACE_MB: u64 = 2048;
const MAX_INITIAL_MEMORY_MB: u64 = 512;

/// One scratch directory, reused across a sequence of runs for a single
/// grading task.
pub struct Sandbox {
    root: PathBuf,
    _tempdir: TempDir,
    name: String,
}

impl Sandbox {
    /// Creates a fresh scratch root named `rbx-<name>-<random>`.
    #[tracing::instrument(skip(name))]
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let tempdir = tempfile::Builder::new()
            .prefix(&format!("rbx-{name}-"))
            .tempdir()
            .map_err(|source| Error::Scratch { source })?;
        let root = tempdir.path().to_path_buf();
        Ok(Self {
            root,
            _tempdir: tempdir,
            name,
        })
    }

    /// The scratch root on disk.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    /// Discards the current scratch contents and starts with a fresh,
    /// identically-prefixed directory.
    pub fn reset(&mut self) -> Result<(), Error> {
        let tempdir = tempfile::Builder::new()
            .prefix(&format!("rbx-{}-", self.name))
            .tempdir()
            .map_err(|source| Error::Scratch { source })?;
        self.root = tempdir.path().to_path_buf();
        self._tempdir = tempdir;
        Ok(())
    }

    /// Deletes the scratch directory outright when `delete` is true;
    /// otherwise leaves it on disk for inspection.
    pub fn cleanup(self, delete: bool) {
        if !delete {
            let _ = self._tempdir.keep();
        }
    }

    /// Creates (or truncates) a file at `path`, `0o755` if `executable` else
    /// `0o644`.
    pub fn create_file(&self, path: impl AsRef<Path>, executable: bool) -> Result<File, Error> {
        let full = self.resolve(&path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::io(source, path.as_ref(), "create parent directory"))?;
        }
        let mode = if executable { EXECUTABLE_MODE } else { REGULAR_MODE };
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&full)
            .map_err(|source| Error::io(source, path.as_ref(), "create file"))
    }

    /// Writes `contents` to a new file at `path`.
    pub fn create_file_from_bytes(
        &self,
        path: impl AsRef<Path>,
        contents: &[u8],
        executable: bool,
    ) -> Result<(), Error> {
        let mut file = self.create_file(&path, executable)?;
        file.write_all(contents)
            .map_err(|source| Error::io(source, path.as_ref(), "write file"))
    }

    /// Writes a UTF-8 string to a new file at `path`.
    pub fn create_file_from_string(
        &self,
        path: impl AsRef<Path>,
        contents: &str,
        executable: bool,
    ) -> Result<(), Error> {
        self.create_file_from_bytes(path, contents.as_bytes(), executable)
    }

    /// Copies an external file into the sandbox at `path`.
    pub fn create_file_from_other_file(
        &self,
        path: impl AsRef<Path>,
        source: impl AsRef<Path>,
        executable: bool,
    ) -> Result<(), Error> {
        let mut contents = Vec::new();
        File::open(source.as_ref())
            .and_then(|mut f| f.read_to_end(&mut contents))
            .map_err(|source| Error::io(source, path.as_ref(), "read source file"))?;
        self.create_file_from_bytes(path, &contents, executable)
    }

    /// Materializes a blob-store digest into the sandbox at `path`, symlinking
    /// when the cacher allows it and copying otherwise.
    pub fn create_file_from_storage(
        &self,
        path: impl AsRef<Path>,
        cacher: &FileCacher,
        digest: &str,
        executable: bool,
    ) -> Result<(), Error> {
        let full = self.resolve(&path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::io(source, path.as_ref(), "create parent directory"))?;
        }
        if let Some(target) = cacher.path_for_symlink(digest)? {
            std::os::unix::fs::symlink(&target, &full)
                .map_err(|source| Error::io(source, path.as_ref(), "symlink from storage"))?;
        } else {
            let contents = cacher.get_file_content(digest)?;
            self.create_file_from_bytes(&path, &contents, executable)?;
            return Ok(());
        }
        let mode = if executable { EXECUTABLE_MODE } else { REGULAR_MODE };
        fs::set_permissions(&full, fs::Permissions::from_mode(mode))
            .map_err(|source| Error::io(source, path.as_ref(), "chmod symlinked file"))?;
        Ok(())
    }

    /// Creates a symlink at `path` pointing at `target`.
    pub fn create_symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<(), Error> {
        let full = self.resolve(&path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::io(source, path.as_ref(), "create parent directory"))?;
        }
        std::os::unix::fs::symlink(target.as_ref(), &full)
            .map_err(|source| Error::io(source, path.as_ref(), "create symlink"))
    }

    /// Creates a named pipe at `path`.
    pub fn create_fifo(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let full = self.resolve(&path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::io(source, path.as_ref(), "create parent directory"))?;
        }
        let c_path = std::ffi::CString::new(full.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::io(std::io::Error::other("path contains NUL"), path.as_ref(), "create fifo"))?;
        #[expect(unsafe_code, reason = "mkfifo has no safe libc wrapper")]
        let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
        if ret != 0 {
            return Err(Error::io(std::io::Error::last_os_error(), path.as_ref(), "create fifo"));
        }
        Ok(())
    }

    /// Opens a file inside the sandbox for reading.
    pub fn get_file(&self, path: impl AsRef<Path>) -> Result<File, Error> {
        File::open(self.resolve(&path)).map_err(|source| Error::io(source, path.as_ref(), "open file"))
    }

    /// Reads a file inside the sandbox into memory.
    pub fn get_file_to_bytes(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, Error> {
        fs::read(self.resolve(&path)).map_err(|source| Error::io(source, path.as_ref(), "read file"))
    }

    /// Reads a file inside the sandbox as a UTF-8 string.
    pub fn get_file_to_string(&self, path: impl AsRef<Path>) -> Result<String, Error> {
        fs::read_to_string(self.resolve(&path)).map_err(|source| Error::io(source, path.as_ref(), "read file"))
    }

    /// Streams a file inside the sandbox into the blob store, returning its
    /// digest.
    pub fn get_file_to_storage(&self, path: impl AsRef<Path>, cacher: &FileCacher) -> Result<String, Error> {
        let full = self.resolve(&path);
        let file = File::open(&full).map_err(|source| Error::io(source, path.as_ref(), "open file"))?;
        Ok(cacher.put_file_from_fobj(
            file,
            std::collections::BTreeMap::new(),
            gradecore_config::use_compression(),
            gradecore_config::compression_level(),
        )?)
    }

    /// Returns filesystem metadata for a file in the sandbox.
    pub fn stat_file(&self, path: impl AsRef<Path>) -> Result<fs::Metadata, Error> {
        fs::metadata(self.resolve(&path)).map_err(|source| Error::io(source, path.as_ref(), "stat file"))
    }

    /// `true` if a path exists inside the sandbox.
    #[must_use]
    pub fn file_exists(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).exists()
    }

    /// Removes a file inside the sandbox.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        fs::remove_file(self.resolve(&path)).map_err(|source| Error::io(source, path.as_ref(), "remove file"))
    }

    /// Expands a glob pattern, relative to the sandbox root, into a sorted
    /// list of matching paths relative to the root.
    pub fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, Error> {
        let full_pattern = self.root.join(pattern);
        let pattern_str = full_pattern.to_string_lossy().into_owned();
        let mut matches = Vec::new();
        for entry in glob::glob(&pattern_str).map_err(|source| Error::Glob {
            pattern: pattern.to_string(),
            source,
        })? {
            if let Ok(path) = entry {
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    matches.push(relative.to_path_buf());
                }
            }
        }
        matches.sort();
        Ok(matches)
    }

    fn log_command(&self, argv: &[String]) {
        let line = argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        if let Ok(mut log) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("commands.log"))
        {
            let _ = writeln!(log, "{line}");
        }
    }

    /// Expands `@glob:<pattern>` words and `{memory}`/`{initialMemory}`
    /// placeholders in a command's argv, and returns the effective address
    /// space limit to apply (cleared for JVM-family launchers, which manage
    /// their own heap via `-Xmx`/`-Xms`).
    fn expand_command(&self, command: &[String], address_space_mb: Option<u64>) -> Result<(Vec<String>, Option<u64>), Error> {
        let memory = address_space_mb.unwrap_or(DEFAULT_ADDRESS_SPACE_MB);
        let initial_memory = std::cmp::min(MAX_INITIAL_MEMORY_MB, memory * 9 / 10);

        let mut expanded = Vec::with_capacity(command.len());
        for word in command {
            if let Some(pattern) = word.strip_prefix("@glob:") {
                for path in self.glob(pattern)? {
                    expanded.push(path.to_string_lossy().into_owned());
                }
            } else {
                let substituted = word
                    .replace("{memory}", &memory.to_string())
                    .replace("{initialMemory}", &initial_memory.to_string());
                expanded.push(substituted);
            }
        }

        let is_jvm_launcher = expanded
            .first()
            .and_then(|leader| Path::new(leader).file_name())
            .and_then(|name| name.to_str())
            .is_some_and(|name| matches!(name, "java" | "javac" | "kotlin" | "kotlinc"));

        let effective_address_space = if is_jvm_launcher { None } else { address_space_mb };
        Ok((expanded, effective_address_space))
    }

    fn program_params(&self, params: &SandboxParams, address_space_mb: Option<u64>, pgid: Option<i32>) -> ProgramParams {
        ProgramParams {
            io: ProgramIo {
                stdin: params.stdin_file.as_ref().map(|p| Redirection::Path(self.resolve(p))),
                stdout: params.stdout_file.as_ref().map(|p| Redirection::Path(self.resolve(p))),
                stderr: params.stderr_file.as_ref().map(|p| Redirection::Path(self.resolve(p))),
            },
            chdir: Some(self.root.clone()),
            env: params.set_env.clone(),
            time_limit: params.timeout_ms.map(|ms| ms as f64 / 1000.0),
            wall_time_limit: params.wallclock_timeout_ms.map(|ms| ms as f64 / 1000.0),
            memory_limit: address_space_mb,
            fs_limit: params.fsize_kb,
            pgid,
        }
    }

    /// Runs one command to completion inside the sandbox.
    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    pub fn run(&self, command: &[String], params: SandboxParams) -> Result<SandboxLog, Error> {
        let (argv, address_space_mb) = self.expand_command(command, params.address_space_mb)?;
        self.log_command(&argv);

        let program_params = self.program_params(&params, address_space_mb, None);
        let program = Program::spawn(&argv, program_params)?;
        let result = program.wait()?;

        Ok(SandboxLog {
            exit_status: classify(&result.program_codes),
            execution_time: result.wall_time,
            memory_used: result.memory_used,
            exit_code: result.exit_code,
            killing_signal: result.killing_signal,
            exit_index: None,
            program_codes: result.program_codes,
            alarm_msg: result.alarm_msg,
            params,
        })
    }

    /// Runs a solution against an interactor, connected back-to-back through
    /// the parent via relay threads so both a reap-order `exit_index` and an
    /// optional tagged transcript can be produced.
    #[expect(clippy::too_many_lines, reason = "the coordinated run protocol does not factor cleanly without losing the single wait4 reap loop")]
    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    pub fn run_communication(
        &self,
        solution_command: &[String],
        solution_params: SandboxParams,
        interactor_command: &[String],
        interactor_params: SandboxParams,
        merged_capture: Option<&Path>,
    ) -> Result<(SandboxLog, SandboxLog), Error> {
        let (interactor_argv, interactor_mem) = self.expand_command(interactor_command, interactor_params.address_space_mb)?;
        let (solution_argv, solution_mem) = self.expand_command(solution_command, solution_params.address_space_mb)?;
        self.log_command(&interactor_argv);
        self.log_command(&solution_argv);

        let mut interactor_program_params = self.program_params(&interactor_params, interactor_mem, None);
        interactor_program_params.io.stdin = Some(Redirection::Pipe);
        interactor_program_params.io.stdout = Some(Redirection::Pipe);
        let mut interactor = Program::spawn(&interactor_argv, interactor_program_params)?;

        let interactor_stdout = interactor.take_stdout().expect("pipe requested");
        let interactor_stdin = interactor.take_stdin().expect("pipe requested");

        let mut solution_program_params = self.program_params(&solution_params, solution_mem, Some(interactor.pgid()));
        solution_program_params.io.stdin = Some(Redirection::Pipe);
        solution_program_params.io.stdout = Some(Redirection::Pipe);
        let mut solution = Program::spawn(&solution_argv, solution_program_params)?;

        let solution_stdout = solution.take_stdout().expect("pipe requested");
        let solution_stdin = solution.take_stdin().expect("pipe requested");

        let capture: Option<Arc<Mutex<File>>> = match merged_capture {
            Some(path) => Some(Arc::new(Mutex::new(
                File::create(path).map_err(|source| Error::io(source, path, "create merged capture file"))?,
            ))),
            None => None,
        };

        let pgid = interactor.pgid();

        // Initial tee markers: written unconditionally, in launch order (interactor
        // then solution), before either relay blocks on its first `read_line`. They
        // cannot be keyed to whichever side's data arrives first, since the solution
        // may write before the interactor ever replies.
        if let Some(capture) = &capture {
            if let Ok(mut file) = capture.lock() {
                let _ = writeln!(file, "<");
                let _ = writeln!(file, ">");
            }
        }

        let solution_relay = spawn_relay(interactor_stdout, solution_stdin, '<', capture.clone());
        let interactor_relay = spawn_relay(solution_stdout, interactor_stdin, '>', capture);

        let mut interactor_slot = Some(interactor);
        let mut solution_slot = Some(solution);
        let mut results: [Option<SandboxLog>; 2] = [None, None];

        for exit_index in 0..2u8 {
            let (pid, status, rusage) = reap_group(pgid)?;
            let is_interactor = interactor_slot.as_ref().is_some_and(|p| p.pid() == pid);
            let program = if is_interactor {
                interactor_slot.take()
            } else {
                solution_slot.take()
            };
            let Some(program) = program else {
                continue;
            };
            let result = program.finish_with(status, &rusage);
            let log = SandboxLog {
                exit_status: classify(&result.program_codes),
                execution_time: result.wall_time,
                memory_used: result.memory_used,
                exit_code: result.exit_code,
                killing_signal: result.killing_signal,
                exit_index: Some(exit_index),
                program_codes: result.program_codes,
                alarm_msg: result.alarm_msg,
                params: if is_interactor {
                    interactor_params.clone()
                } else {
                    solution_params.clone()
                },
            };
            results[usize::from(is_interactor)] = Some(log);
        }

        let _ = solution_relay.join();
        let _ = interactor_relay.join();

        let solution_log = results[0].take().unwrap_or_else(|| sandbox_error_log(solution_params.clone()));
        let interactor_log = results[1].take().unwrap_or_else(|| sandbox_error_log(interactor_params.clone()));

        Ok((solution_log, interactor_log))
    }
}

fn sandbox_error_log(params: SandboxParams) -> SandboxLog {
    let mut codes = HashSet::new();
    codes.insert(ProgramCode::Te);
    SandboxLog {
        exit_status: SandboxExitStatus::SandboxError,
        execution_time: 0.0,
        memory_used: 0,
        exit_code: 1,
        killing_signal: None,
        exit_index: None,
        program_codes: codes,
        alarm_msg: None,
        params,
    }
}

fn shell_quote(word: &str) -> String {
    if word.is_empty() || word.contains(|c: char| c.is_whitespace() || "\"'\\$`".contains(c)) {
        format!("'{}'", word.replace('\'', "'\\''"))
    } else {
        word.to_string()
    }
}

fn spawn_relay<R, W>(source: R, mut dest: W, tag: char, capture: Option<Arc<Mutex<File>>>) -> std::thread::JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
    W: std::io::Write + Send + 'static,
{
    std::thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut line = String::new();
        loop {
            line.clear();
            let read = match reader.read_line(&mut line) {
                Ok(n) => n,
                Err(_) => break,
            };
            if read == 0 {
                break;
            }
            if dest.write_all(line.as_bytes()).is_err() {
                break;
            }
            if let Some(capture) = &capture {
                if let Ok(mut file) = capture.lock() {
                    let _ = write!(file, "{tag}{}", line.trim_end_matches('\n'));
                    let _ = writeln!(file);
                }
            }
        }
    })
}
