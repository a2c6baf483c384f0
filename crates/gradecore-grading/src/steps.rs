//! `compile`, `run`, and `run_coordinated`: the fixed stage-run-harvest
//! scaffold shared by every grading step.

use std::path::{Path, PathBuf};

use gradecore_sandbox::{Sandbox, SandboxExitStatus, SandboxParams};
use gradecore_storage::FileCacher;
use regex::Regex;

use crate::error::Error;
use crate::manifest::{ArtifactManifest, InputSource, OutputDeclaration, PreprocessLog, RunLog};

/// Caller-attached context for a single `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    /// A free-form language tag, recorded in the `RunLog`.
    pub language: Option<String>,
    /// When true, stderr is scanned for sanitizer markers and the `RunLog`'s
    /// `warnings` bit (and the reported time) follow the sanitizer rules.
    pub is_sanitized: bool,
    /// Which attempt this is, when a grading step retries.
    pub retry_index: Option<u32>,
}

fn sanitizer_warning_pattern() -> Regex {
    Regex::new(r"(?i)(runtime error:|==error)").expect("static pattern is valid")
}

fn compiler_warning_pattern() -> Regex {
    Regex::new(r"(?i)warning:").expect("static pattern is valid")
}

fn is_cxx_compiler_leader(leader: &str) -> bool {
    let name = Path::new(leader).file_name().and_then(|n| n.to_str()).unwrap_or(leader);
    matches!(name, "gcc" | "g++" | "clang" | "clang++" | "cc" | "c++")
}

fn is_gcc_family(leader: &str) -> bool {
    let name = Path::new(leader).file_name().and_then(|n| n.to_str()).unwrap_or(leader);
    matches!(name, "gcc" | "g++")
}

/// Resolves the leading token of a command against `PATH`, mirroring a single
/// `which` lookup. Returns the original token unchanged if nothing on `PATH`
/// matches (the runner will surface the spawn failure).
fn resolve_leader(leader: &str) -> String {
    if leader.contains('/') {
        return leader.to_string();
    }
    let Ok(path_var) = std::env::var("PATH") else {
        return leader.to_string();
    };
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(leader);
        if candidate.is_file() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    leader.to_string()
}

/// Follows PATH aliasing for the leader executable and rejects GCC+sanitizer
/// combinations that macOS cannot honor. Clang's implicit `bits/stdc++.h`
/// injection from the reference implementation is not reproduced here: it
/// requires probing a real compiler's include search path (`-v -xc++ -E -`),
/// which this transformation exercise has no toolchain available to exercise
/// or test against.
fn shape_command(command: &[String]) -> Result<Vec<String>, Error> {
    let Some(leader) = command.first() else {
        return Ok(command.to_vec());
    };
    let resolved_leader = resolve_leader(leader);
    if is_cxx_compiler_leader(leader) && cfg!(target_os = "macos") && is_gcc_family(leader) {
        let has_sanitizer = command.iter().any(|arg| arg.starts_with("-fsanitize"));
        if has_sanitizer {
            return Err(Error::SanitizerUnsupportedOnMacosGcc);
        }
    }
    let mut shaped = command.to_vec();
    shaped[0] = resolved_leader;
    Ok(shaped)
}

/// Materializes every declared input into the sandbox, and `touch`es any
/// output flagged to be pre-created empty.
pub fn stage_inputs(sandbox: &Sandbox, manifest: &ArtifactManifest, cacher: &FileCacher) -> Result<(), Error> {
    for input in &manifest.inputs {
        match &input.source {
            InputSource::Path(src) => {
                let host_path = manifest.root.join(src);
                sandbox.create_file_from_other_file(&input.dest, &host_path, input.executable)?;
            }
            InputSource::Digest(holder) => {
                let digest = holder.get()?;
                sandbox.create_file_from_storage(&input.dest, cacher, &digest, input.executable)?;
            }
        }
    }
    for output in &manifest.outputs {
        if output.touch {
            sandbox.create_file_from_bytes(&output.src, b"", output.executable)?;
        }
    }
    Ok(())
}

/// Creates every declared fifo (or symlinks to an external fifo path).
pub fn stage_fifos(sandbox: &Sandbox, manifest: &ArtifactManifest) -> Result<(), Error> {
    for fifo in &manifest.fifos {
        match &fifo.symlink {
            Some(target) => sandbox.create_symlink(&fifo.path, target)?,
            None => sandbox.create_fifo(&fifo.path)?,
        }
    }
    Ok(())
}

/// Streams every declared output out of the sandbox: into the blob store
/// (assigning its `DigestHolder`), and/or copied/symlinked to `dest`.
pub fn harvest_outputs(sandbox: &Sandbox, manifest: &ArtifactManifest, cacher: &FileCacher) -> Result<(), Error> {
    for output in &manifest.outputs {
        harvest_one_output(sandbox, output, &manifest.root, cacher)?;
    }
    Ok(())
}

fn harvest_one_output(sandbox: &Sandbox, output: &OutputDeclaration, root: &Path, cacher: &FileCacher) -> Result<(), Error> {
    if !sandbox.file_exists(&output.src) {
        if output.optional {
            return Ok(());
        }
        return Err(Error::MissingOutput { path: output.src.clone() });
    }

    let digest = if output.digest.is_some() || output.hash {
        Some(sandbox.get_file_to_storage(&output.src, cacher)?)
    } else {
        None
    };
    if let (Some(holder), Some(digest)) = (&output.digest, &digest) {
        holder.set(digest.clone())?;
    }

    if let Some(dest) = &output.dest {
        let host_dest = root.join(dest);
        if let Some(parent) = host_dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::io(source, dest, "create destination directory"))?;
        }
        let symlinked = match &digest {
            Some(digest) => match cacher.path_for_symlink(digest)? {
                Some(target) if output.maxlen.is_none() => {
                    let _ = std::fs::remove_file(&host_dest);
                    std::os::unix::fs::symlink(&target, &host_dest).map_err(|source| Error::io(source, dest, "symlink output"))?;
                    true
                }
                _ => false,
            },
            None => false,
        };
        if !symlinked {
            let mut contents = sandbox.get_file_to_bytes(&output.src)?;
            if let Some(maxlen) = output.maxlen {
                contents.truncate(usize::try_from(maxlen).unwrap_or(usize::MAX));
            }
            std::fs::write(&host_dest, &contents).map_err(|source| Error::io(source, dest, "write output"))?;
        }
        if output.executable {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&host_dest, std::fs::Permissions::from_mode(0o755));
        }
    }
    Ok(())
}

/// Runs a sequence of compile commands, stopping at the first nonzero exit.
/// Records one [`PreprocessLog`] per command into the manifest's log sink (if
/// any) and returns whether every command succeeded.
#[tracing::instrument(skip_all, fields(commands = commands.len()))]
pub fn compile(
    commands: &[Vec<String>],
    params: &SandboxParams,
    sandbox: &Sandbox,
    manifest: &ArtifactManifest,
    cacher: &FileCacher,
) -> Result<bool, Error> {
    stage_inputs(sandbox, manifest, cacher)?;
    stage_fifos(sandbox, manifest)?;

    let mut all_ok = true;
    let warning_pattern = compiler_warning_pattern();
    for (index, command) in commands.iter().enumerate() {
        let shaped = shape_command(command)?;
        let stdout_path = PathBuf::from(format!("compile-{index}.stdout"));
        let stderr_path = PathBuf::from(format!("compile-{index}.stderr"));
        let mut run_params = params.clone();
        run_params.stdout_file = Some(stdout_path.clone());
        run_params.stderr_file = Some(stderr_path.clone());

        let log = sandbox.run(&shaped, run_params)?;
        let stdout = sandbox.get_file_to_string(&stdout_path).unwrap_or_default();
        let stderr = sandbox.get_file_to_string(&stderr_path).unwrap_or_default();
        let warnings = warning_pattern.is_match(&stderr);

        let preprocess_log = PreprocessLog {
            command: shaped,
            exit_status: log.exit_status,
            combined_output: format!("{stdout}{stderr}"),
            warnings,
            wall_time: log.execution_time,
            memory_used: log.memory_used,
        };

        let succeeded = log.exit_status == SandboxExitStatus::Ok;
        if let Some(sink) = &manifest.logs {
            sink.lock().expect("manifest log sink poisoned").preprocess.push(preprocess_log);
        }
        if !succeeded {
            all_ok = false;
            break;
        }
    }

    if all_ok {
        harvest_outputs(sandbox, manifest, cacher)?;
    }
    Ok(all_ok)
}

fn build_run_log(
    exit_code: i32,
    exit_status: SandboxExitStatus,
    wall_time: f64,
    cpu_time: f64,
    memory_used: u64,
    warnings: bool,
    exit_index: Option<u8>,
    metadata: &RunMetadata,
    timeout_floor_seconds: Option<f64>,
) -> RunLog {
    let is_timeout = matches!(exit_status, SandboxExitStatus::Timeout | SandboxExitStatus::TimeoutWall);
    let reported_wall_time = match (is_timeout, timeout_floor_seconds) {
        (true, Some(floor)) => wall_time.max(floor),
        _ => wall_time,
    };
    let reported_cpu_time = match (is_timeout, timeout_floor_seconds) {
        (true, Some(floor)) => cpu_time.max(floor),
        _ => cpu_time,
    };

    let mut metadata_map = std::collections::BTreeMap::new();
    if let Some(language) = &metadata.language {
        metadata_map.insert("language".to_string(), serde_json::Value::String(language.clone()));
    }
    metadata_map.insert("is_sanitized".to_string(), serde_json::Value::Bool(metadata.is_sanitized));
    if let Some(retry) = metadata.retry_index {
        metadata_map.insert("retry_index".to_string(), serde_json::Value::from(retry));
    }

    RunLog {
        exit_code,
        exit_status,
        wall_time: reported_wall_time,
        cpu_time: reported_cpu_time,
        memory_used,
        warnings,
        exit_index,
        metadata: metadata_map,
    }
}

/// Executes exactly one command and records a [`RunLog`].
#[tracing::instrument(skip_all, fields(language = metadata.language.as_deref()))]
pub fn run(
    command: &[String],
    params: &SandboxParams,
    sandbox: &Sandbox,
    manifest: &ArtifactManifest,
    cacher: &FileCacher,
    metadata: RunMetadata,
) -> Result<RunLog, Error> {
    stage_inputs(sandbox, manifest, cacher)?;
    stage_fifos(sandbox, manifest)?;

    let shaped = shape_command(command)?;
    let timeout_floor = params.timeout_ms.map(|ms| ms as f64 / 1000.0);
    let log = sandbox.run(&shaped, params.clone())?;

    let warnings = if metadata.is_sanitized {
        match &params.stderr_file {
            Some(stderr_path) => {
                let stderr = sandbox.get_file_to_string(stderr_path).unwrap_or_default();
                sanitizer_warning_pattern().is_match(&stderr)
            }
            None => false,
        }
    } else {
        false
    };

    let run_log = build_run_log(
        log.exit_code,
        log.exit_status,
        log.execution_time,
        log.execution_time,
        log.memory_used,
        warnings,
        None,
        &metadata,
        timeout_floor,
    );

    if log.exit_status == SandboxExitStatus::Ok || !manifest.outputs.is_empty() {
        harvest_outputs(sandbox, manifest, cacher)?;
    }

    if let Some(sink) = &manifest.logs {
        sink.lock().expect("manifest log sink poisoned").run = Some(run_log.clone());
    }
    Ok(run_log)
}

/// Runs a solution against an interactor through the sandbox's coordinated
/// (two-process) path, and records `run` + `interactor_run` into the
/// manifest's log sink.
#[expect(clippy::too_many_arguments, reason = "mirrors the reference implementation's run_coordinated signature")]
#[tracing::instrument(skip_all)]
pub fn run_coordinated(
    solution_command: &[String],
    solution_params: &SandboxParams,
    interactor_command: &[String],
    interactor_params: &SandboxParams,
    sandbox: &Sandbox,
    manifest: &ArtifactManifest,
    cacher: &FileCacher,
    merged_capture: Option<&Path>,
) -> Result<(RunLog, RunLog), Error> {
    stage_inputs(sandbox, manifest, cacher)?;
    stage_fifos(sandbox, manifest)?;

    let shaped_solution = shape_command(solution_command)?;
    let shaped_interactor = shape_command(interactor_command)?;

    let (solution_log, interactor_log) = sandbox.run_communication(
        &shaped_solution,
        solution_params.clone(),
        &shaped_interactor,
        interactor_params.clone(),
        merged_capture,
    )?;

    let solution_run_log = build_run_log(
        solution_log.exit_code,
        solution_log.exit_status,
        solution_log.execution_time,
        solution_log.execution_time,
        solution_log.memory_used,
        false,
        solution_log.exit_index,
        &RunMetadata::default(),
        None,
    );
    let interactor_run_log = build_run_log(
        interactor_log.exit_code,
        interactor_log.exit_status,
        interactor_log.execution_time,
        interactor_log.execution_time,
        interactor_log.memory_used,
        false,
        interactor_log.exit_index,
        &RunMetadata::default(),
        None,
    );

    harvest_outputs(sandbox, manifest, cacher)?;

    if let Some(sink) = &manifest.logs {
        let mut logs = sink.lock().expect("manifest log sink poisoned");
        logs.run = Some(solution_run_log.clone());
        logs.interactor_run = Some(interactor_run_log.clone());
    }

    Ok((solution_run_log, interactor_run_log))
}
