//! Process Isolation Worker.
//!
//! Every snippet runs in one fresh interpreter process launched with the
//! embedded bootstrap shim. The request travels as JSON on stdin and the
//! structured envelope comes back on the process's original stdout, which
//! the shim duplicates before redirecting the snippet's own fd 1 away.
//!
//! The parent owns the deadline: on expiry the whole process group is sent
//! `SIGKILL`, never a signal the snippet could catch.

use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::Result;
use saferun_core::contract::ErrorKind;
use saferun_core::{ExecutionResult, WorkerEnvelope, WorkerPayload};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Python source of the in-process policy shim.
pub const BOOTSTRAP: &str = include_str!("bootstrap.py");

/// `PATH` handed to every worker.
pub const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Exit status a container runtime reports for a `SIGKILL`ed process.
const KILLED_EXIT_CODE: i32 = 137;

/// How long to keep draining pipes after the worker is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How to launch one worker interpreter.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,

    /// Arguments, ending with the interpreter invocation of the shim.
    pub args: Vec<String>,

    /// Complete environment; nothing is inherited from the parent.
    pub env: HashMap<String, String>,

    /// Working directory.
    pub working_dir: Option<PathBuf>,

    /// Apply `RLIMIT_AS`/`RLIMIT_CORE` in the child before exec.
    pub apply_rlimits: bool,
}

impl WorkerCommand {
    /// Run the shim directly under `interpreter`.
    pub fn python(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            program: interpreter.into(),
            args: shim_args(),
            env: base_environment(),
            working_dir: None,
            apply_rlimits: true,
        }
    }

    /// Run the shim through a wrapper such as `docker exec`.
    ///
    /// `prefix` is placed between `program` and the interpreter name.
    pub fn wrapped(program: impl Into<PathBuf>, prefix: Vec<String>, interpreter: &str) -> Self {
        let mut args = prefix;
        args.push(interpreter.to_string());
        args.extend(shim_args());

        Self {
            program: program.into(),
            args,
            env: base_environment(),
            working_dir: None,
            apply_rlimits: false,
        }
    }

    /// Set an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn with_envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

fn shim_args() -> Vec<String> {
    vec!["-I".to_string(), "-c".to_string(), BOOTSTRAP.to_string()]
}

fn base_environment() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("PATH".to_string(), SAFE_PATH.to_string());
    env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
    env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env
}

/// Raw outcome of one worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerRun {
    /// Process exit code, if it exited normally.
    pub exit_code: Option<i32>,

    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,

    /// Envelope channel contents.
    pub stdout: String,

    /// Interpreter-level diagnostics.
    pub stderr: String,

    /// Whether the deadline expired.
    pub timed_out: bool,

    /// Wall clock duration in milliseconds.
    pub duration_ms: u64,
}

impl WorkerRun {
    /// Whether the process died the way an out-of-memory kill looks.
    fn looks_memory_killed(&self) -> bool {
        matches!(self.signal, Some(9) | Some(11)) || self.exit_code == Some(KILLED_EXIT_CODE)
    }

    /// Translate the raw outcome into the uniform result.
    pub fn into_result(self, limits: &ResourceLimits) -> ExecutionResult {
        let duration_ms = self.duration_ms;

        if self.timed_out {
            let mut result = ExecutionResult::timed_out(limits.wall_time_secs);
            result.duration_ms = duration_ms;
            return result.finalize(limits.output_size_bytes);
        }

        let mut result = if self.stdout.trim().is_empty() {
            if self.looks_memory_killed() {
                ExecutionResult::memory_exceeded(self.exit_code)
            } else {
                let mut result = ExecutionResult::infrastructure(match self.exit_code {
                    Some(code) => format!("Worker exited with status {} without a result", code),
                    None => "Worker terminated without a result".to_string(),
                });
                result.exit_code = self.exit_code;
                result.stderr = self.stderr;
                result
            }
        } else {
            match WorkerEnvelope::parse(&self.stdout) {
                Ok(envelope) => {
                    if let Some(kind) = envelope.error_kind {
                        debug!(kind = ?kind, error = ?envelope.error, "Snippet failed in worker");
                    }
                    let exit_code = match envelope.error_kind {
                        Some(ErrorKind::Exit) => envelope.exit_code.or(self.exit_code),
                        _ => self.exit_code,
                    };
                    ExecutionResult {
                        ok: envelope.ok && self.exit_code == Some(0),
                        result: envelope.result,
                        stdout: envelope.stdout,
                        stderr: envelope.stderr,
                        timed_out: false,
                        resource_exceeded: envelope.resource_exceeded,
                        error: envelope.error,
                        exit_code,
                        duration_ms: 0,
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Undecodable worker envelope");
                    let mut result =
                        ExecutionResult::infrastructure("Worker returned an invalid envelope");
                    result.exit_code = self.exit_code;
                    result.stderr = self.stderr;
                    result
                }
            }
        };

        result.duration_ms = duration_ms;
        result.finalize(limits.output_size_bytes)
    }
}

/// Runs one payload per call in a disposable process.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    command: WorkerCommand,
}

impl ProcessWorker {
    /// Create a worker for the given launch description.
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    /// The launch description.
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Run `payload` and fold every failure into an [`ExecutionResult`].
    pub async fn execute(&self, payload: &WorkerPayload, limits: &ResourceLimits) -> ExecutionResult {
        match self.run(payload, limits).await {
            Ok(run) => run.into_result(limits),
            Err(e) => {
                warn!(error = %e, "Worker failed before producing a result");
                ExecutionResult::infrastructure(e.to_string()).finalize(limits.output_size_bytes)
            }
        }
    }

    /// Spawn the worker, feed it `payload`, and wait under the deadline.
    pub async fn run(&self, payload: &WorkerPayload, limits: &ResourceLimits) -> Result<WorkerRun> {
        let input = payload
            .to_json()
            .map_err(|e| SandboxError::Protocol(format!("Failed to encode payload: {}", e)))?;

        let start = Instant::now();
        let mut cmd = self.build_command(limits);
        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::SpawnFailed(format!("{}: {}", self.command.program.display(), e))
        })?;
        let pid = child.id();
        debug!(pid = ?pid, program = %self.command.program.display(), "Worker spawned");

        // The envelope is read whole: the shim already caps the captured
        // streams, and a large `result` is a valid outcome.
        let stdout_task = tokio::spawn(read_to_end(child.stdout.take()));
        let stderr_task = tokio::spawn(read_bounded(child.stderr.take(), limits.diagnostics_bytes()));
        let stdin = child.stdin.take();

        let waited = timeout(limits.wall_time(), async {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Worker closed stdin early");
                }
                drop(stdin);
            }
            child.wait().await
        })
        .await;

        let (status, timed_out) = match waited {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                warn!(pid = ?pid, timeout_secs = limits.wall_time_secs, "Worker deadline expired, killing");
                kill_tree(&mut child, pid).await;
                (None, true)
            }
        };

        let stdout = join_reader(stdout_task).await;
        let stderr = join_reader(stderr_task).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (exit_code, signal) = match status {
            Some(status) => (status.code(), exit_signal(&status)),
            None => (None, Some(9)),
        };
        debug!(pid = ?pid, exit_code = ?exit_code, signal = ?signal, elapsed_ms = duration_ms, "Worker finished");

        Ok(WorkerRun {
            exit_code,
            signal,
            stdout,
            stderr,
            timed_out,
            duration_ms,
        })
    }

    fn build_command(&self, limits: &ResourceLimits) -> Command {
        let spec = &self.command;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if spec.apply_rlimits {
                let memory_bytes = limits.memory_bytes();
                // SAFETY: the hook only calls async-signal-safe setrlimit/getrlimit.
                unsafe {
                    cmd.pre_exec(move || apply_rlimits(memory_bytes));
                }
            }
        }
        #[cfg(not(unix))]
        let _ = limits;

        cmd
    }
}

#[cfg(unix)]
fn apply_rlimits(memory_bytes: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let (_, hard) = getrlimit(Resource::RLIMIT_AS)?;
    let limit = memory_bytes.min(hard);
    setrlimit(Resource::RLIMIT_AS, limit, limit)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Hard-kill the worker and everything it spawned, then reap it.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "killpg failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Worker already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed worker");
    }
}

async fn join_reader(task: tokio::task::JoinHandle<String>) -> String {
    match timeout(DRAIN_GRACE, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader panicked");
            String::new()
        }
        Err(_) => {
            debug!("Output pipe still open after worker exit");
            String::new()
        }
    }
}

/// Drain a stream to EOF, keeping everything.
async fn read_to_end(handle: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    let mut output = Vec::new();
    if let Err(e) = handle.read_to_end(&mut output).await {
        warn!("Error reading envelope channel: {}", e);
    }
    String::from_utf8_lossy(&output).into_owned()
}

/// Drain a stream to EOF, keeping at most `max_size` bytes.
///
/// Reading continues past the cap so a chatty worker never blocks on a
/// full pipe.
async fn read_bounded(handle: Option<impl AsyncRead + Unpin>, max_size: usize) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    let mut output = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match handle.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = max_size.saturating_sub(output.len());
                output.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                warn!("Error reading stream: {}", e);
                break;
            }
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

/// Locate an executable on the host `PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
