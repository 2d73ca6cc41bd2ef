/// One supervised OS process: spawn, liveness poll, graceful terminate, kill.
///
/// The child runs in its own process group (via `process_group(0)`) so that
/// termination signals also reach anything the bot script spawned. Output is
/// drained line by line on background tasks; nothing is ever left to fill a pipe.
use crate::worker::WorkerSpec;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Upper bound on reaping a process after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback receiving each line a worker writes to stdout or stderr.
pub type LineHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn `interpreter [args..] script` in the spec's working directory.
    pub fn launch(spec: &WorkerSpec, on_line: LineHandler) -> Result<Self, LaunchError> {
        if !spec.script.exists() {
            return Err(LaunchError::ScriptNotFound {
                path: spec.script.clone(),
            });
        }

        tracing::debug!(
            interpreter = %spec.interpreter,
            script = %spec.script.display(),
            cwd = %spec.working_dir.display(),
            "spawning worker process"
        );

        let mut child = Command::new(&spec.interpreter)
            .args(&spec.interpreter_args)
            .arg(&spec.script)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                program: spec.interpreter.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_lines(stdout, Arc::clone(&on_line)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_lines(stderr, on_line));
        }

        Ok(Self {
            child,
            pid,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking check whether the process is still running.
    pub fn is_alive(&mut self) -> Result<bool, PollError> {
        if self.exit_status.is_some() {
            return Ok(false);
        }
        match self.child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                Ok(false)
            }
            Err(e) => Err(PollError {
                pid: self.pid,
                source: e,
            }),
        }
    }

    /// Send SIGTERM to the process group and wait up to `timeout` for exit.
    pub async fn terminate(&mut self, timeout: Duration) -> Result<ExitStatus, TerminateError> {
        if let Some(status) = self.reap_if_exited() {
            return Ok(status);
        }

        self.signal_group(Signal::SIGTERM)?;
        self.wait_for_exit(timeout).await
    }

    /// Send SIGKILL to the process group and reap the child.
    pub async fn kill(&mut self) -> Result<ExitStatus, TerminateError> {
        if let Some(status) = self.reap_if_exited() {
            return Ok(status);
        }

        self.signal_group(Signal::SIGKILL)?;
        self.wait_for_exit(KILL_REAP_TIMEOUT).await
    }

    /// SIGKILL anything the worker left behind in its process group.
    ///
    /// Meant for a leader that already exited on its own; an empty group is
    /// not an error.
    pub fn kill_leftovers(&self) -> Result<(), TerminateError> {
        self.signal_group(Signal::SIGKILL)
    }

    fn reap_if_exited(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_status = Some(status);
            }
        }
        self.exit_status
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> Result<ExitStatus, TerminateError> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                Ok(status)
            }
            Ok(Err(e)) => Err(TerminateError::Wait {
                pid: self.pid,
                source: e,
            }),
            Err(_) => Err(TerminateError::Timeout {
                pid: self.pid,
                timeout,
            }),
        }
    }

    fn signal_group(&self, signal: Signal) -> Result<(), TerminateError> {
        // pid 0 would address our own process group.
        if self.pid == 0 {
            return Ok(());
        }
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TerminateError::Signal {
                pid: self.pid,
                signal,
                source: e,
            }),
        }
    }
}

/// Forward every line of `stream` to `on_line` until EOF.
///
/// Bytes are decoded lossily so a worker printing invalid UTF-8 is still drained.
async fn drain_lines<R: AsyncRead + Unpin>(stream: R, on_line: LineHandler) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\r', '\n']).to_string());
            }
            Err(e) => {
                tracing::debug!(error = %e, "worker output stream closed");
                break;
            }
        }
    }
}

/// Errors from [`ProcessHandle::launch`].
#[derive(Debug)]
pub enum LaunchError {
    /// The worker script does not exist.
    ScriptNotFound { path: PathBuf },
    /// The interpreter could not be spawned.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::ScriptNotFound { path } => {
                write!(f, "script {} does not exist", path.display())
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::ScriptNotFound { .. } => None,
            LaunchError::Spawn { source, .. } => Some(source),
        }
    }
}

/// A liveness poll could not determine the process state.
#[derive(Debug)]
pub struct PollError {
    pub pid: u32,
    pub source: std::io::Error,
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to poll process {}: {}", self.pid, self.source)
    }
}

impl std::error::Error for PollError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Errors from [`ProcessHandle::terminate`] and [`ProcessHandle::kill`].
#[derive(Debug)]
pub enum TerminateError {
    /// The signal could not be delivered.
    Signal {
        pid: u32,
        signal: Signal,
        source: nix::Error,
    },
    /// Waiting on the child failed.
    Wait { pid: u32, source: std::io::Error },
    /// The process was still alive when the deadline passed.
    Timeout { pid: u32, timeout: Duration },
}

impl std::fmt::Display for TerminateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateError::Signal {
                pid,
                signal,
                source,
            } => write!(f, "failed to send {signal} to process {pid}: {source}"),
            TerminateError::Wait { pid, source } => {
                write!(f, "failed to wait for process {pid}: {source}")
            }
            TerminateError::Timeout { pid, timeout } => write!(
                f,
                "process {pid} did not exit within {:.1}s",
                timeout.as_secs_f64()
            ),
        }
    }
}

impl std::error::Error for TerminateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TerminateError::Signal { source, .. } => Some(source),
            TerminateError::Wait { source, .. } => Some(source),
            TerminateError::Timeout { .. } => None,
        }
    }
}
