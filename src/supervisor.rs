/// Start, stop and restart named workers against the registry.
///
/// Every operation holds the kind's slot lock for its whole duration, so a
/// double start never yields two processes and of two concurrent stops exactly
/// one succeeds. Operator-visible outcomes are pushed through the
/// [`NotificationSink`]; failures are returned as [`OpError`], never panics.
use crate::monitor;
use crate::notify::{log_action, status_changed, timestamped, NotificationSink, NEW_LOG};
use crate::process::{LaunchError, LineHandler, ProcessHandle, TerminateError};
use crate::registry::WorkerRegistry;
use crate::worker::WorkerKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Timing knobs for supervisor operations.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long a worker gets to exit after SIGTERM before SIGKILL.
    pub stop_timeout: Duration,
    /// Pause between the stop and start halves of a restart.
    pub restart_settle: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            restart_settle: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub kind: WorkerKind,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub kind: WorkerKind,
    pub pid: Option<u32>,
    /// The worker ignored SIGTERM for the whole stop timeout and was killed.
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub kind: WorkerKind,
    pub previous_pid: Option<u32>,
    pub pid: u32,
}

#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn NotificationSink>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        sink: Arc<dyn NotificationSink>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            sink,
            settings,
        }
    }

    pub fn display_name(&self, kind: WorkerKind) -> &str {
        &self.registry.spec(kind).display_name
    }

    /// Launch `kind` unless it is already marked running.
    pub async fn start(&self, kind: WorkerKind) -> Result<StartOutcome, OpError> {
        let spec = self.registry.spec(kind);
        let mut state = self.registry.lock(kind).await;
        if state.desired_running {
            return Err(OpError::AlreadyRunning { kind });
        }

        let handle = match ProcessHandle::launch(spec, self.output_forwarder(kind)) {
            Ok(handle) => handle,
            Err(LaunchError::ScriptNotFound { path }) => {
                tracing::warn!(worker = %kind, script = %path.display(), "worker script not found");
                log_action(
                    self.sink.as_ref(),
                    &format!(
                        "Failed to start {}: script {} does not exist",
                        spec.display_name,
                        path.display()
                    ),
                );
                return Err(OpError::ScriptNotFound { kind, path });
            }
            Err(e) => {
                tracing::error!(worker = %kind, error = %e, "failed to launch worker");
                log_action(
                    self.sink.as_ref(),
                    &format!("Failed to start {}: {e}", spec.display_name),
                );
                return Err(OpError::Launch { kind, source: e });
            }
        };

        let pid = handle.pid();
        state.set_running(handle);
        drop(state);

        tracing::info!(worker = %kind, pid, "worker started");
        log_action(
            self.sink.as_ref(),
            &format!("{} started (PID: {pid})", spec.display_name),
        );
        status_changed(self.sink.as_ref(), kind, true);
        Ok(StartOutcome { kind, pid })
    }

    /// Terminate `kind` if it is marked running.
    ///
    /// The slot is cleared whatever the termination result. A worker that
    /// outlives the stop timeout is killed; `TerminateTimeout` is returned only
    /// when even that cannot be confirmed.
    pub async fn stop(&self, kind: WorkerKind) -> Result<StopOutcome, OpError> {
        let display = self.display_name(kind);
        let mut state = self.registry.lock(kind).await;
        if !state.desired_running {
            return Err(OpError::NotRunning { kind });
        }

        let handle = state.clear();
        let pid = handle.as_ref().map(ProcessHandle::pid);
        let result = match handle {
            Some(mut handle) => self.shut_down(kind, &mut handle).await,
            None => Ok(false),
        };
        // Released only after the old process is gone, so a racing start
        // cannot overlap it.
        drop(state);

        status_changed(self.sink.as_ref(), kind, false);
        match result {
            Ok(forced) => {
                let suffix = if forced { " (killed after stop timeout)" } else { "" };
                log_action(self.sink.as_ref(), &format!("{display} stopped{suffix}"));
                Ok(StopOutcome { kind, pid, forced })
            }
            Err(e) => {
                tracing::error!(worker = %kind, error = %e, "worker exit not confirmed");
                log_action(
                    self.sink.as_ref(),
                    &format!("{display} stopped, but its exit could not be confirmed: {e}"),
                );
                Err(OpError::TerminateTimeout {
                    kind,
                    pid,
                    source: e,
                })
            }
        }
    }

    /// Stop (if running), wait for the settle delay, then start.
    pub async fn restart(&self, kind: WorkerKind) -> Result<RestartOutcome, OpError> {
        let previous_pid = match self.stop(kind).await {
            Ok(outcome) => outcome.pid,
            Err(OpError::NotRunning { .. }) => None,
            Err(e) => {
                tracing::warn!(worker = %kind, error = %e, "stop during restart failed, starting anyway");
                e.pid()
            }
        };

        tokio::time::sleep(self.settings.restart_settle).await;

        let started = self.start(kind).await?;
        log_action(
            self.sink.as_ref(),
            &format!("{} restarted", self.display_name(kind)),
        );
        Ok(RestartOutcome {
            kind,
            previous_pid,
            pid: started.pid,
        })
    }

    /// Running flag per kind, after correcting any crashed workers.
    pub async fn current_status(&self) -> BTreeMap<WorkerKind, bool> {
        monitor::reconcile(&self.registry, self.sink.as_ref()).await;
        self.registry.snapshot()
    }

    /// Stop every running worker; used when the panel shuts down.
    pub async fn stop_all(&self) {
        for kind in WorkerKind::ALL {
            match self.stop(kind).await {
                Ok(_) | Err(OpError::NotRunning { .. }) => {}
                Err(e) => tracing::warn!(worker = %kind, error = %e, "failed to stop worker on shutdown"),
            }
        }
    }

    /// Returns `true` when the worker had to be killed.
    async fn shut_down(
        &self,
        kind: WorkerKind,
        handle: &mut ProcessHandle,
    ) -> Result<bool, TerminateError> {
        match handle.terminate(self.settings.stop_timeout).await {
            Ok(status) => {
                tracing::debug!(worker = %kind, pid = handle.pid(), %status, "worker exited");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(
                    worker = %kind,
                    pid = handle.pid(),
                    error = %e,
                    "graceful stop not confirmed, sending SIGKILL"
                );
                handle.kill().await?;
                Ok(true)
            }
        }
    }

    /// Push each worker output line to operators, tagged with the display name.
    fn output_forwarder(&self, kind: WorkerKind) -> LineHandler {
        let sink = Arc::clone(&self.sink);
        let display = self.display_name(kind).to_string();
        Arc::new(move |line: String| {
            tracing::debug!(worker = %kind, "{line}");
            sink.broadcast(
                NEW_LOG,
                serde_json::json!({ "message": timestamped(&format!("[{display}] {line}")) }),
            );
        })
    }
}

/// Failure of a supervisor operation.
#[derive(Debug)]
pub enum OpError {
    AlreadyRunning {
        kind: WorkerKind,
    },
    NotRunning {
        kind: WorkerKind,
    },
    ScriptNotFound {
        kind: WorkerKind,
        path: PathBuf,
    },
    /// The interpreter could not be spawned.
    Launch {
        kind: WorkerKind,
        source: LaunchError,
    },
    /// Neither SIGTERM nor SIGKILL confirmed the exit. The slot is cleared anyway.
    TerminateTimeout {
        kind: WorkerKind,
        pid: Option<u32>,
        source: TerminateError,
    },
}

impl OpError {
    pub fn kind(&self) -> WorkerKind {
        match self {
            OpError::AlreadyRunning { kind }
            | OpError::NotRunning { kind }
            | OpError::ScriptNotFound { kind, .. }
            | OpError::Launch { kind, .. }
            | OpError::TerminateTimeout { kind, .. } => *kind,
        }
    }

    /// Stable machine-readable tag for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            OpError::AlreadyRunning { .. } => "already_running",
            OpError::NotRunning { .. } => "not_running",
            OpError::ScriptNotFound { .. } => "script_not_found",
            OpError::Launch { .. } => "launch_failed",
            OpError::TerminateTimeout { .. } => "terminate_timeout",
        }
    }

    fn pid(&self) -> Option<u32> {
        match self {
            OpError::TerminateTimeout { pid, .. } => *pid,
            _ => None,
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::AlreadyRunning { kind } => write!(f, "{kind} bot is already running"),
            OpError::NotRunning { kind } => write!(f, "{kind} bot is not running"),
            OpError::ScriptNotFound { kind, path } => {
                write!(f, "{kind} bot script {} does not exist", path.display())
            }
            OpError::Launch { kind, source } => write!(f, "failed to start {kind} bot: {source}"),
            OpError::TerminateTimeout { kind, source, .. } => {
                write!(f, "failed to confirm {kind} bot exit: {source}")
            }
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpError::Launch { source, .. } => Some(source),
            OpError::TerminateTimeout { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::LivenessMonitor;
    use crate::notify::testing::RecordingSink;
    use crate::process::testing::{kill_out_of_band, sh_spec, write_script};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::watch;

    const LONG_RUNNING: &str = "exec sleep 30\n";
    const IGNORES_SIGTERM: &str = "trap '' TERM\nwhile true; do sleep 0.1; done\n";

    struct Fixture {
        dir: TempDir,
        registry: Arc<WorkerRegistry>,
        sink: Arc<RecordingSink>,
        supervisor: Supervisor,
    }

    /// Chat bot runs `chat_body`; the messaging bot script is only written
    /// when `messaging_body` is given.
    fn fixture(chat_body: &str, messaging_body: Option<&str>) -> Fixture {
        let dir = tempdir().unwrap();
        let chat = write_script(dir.path(), "chat.sh", chat_body);
        let messaging = match messaging_body {
            Some(body) => write_script(dir.path(), "messaging.sh", body),
            None => dir.path().join("messaging.sh"),
        };
        let root = dir.path().to_path_buf();
        let registry = Arc::new(WorkerRegistry::new(|kind| match kind {
            WorkerKind::ChatBot => sh_spec(&root, "Twitch Bot", chat.clone()),
            WorkerKind::MessagingBot => sh_spec(&root, "Discord Bot", messaging.clone()),
        }));
        let sink = Arc::new(RecordingSink::default());
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            sink.clone(),
            SupervisorSettings {
                stop_timeout: Duration::from_secs(2),
                restart_settle: Duration::from_millis(50),
            },
        );
        Fixture {
            dir,
            registry,
            sink,
            supervisor,
        }
    }

    async fn wait_for_status(sup: &Supervisor, kind: WorkerKind, want: bool) -> bool {
        for _ in 0..100 {
            if sup.current_status().await[&kind] == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn remove(path: &Path) {
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn start_reports_pid_and_status() {
        let fx = fixture(LONG_RUNNING, None);

        let outcome = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();
        assert_eq!(outcome.kind, WorkerKind::ChatBot);
        assert!(outcome.pid > 0);

        let status = fx.supervisor.current_status().await;
        assert_eq!(
            status,
            BTreeMap::from([
                (WorkerKind::ChatBot, true),
                (WorkerKind::MessagingBot, false)
            ])
        );

        let lines = fx.sink.log_lines();
        assert!(lines
            .iter()
            .any(|l| l.ends_with(&format!("Twitch Bot started (PID: {})", outcome.pid))));

        fx.supervisor.stop(WorkerKind::ChatBot).await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_keeps_one_process() {
        let fx = fixture(LONG_RUNNING, None);

        let first = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();
        let err = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap_err();
        assert!(matches!(err, OpError::AlreadyRunning { kind: WorkerKind::ChatBot }));
        assert_eq!(err.code(), "already_running");

        let state = fx.registry.lock(WorkerKind::ChatBot).await;
        assert_eq!(state.pid(), Some(first.pid));
        drop(state);

        fx.supervisor.stop(WorkerKind::ChatBot).await.unwrap();
    }

    #[tokio::test]
    async fn stop_on_never_started_worker_is_not_running() {
        let fx = fixture(LONG_RUNNING, None);

        let err = fx.supervisor.stop(WorkerKind::MessagingBot).await.unwrap_err();
        assert!(matches!(err, OpError::NotRunning { kind: WorkerKind::MessagingBot }));
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn missing_script_leaves_state_unchanged() {
        let fx = fixture(LONG_RUNNING, None);

        let err = fx.supervisor.start(WorkerKind::MessagingBot).await.unwrap_err();
        assert!(matches!(err, OpError::ScriptNotFound { kind: WorkerKind::MessagingBot, .. }));

        let state = fx.registry.lock(WorkerKind::MessagingBot).await;
        assert!(!state.desired_running);
        assert!(state.handle.is_none());
    }

    #[tokio::test]
    async fn stop_clears_state_and_notifies() {
        let fx = fixture(LONG_RUNNING, None);
        let started = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();

        let stopped = fx.supervisor.stop(WorkerKind::ChatBot).await.unwrap();
        assert_eq!(stopped.pid, Some(started.pid));
        assert!(!stopped.forced);
        assert!(!fx.registry.snapshot()[&WorkerKind::ChatBot]);
        assert!(fx.sink.log_lines().last().unwrap().ends_with("Twitch Bot stopped"));

        // A second stop is an error, not a crash.
        let err = fx.supervisor.stop(WorkerKind::ChatBot).await.unwrap_err();
        assert!(matches!(err, OpError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn stop_kills_worker_that_ignores_sigterm() {
        let fx = fixture(IGNORES_SIGTERM, None);
        let supervisor = Supervisor::new(
            Arc::clone(&fx.registry),
            fx.sink.clone(),
            SupervisorSettings {
                stop_timeout: Duration::from_millis(300),
                restart_settle: Duration::from_millis(50),
            },
        );

        supervisor.start(WorkerKind::ChatBot).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = supervisor.stop(WorkerKind::ChatBot).await.unwrap();
        assert!(outcome.forced);
        assert!(!fx.registry.snapshot()[&WorkerKind::ChatBot]);
        assert!(fx
            .sink
            .log_lines()
            .last()
            .unwrap()
            .contains("killed after stop timeout"));
    }

    #[tokio::test]
    async fn out_of_band_kill_is_reflected_in_current_status() {
        let fx = fixture(LONG_RUNNING, None);
        let started = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();

        kill_out_of_band(started.pid);

        assert!(wait_for_status(&fx.supervisor, WorkerKind::ChatBot, false).await);
        assert!(fx
            .sink
            .log_lines()
            .iter()
            .any(|l| l.contains("Twitch Bot stopped unexpectedly")));
    }

    #[tokio::test]
    async fn monitor_tick_catches_crash_without_status_call() {
        let fx = fixture(LONG_RUNNING, None);
        let started = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = LivenessMonitor::new(
            Arc::clone(&fx.registry),
            fx.sink.clone(),
            Duration::from_millis(50),
        )
        .spawn(rx);

        kill_out_of_band(started.pid);
        let mut running = true;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            running = fx.registry.snapshot()[&WorkerKind::ChatBot];
            if !running {
                break;
            }
        }
        assert!(!running);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn restart_running_worker_replaces_process() {
        let fx = fixture(LONG_RUNNING, None);
        let first = fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();

        let outcome = fx.supervisor.restart(WorkerKind::ChatBot).await.unwrap();
        assert_eq!(outcome.previous_pid, Some(first.pid));
        assert_ne!(outcome.pid, first.pid);

        let state = fx.registry.lock(WorkerKind::ChatBot).await;
        assert!(state.desired_running);
        assert_eq!(state.pid(), Some(outcome.pid));
        drop(state);

        assert!(fx.sink.log_lines().last().unwrap().ends_with("Twitch Bot restarted"));
        fx.supervisor.stop(WorkerKind::ChatBot).await.unwrap();
    }

    #[tokio::test]
    async fn restart_stopped_worker_acts_like_start() {
        let fx = fixture(LONG_RUNNING, Some(LONG_RUNNING));

        let outcome = fx.supervisor.restart(WorkerKind::MessagingBot).await.unwrap();
        assert_eq!(outcome.previous_pid, None);
        assert!(fx.registry.snapshot()[&WorkerKind::MessagingBot]);
        assert!(!fx.registry.snapshot()[&WorkerKind::ChatBot]);

        fx.supervisor.stop(WorkerKind::MessagingBot).await.unwrap();
    }

    #[tokio::test]
    async fn restart_with_failing_start_ends_stopped() {
        let fx = fixture(LONG_RUNNING, None);
        fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();
        remove(&fx.dir.path().join("chat.sh"));

        let err = fx.supervisor.restart(WorkerKind::ChatBot).await.unwrap_err();
        assert!(matches!(err, OpError::ScriptNotFound { .. }));
        assert!(!fx.registry.snapshot()[&WorkerKind::ChatBot]);
    }

    #[tokio::test]
    async fn concurrent_stops_yield_one_success() {
        let fx = fixture(LONG_RUNNING, None);
        fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();

        let a = fx.supervisor.clone();
        let b = fx.supervisor.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.stop(WorkerKind::ChatBot).await }),
            tokio::spawn(async move { b.stop(WorkerKind::ChatBot).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let not_running = results
            .iter()
            .filter(|r| matches!(r, Err(OpError::NotRunning { .. })))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(not_running, 1);
    }

    #[tokio::test]
    async fn worker_output_is_forwarded_with_display_name() {
        let fx = fixture("echo hello from bot\nexec sleep 30\n", None);
        fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();

        let mut found = false;
        for _ in 0..100 {
            if fx
                .sink
                .log_lines()
                .iter()
                .any(|l| l.ends_with("[Twitch Bot] hello from bot"))
            {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found);

        fx.supervisor.stop(WorkerKind::ChatBot).await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_stops_every_running_worker() {
        let fx = fixture(LONG_RUNNING, Some(LONG_RUNNING));
        fx.supervisor.start(WorkerKind::ChatBot).await.unwrap();
        fx.supervisor.start(WorkerKind::MessagingBot).await.unwrap();

        fx.supervisor.stop_all().await;

        let snapshot = fx.registry.snapshot();
        assert!(snapshot.values().all(|running| !running));
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let fx = fixture(LONG_RUNNING, None);
        let root = fx.dir.path().to_path_buf();
        let chat = fx.dir.path().join("chat.sh");
        let registry = Arc::new(WorkerRegistry::new(|_| {
            let mut spec = sh_spec(&root, "Twitch Bot", chat.clone());
            spec.interpreter = "nonexistent-interpreter-xyz".to_string();
            spec
        }));
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            fx.sink.clone(),
            SupervisorSettings::default(),
        );

        let err = supervisor.start(WorkerKind::ChatBot).await.unwrap_err();
        assert_eq!(err.code(), "launch_failed");
        assert!(!registry.snapshot()[&WorkerKind::ChatBot]);
        assert!(fx
            .sink
            .log_lines()
            .last()
            .unwrap()
            .contains("Failed to start Twitch Bot"));
    }
}
