/// Liveness monitor for supervised workers.
///
/// Runs alongside the HTTP layer, polling every worker marked as running on a
/// fixed interval. A process that exited on its own (crash, external kill) is
/// reconciled to stopped and reported to operators.
use crate::notify::{log_action, status_changed, NotificationSink};
use crate::process::PollError;
use crate::registry::WorkerRegistry;
use crate::worker::WorkerKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one reconciliation pass found.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Kinds found dead while marked running, now cleared.
    pub stopped: Vec<WorkerKind>,
    /// Kinds whose liveness could not be determined this pass.
    pub poll_errors: Vec<(WorkerKind, PollError)>,
    /// Kinds skipped because an operation held their slot.
    pub busy: Vec<WorkerKind>,
}

/// Bring every slot's desired status in line with the OS process state.
///
/// Kinds are checked independently: a poll error on one is logged and the
/// remaining kinds are still checked. A slot held by an in-flight start or
/// stop is skipped; that operation settles it and the next pass looks again.
pub async fn reconcile(registry: &WorkerRegistry, sink: &dyn NotificationSink) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for kind in WorkerKind::ALL {
        let Some(mut state) = registry.try_lock(kind) else {
            tracing::debug!(worker = %kind, "slot busy, skipping liveness check");
            report.busy.push(kind);
            continue;
        };
        if !state.desired_running {
            continue;
        }

        let alive = match state.handle.as_mut() {
            Some(handle) => handle.is_alive(),
            None => Ok(false),
        };

        match alive {
            Ok(true) => {}
            Ok(false) => {
                let handle = state.clear();
                drop(state);

                let pid = handle.as_ref().map(|h| h.pid());
                if let Some(handle) = &handle {
                    if let Err(e) = handle.kill_leftovers() {
                        tracing::warn!(worker = %kind, error = %e, "failed to kill leftover group members");
                    }
                }
                let detail = handle
                    .as_ref()
                    .and_then(|h| h.exit_status())
                    .map(|status| format!(" ({status})"))
                    .unwrap_or_default();
                tracing::warn!(worker = %kind, pid = ?pid, "worker exited unexpectedly");

                let display = &registry.spec(kind).display_name;
                log_action(sink, &format!("{display} stopped unexpectedly{detail}"));
                status_changed(sink, kind, false);
                report.stopped.push(kind);
            }
            Err(e) => {
                tracing::warn!(worker = %kind, error = %e, "liveness poll failed");
                report.poll_errors.push((kind, e));
            }
        }
    }

    report
}

/// Background loop that reconciles the registry every `interval`.
pub struct LivenessMonitor {
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        sink: Arc<dyn NotificationSink>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            sink,
            interval,
        }
    }

    /// Run a single reconciliation pass.
    pub async fn tick(&self) -> ReconcileReport {
        reconcile(&self.registry, self.sink.as_ref()).await
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "liveness monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.stopped.is_empty() || !report.poll_errors.is_empty() {
                        tracing::debug!(
                            stopped = report.stopped.len(),
                            poll_errors = report.poll_errors.len(),
                            "liveness tick reconciled state"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("liveness monitor stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
