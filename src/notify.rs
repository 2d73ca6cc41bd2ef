/// Push notifications to connected operators.
///
/// The supervisor core only sees the [`NotificationSink`] trait. The HTTP layer
/// subscribes to a [`BroadcastSink`] and forwards events over Server-Sent Events.
/// Delivery is fire-and-forget: events emitted with no subscriber are dropped.
use crate::worker::WorkerKind;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Event carrying one formatted, timestamped log line.
pub const NEW_LOG: &str = "new_log";
/// Event reporting a worker's running flag after it changed.
pub const BOT_STATUS: &str = "bot_status";

pub trait NotificationSink: Send + Sync {
    fn broadcast(&self, event: &str, payload: Value);
}

/// A single emitted event.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: String,
    pub payload: Value,
}

/// [`NotificationSink`] backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receiver that observes events sent after this call.
    #[cfg(feature = "serve")]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn broadcast(&self, event: &str, payload: Value) {
        let _ = self.tx.send(Notification {
            event: event.to_string(),
            payload,
        });
    }
}

/// Prefix `message` with the local wall-clock time, e.g. `[14:03:27] ...`.
pub fn timestamped(message: &str) -> String {
    format!("[{}] {message}", chrono::Local::now().format("%H:%M:%S"))
}

/// Record an operator-visible action: log it and push it as `new_log`.
pub fn log_action(sink: &dyn NotificationSink, message: &str) {
    let entry = timestamped(message);
    tracing::info!("{message}");
    sink.broadcast(NEW_LOG, json!({ "message": entry }));
}

/// Push a `bot_status` event for `kind`.
pub fn status_changed(sink: &dyn NotificationSink, kind: WorkerKind, running: bool) {
    sink.broadcast(
        BOT_STATUS,
        json!({ "worker": kind.slug(), "running": running }),
    );
}
