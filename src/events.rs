use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle notifications surfaced to whoever renders the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEvent {
    Connected,
    Disconnected,
    ConnectionProblem,
    ConnectionRecovering,
    ConnectionRecovered,
    ConnectionFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        debug!(?event, "emitting call event");
        // nobody listening is fine
        let _ = self.tx.send(event);
    }

    pub fn emit_connected(&self) {
        self.emit(CallEvent::Connected);
    }

    pub fn emit_disconnected(&self) {
        self.emit(CallEvent::Disconnected);
    }

    pub fn emit_connection_problem(&self) {
        self.emit(CallEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovering(&self) {
        self.emit(CallEvent::ConnectionRecovering);
    }

    pub fn emit_connection_recovered(&self) {
        self.emit(CallEvent::ConnectionRecovered);
    }

    pub fn emit_connection_failed(&self, reason: impl Into<String>) {
        self.emit(CallEvent::ConnectionFailed {
            reason: reason.into(),
        });
    }
}
