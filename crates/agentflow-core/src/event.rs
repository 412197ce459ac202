use serde::Serialize;

use crate::types::RunStatus;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Error,
}

/// Events published by the editor and the execution tracker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Something the user should see (toast, snackbar, CLI line).
    Notification { level: NotifyLevel, message: String },
    /// The open graph changed; `revision` is the graph model's counter.
    GraphChanged { workflow_id: String, revision: u64 },
    /// A tracked execution snapshot changed.
    ExecutionUpdated {
        execution_id: String,
        status: RunStatus,
        steps: usize,
    },
    /// A tracked execution reached a terminal status and polling stopped.
    ExecutionFinished {
        execution_id: String,
        status: RunStatus,
        error: Option<String>,
    },
    /// A poll attempt failed in transport; it is retried on the next tick.
    PollFailed {
        execution_id: String,
        attempt: u32,
        error: String,
    },
}

impl FlowEvent {
    pub fn error(message: impl Into<String>) -> Self {
        FlowEvent::Notification {
            level: NotifyLevel::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        FlowEvent::Notification {
            level: NotifyLevel::Info,
            message: message.into(),
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
