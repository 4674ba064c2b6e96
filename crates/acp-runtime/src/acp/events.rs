//! Connection event stream
//!
//! Append-only feed of what happened on a connection, for UIs and audit
//! persistence. Publishing never blocks; slow subscribers lag and skip.

use super::process::ProcessExit;
use super::session::{SessionState, Transition};
use crate::types::{
    AssistantMessageChunk, ToolCallConfirmation, ToolCallConfirmationOutcome, ToolCallId,
    ToolCallState,
};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    AssistantChunk(AssistantMessageChunk),
    ToolCallPushed(ToolCallState),
    ToolCallUpdated(ToolCallState),
    ConfirmationRequested {
        id: ToolCallId,
        label: String,
        confirmation: ToolCallConfirmation,
    },
    ConfirmationAnswered {
        id: ToolCallId,
        outcome: ToolCallConfirmationOutcome,
    },
    /// A frame from the agent was dropped
    ProtocolViolation(String),
    /// Terminal; nothing follows on this connection
    Disconnected {
        reason: String,
        exit: Option<ProcessExit>,
    },
}

/// Cloneable publisher for [`ConnectionEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub(crate) fn transition(&self, transition: Transition) {
        if transition.is_change() {
            self.publish(ConnectionEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
