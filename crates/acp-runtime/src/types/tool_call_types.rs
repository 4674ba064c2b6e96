//! Coordinator-side view of tool calls

use super::{Icon, ToolCallContent, ToolCallId, ToolCallLocation, ToolCallStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a tracked tool call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    AwaitingConfirmation,
    Denied,
    Running,
    Finished,
    Error,
}

impl ToolCallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Finished | Self::Error)
    }
}

impl From<ToolCallStatus> for ToolCallPhase {
    fn from(status: ToolCallStatus) -> Self {
        match status {
            ToolCallStatus::Running => Self::Running,
            ToolCallStatus::Finished => Self::Finished,
            ToolCallStatus::Error => Self::Error,
        }
    }
}

/// A tool call as reported by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallState {
    pub id: ToolCallId,
    pub label: String,
    pub icon: Icon,
    pub content: Option<ToolCallContent>,
    pub locations: Vec<ToolCallLocation>,
    pub phase: ToolCallPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCallState {
    pub fn new(id: ToolCallId, label: impl Into<String>, icon: Icon, phase: ToolCallPhase) -> Self {
        Self {
            id,
            label: label.into(),
            icon,
            content: None,
            locations: Vec::new(),
            phase,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a new phase, stamping completion time on terminal phases
    pub fn set_phase(&mut self, phase: ToolCallPhase) {
        self.phase = phase;
        if phase.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}
