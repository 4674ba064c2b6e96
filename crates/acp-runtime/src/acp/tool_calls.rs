//! Coordinator bookkeeping for an agent session
//!
//! [`CoordinatorDelegate`] is the stock [`CoordinatorClient`]: it assigns
//! tool-call ids, tracks each call's phase, accumulates the assistant's
//! streamed output, remembers "always allow" answers, and publishes
//! everything on the connection's event bus. Actual yes/no decisions are
//! left to a [`ConfirmationPrompter`].

use super::client::CoordinatorClient;
use super::events::{ConnectionEvent, EventBus};
use crate::error::{AcpError, Error, Result};
use crate::types::{
    AssistantMessageChunk, PushToolCallParams, PushToolCallResponse,
    RequestToolCallConfirmationParams, RequestToolCallConfirmationResponse,
    StreamAssistantMessageChunkParams, ToolCallConfirmation, ToolCallConfirmationOutcome,
    ToolCallId, ToolCallPhase, ToolCallState, UpdateToolCallParams,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Approvals
// ============================================================================

/// A standing approval recorded from an "always allow" answer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApprovalKey {
    Edit,
    Execute { root_command: String },
    McpServer { server: String },
    McpTool { server: String, tool: String },
    Fetch,
}

impl ApprovalKey {
    /// Approvals that would cover `confirmation`
    fn covering(confirmation: &ToolCallConfirmation) -> Vec<ApprovalKey> {
        match confirmation {
            ToolCallConfirmation::Edit { .. } => vec![ApprovalKey::Edit],
            ToolCallConfirmation::Execute { root_command, .. } => vec![ApprovalKey::Execute {
                root_command: root_command.clone(),
            }],
            ToolCallConfirmation::Mcp {
                server_name,
                tool_name,
                ..
            } => vec![
                ApprovalKey::McpServer {
                    server: server_name.clone(),
                },
                ApprovalKey::McpTool {
                    server: server_name.clone(),
                    tool: tool_name.clone(),
                },
            ],
            ToolCallConfirmation::Fetch { .. } => vec![ApprovalKey::Fetch],
            ToolCallConfirmation::Other { .. } => Vec::new(),
        }
    }

    /// Approval to remember after `outcome`, if any
    fn granted(
        confirmation: &ToolCallConfirmation,
        outcome: ToolCallConfirmationOutcome,
    ) -> Option<ApprovalKey> {
        use ToolCallConfirmationOutcome::*;

        match (confirmation, outcome) {
            (_, Allow | Deny | Cancel) => None,
            (
                ToolCallConfirmation::Mcp { server_name, .. },
                AlwaysAllowMcpServer,
            ) => Some(ApprovalKey::McpServer {
                server: server_name.clone(),
            }),
            (
                ToolCallConfirmation::Mcp {
                    server_name,
                    tool_name,
                    ..
                },
                AlwaysAllow | AlwaysAllowTool,
            ) => Some(ApprovalKey::McpTool {
                server: server_name.clone(),
                tool: tool_name.clone(),
            }),
            (ToolCallConfirmation::Other { .. }, _) => None,
            (other, _) => ApprovalKey::covering(other).into_iter().next(),
        }
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Finished calls kept for inspection before the oldest are dropped
const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Tool calls seen on one connection, keyed by coordinator-assigned id
///
/// Calls still awaiting confirmation or running are always kept. Only the
/// most recent `history_limit` finished ones are.
#[derive(Debug)]
pub struct ToolCallTracker {
    next_id: u64,
    calls: BTreeMap<ToolCallId, ToolCallState>,
    /// Finished calls, oldest first
    finished: VecDeque<ToolCallId>,
    history_limit: usize,
    approvals: HashSet<ApprovalKey>,
}

impl Default for ToolCallTracker {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            next_id: 0,
            calls: BTreeMap::new(),
            finished: VecDeque::new(),
            history_limit,
            approvals: HashSet::new(),
        }
    }

    fn allocate_id(&mut self) -> ToolCallId {
        self.next_id += 1;
        ToolCallId(self.next_id)
    }

    pub fn is_pre_approved(&self, confirmation: &ToolCallConfirmation) -> bool {
        ApprovalKey::covering(confirmation)
            .iter()
            .any(|key| self.approvals.contains(key))
    }

    /// Track a call that is waiting for a decision
    pub fn begin_confirmation(&mut self, params: &RequestToolCallConfirmationParams) -> ToolCallState {
        let id = self.allocate_id();
        let mut state = ToolCallState::new(
            id,
            params.label.clone(),
            params.icon,
            ToolCallPhase::AwaitingConfirmation,
        );
        state.content = params.content.clone();
        state.locations = params.locations.clone();
        self.calls.insert(id, state.clone());
        state
    }

    /// Apply the decision for `id`, remembering standing approvals.
    pub fn record_outcome(
        &mut self,
        id: ToolCallId,
        confirmation: &ToolCallConfirmation,
        outcome: ToolCallConfirmationOutcome,
    ) -> Option<ToolCallState> {
        if let Some(key) = ApprovalKey::granted(confirmation, outcome) {
            info!("Remembering approval: {:?}", key);
            self.approvals.insert(key);
        }

        let state = self.calls.get_mut(&id)?;
        let was_terminal = state.phase.is_terminal();
        state.set_phase(if outcome.is_allowed() {
            ToolCallPhase::Running
        } else {
            ToolCallPhase::Denied
        });
        let state = state.clone();
        self.settle(id, was_terminal);
        Some(state)
    }

    pub fn push(&mut self, params: &PushToolCallParams) -> ToolCallState {
        let id = self.allocate_id();
        let mut state = ToolCallState::new(id, params.label.clone(), params.icon, ToolCallPhase::Running);
        state.content = params.content.clone();
        state.locations = params.locations.clone();
        self.calls.insert(id, state.clone());
        state
    }

    /// Status or content change reported by the agent. Unknown ids are rejected.
    pub fn update(&mut self, params: &UpdateToolCallParams) -> Result<ToolCallState> {
        let state = self.calls.get_mut(&params.tool_call_id).ok_or_else(|| {
            Error::Acp(AcpError::InvalidParams(format!(
                "unknown tool call {}",
                params.tool_call_id
            )))
        })?;

        let was_terminal = state.phase.is_terminal();
        state.set_phase(params.status.into());
        if let Some(content) = &params.content {
            state.content = Some(content.clone());
        }
        let state = state.clone();
        self.settle(params.tool_call_id, was_terminal);
        Ok(state)
    }

    /// Note a call that just finished and drop the oldest finished calls
    /// beyond the history limit.
    fn settle(&mut self, id: ToolCallId, was_terminal: bool) {
        let is_terminal = |calls: &BTreeMap<ToolCallId, ToolCallState>, id: &ToolCallId| {
            calls.get(id).is_some_and(|call| call.phase.is_terminal())
        };
        if was_terminal || !is_terminal(&self.calls, &id) {
            return;
        }

        self.finished.push_back(id);
        while self.finished.len() > self.history_limit {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            // A call the agent reopened is active again
            if is_terminal(&self.calls, &oldest) {
                debug!("Dropping tool call {} from history", oldest);
                self.calls.remove(&oldest);
            }
        }
    }

    pub fn get(&self, id: ToolCallId) -> Option<&ToolCallState> {
        self.calls.get(&id)
    }

    /// All tracked calls in id order
    pub fn calls(&self) -> impl Iterator<Item = &ToolCallState> {
        self.calls.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &ToolCallState> {
        self.calls.values().filter(|call| !call.phase.is_terminal())
    }

    pub fn approvals(&self) -> usize {
        self.approvals.len()
    }

    pub fn forget_approvals(&mut self) {
        self.approvals.clear();
    }
}

// ============================================================================
// Transcript
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Text(String),
    Thought(String),
}

/// Assistant output so far, with consecutive chunks of one kind merged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn push(&mut self, chunk: &AssistantMessageChunk) {
        match (self.entries.last_mut(), chunk) {
            (Some(TranscriptEntry::Text(text)), AssistantMessageChunk::Text { text: more }) => {
                text.push_str(more)
            }
            (
                Some(TranscriptEntry::Thought(thought)),
                AssistantMessageChunk::Thought { thought: more },
            ) => thought.push_str(more),
            (_, AssistantMessageChunk::Text { text }) => {
                self.entries.push(TranscriptEntry::Text(text.clone()))
            }
            (_, AssistantMessageChunk::Thought { thought }) => {
                self.entries.push(TranscriptEntry::Thought(thought.clone()))
            }
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Visible answer text, thoughts excluded
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                TranscriptEntry::Text(text) => Some(text.as_str()),
                TranscriptEntry::Thought(_) => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// Delegate
// ============================================================================

/// Decides tool-call confirmations, typically by asking a human
#[async_trait]
pub trait ConfirmationPrompter: Send + Sync {
    async fn confirm(
        &self,
        id: ToolCallId,
        request: &RequestToolCallConfirmationParams,
    ) -> Result<ToolCallConfirmationOutcome>;
}

/// Answers every confirmation the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompter(pub ToolCallConfirmationOutcome);

#[async_trait]
impl ConfirmationPrompter for FixedPrompter {
    async fn confirm(
        &self,
        _id: ToolCallId,
        _request: &RequestToolCallConfirmationParams,
    ) -> Result<ToolCallConfirmationOutcome> {
        Ok(self.0)
    }
}

pub struct CoordinatorDelegate {
    tracker: Mutex<ToolCallTracker>,
    transcript: Mutex<Transcript>,
    prompter: Arc<dyn ConfirmationPrompter>,
    events: EventBus,
    confirmation_timeout: Option<Duration>,
}

impl CoordinatorDelegate {
    pub fn new(prompter: Arc<dyn ConfirmationPrompter>, events: EventBus) -> Self {
        Self {
            tracker: Mutex::new(ToolCallTracker::new()),
            transcript: Mutex::new(Transcript::default()),
            prompter,
            events,
            confirmation_timeout: None,
        }
    }

    /// Bound the wait for a decision; an unanswered confirmation is cancelled.
    pub fn with_confirmation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.lock().clone()
    }

    /// Drain the transcript, e.g. between prompts
    pub fn take_transcript(&self) -> Transcript {
        std::mem::take(&mut *self.transcript.lock())
    }

    pub fn tool_call(&self, id: ToolCallId) -> Option<ToolCallState> {
        self.tracker.lock().get(id).cloned()
    }

    pub fn tool_calls(&self) -> Vec<ToolCallState> {
        self.tracker.lock().calls().cloned().collect()
    }

    async fn decide(
        &self,
        id: ToolCallId,
        params: &RequestToolCallConfirmationParams,
    ) -> Result<ToolCallConfirmationOutcome> {
        let prompt = self.prompter.confirm(id, params);
        match self.confirmation_timeout {
            Some(limit) => match tokio::time::timeout(limit, prompt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Confirmation for tool call {} timed out after {:?}", id, limit);
                    Ok(ToolCallConfirmationOutcome::Cancel)
                }
            },
            None => prompt.await,
        }
    }
}

#[async_trait]
impl CoordinatorClient for CoordinatorDelegate {
    async fn stream_assistant_message_chunk(
        &self,
        params: StreamAssistantMessageChunkParams,
    ) -> Result<()> {
        self.transcript.lock().push(&params.chunk);
        self.events
            .publish(ConnectionEvent::AssistantChunk(params.chunk));
        Ok(())
    }

    async fn request_tool_call_confirmation(
        &self,
        params: RequestToolCallConfirmationParams,
    ) -> Result<RequestToolCallConfirmationResponse> {
        let (state, pre_approved) = {
            let mut tracker = self.tracker.lock();
            let pre_approved = tracker.is_pre_approved(&params.confirmation);
            (tracker.begin_confirmation(&params), pre_approved)
        };
        let id = state.id;

        let outcome = if pre_approved {
            debug!("Tool call {} ({}) already approved", id, params.label);
            ToolCallConfirmationOutcome::Allow
        } else {
            self.events.publish(ConnectionEvent::ConfirmationRequested {
                id,
                label: params.label.clone(),
                confirmation: params.confirmation.clone(),
            });
            self.decide(id, &params).await?
        };

        let updated = self
            .tracker
            .lock()
            .record_outcome(id, &params.confirmation, outcome);
        self.events
            .publish(ConnectionEvent::ConfirmationAnswered { id, outcome });
        if let Some(updated) = updated {
            self.events.publish(ConnectionEvent::ToolCallUpdated(updated));
        }

        info!("Tool call {} ({}): {}", id, params.label, outcome);
        Ok(RequestToolCallConfirmationResponse { id, outcome })
    }

    async fn push_tool_call(&self, params: PushToolCallParams) -> Result<PushToolCallResponse> {
        let state = self.tracker.lock().push(&params);
        let id = state.id;
        debug!("Tool call {} pushed: {}", id, state.label);
        self.events.publish(ConnectionEvent::ToolCallPushed(state));
        Ok(PushToolCallResponse { id })
    }

    async fn update_tool_call(&self, params: UpdateToolCallParams) -> Result<()> {
        let state = self.tracker.lock().update(&params)?;
        debug!("Tool call {} is now {:?}", state.id, state.phase);
        self.events.publish(ConnectionEvent::ToolCallUpdated(state));
        Ok(())
    }
}
