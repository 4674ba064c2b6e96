//! ACP method payloads
//!
//! Field names are camelCase on the wire. Snake-case spellings are accepted on
//! input so agents that emit either form interoperate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Protocol version sent with `initialize` unless configured otherwise
pub const ACP_PROTOCOL_VERSION: &str = "1";

/// Method names used on the wire
pub mod methods {
    // Coordinator -> agent
    pub const INITIALIZE: &str = "initialize";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const SEND_USER_MESSAGE: &str = "sendUserMessage";
    pub const CANCEL_SEND_MESSAGE: &str = "cancelSendMessage";

    // Agent -> coordinator
    pub const STREAM_ASSISTANT_MESSAGE_CHUNK: &str = "streamAssistantMessageChunk";
    pub const REQUEST_TOOL_CALL_CONFIRMATION: &str = "requestToolCallConfirmation";
    pub const PUSH_TOOL_CALL: &str = "pushToolCall";
    pub const UPDATE_TOOL_CALL: &str = "updateToolCall";
}

// ============================================================================
// Coordinator -> agent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(alias = "protocol_version")]
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    #[serde(alias = "is_authenticated")]
    pub is_authenticated: bool,
    #[serde(alias = "protocol_version")]
    pub protocol_version: String,
}

/// A piece of user input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserMessageChunk {
    Text { text: String },
    Path { path: PathBuf },
}

impl UserMessageChunk {
    pub fn text(text: impl Into<String>) -> Self {
        UserMessageChunk::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendUserMessageParams {
    pub chunks: Vec<UserMessageChunk>,
}

// ============================================================================
// Agent -> coordinator
// ============================================================================

/// A piece of streamed assistant output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssistantMessageChunk {
    Text { text: String },
    Thought { thought: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAssistantMessageChunkParams {
    pub chunk: AssistantMessageChunk,
}

/// Coordinator-assigned identifier of a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCallId(pub u64);

impl fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Icon {
    FileSearch,
    Folder,
    Globe,
    Hammer,
    LightBulb,
    Pencil,
    Regex,
    Terminal,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolCallContent {
    Markdown {
        markdown: String,
    },
    #[serde(rename_all = "camelCase")]
    Diff {
        path: PathBuf,
        #[serde(default, alias = "old_text")]
        old_text: Option<String>,
        #[serde(alias = "new_text")]
        new_text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLocation {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// What the agent wants to do, shown to whoever answers the confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolCallConfirmation {
    #[serde(rename_all = "camelCase")]
    Edit {
        #[serde(alias = "file_name")]
        file_name: String,
        #[serde(alias = "file_diff")]
        file_diff: String,
    },
    #[serde(rename_all = "camelCase")]
    Execute {
        command: String,
        #[serde(alias = "root_command")]
        root_command: String,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Mcp {
        #[serde(alias = "server_name")]
        server_name: String,
        #[serde(alias = "tool_name")]
        tool_name: String,
        #[serde(alias = "tool_display_name")]
        tool_display_name: String,
        #[serde(default)]
        description: Option<String>,
    },
    Fetch {
        urls: Vec<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Other {
        description: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCallConfirmationOutcome {
    Allow,
    AlwaysAllow,
    AlwaysAllowMcpServer,
    AlwaysAllowTool,
    #[serde(alias = "reject")]
    Deny,
    Cancel,
}

impl ToolCallConfirmationOutcome {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Deny | Self::Cancel)
    }
}

impl fmt::Display for ToolCallConfirmationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allow => "allow",
            Self::AlwaysAllow => "alwaysAllow",
            Self::AlwaysAllowMcpServer => "alwaysAllowMcpServer",
            Self::AlwaysAllowTool => "alwaysAllowTool",
            Self::Deny => "deny",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestToolCallConfirmationParams {
    pub confirmation: ToolCallConfirmation,
    pub icon: Icon,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ToolCallContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ToolCallLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestToolCallConfirmationResponse {
    pub id: ToolCallId,
    pub outcome: ToolCallConfirmationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushToolCallParams {
    pub icon: Icon,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ToolCallContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ToolCallLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushToolCallResponse {
    pub id: ToolCallId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCallStatus {
    Running,
    Finished,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateToolCallParams {
    #[serde(alias = "tool_call_id")]
    pub tool_call_id: ToolCallId,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ToolCallContent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_initialize_response_accepts_both_spellings() {
        let camel: InitializeResponse =
            serde_json::from_value(json!({"isAuthenticated": true, "protocolVersion": "1"}))
                .unwrap();
        let snake: InitializeResponse =
            serde_json::from_value(json!({"is_authenticated": true, "protocol_version": "1"}))
                .unwrap();
        assert_eq!(camel, snake);
        assert!(camel.is_authenticated);
    }

    #[test]
    fn test_user_message_chunks_are_untagged() {
        let params = SendUserMessageParams {
            chunks: vec![UserMessageChunk::text("hi")],
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"chunks": [{"text": "hi"}]})
        );
    }

    #[test]
    fn test_assistant_chunk_variants() {
        let text: AssistantMessageChunk = serde_json::from_value(json!({"text": "a"})).unwrap();
        let thought: AssistantMessageChunk =
            serde_json::from_value(json!({"thought": "b"})).unwrap();
        assert_eq!(text, AssistantMessageChunk::Text { text: "a".into() });
        assert_eq!(thought, AssistantMessageChunk::Thought { thought: "b".into() });
    }

    #[test]
    fn test_confirmation_request_parses() {
        let params: RequestToolCallConfirmationParams = serde_json::from_value(json!({
            "confirmation": {"type": "execute", "command": "rm -rf build", "rootCommand": "rm"},
            "icon": "terminal",
            "label": "Clean build dir",
            "locations": [{"path": "/tmp/build"}]
        }))
        .unwrap();

        assert_eq!(params.icon, Icon::Terminal);
        assert_eq!(params.locations.len(), 1);
        assert!(matches!(
            params.confirmation,
            ToolCallConfirmation::Execute { ref root_command, .. } if root_command == "rm"
        ));
    }

    #[test]
    fn test_unknown_icon_is_tolerated() {
        let icon: Icon = serde_json::from_value(json!("sparkles")).unwrap();
        assert_eq!(icon, Icon::Unknown);
    }

    #[test]
    fn test_outcome_wire_names() {
        assert_eq!(
            serde_json::to_value(ToolCallConfirmationOutcome::Deny).unwrap(),
            json!("deny")
        );
        assert_eq!(
            serde_json::to_value(ToolCallConfirmationOutcome::AlwaysAllowMcpServer).unwrap(),
            json!("alwaysAllowMcpServer")
        );
        let reject: ToolCallConfirmationOutcome = serde_json::from_value(json!("reject")).unwrap();
        assert_eq!(reject, ToolCallConfirmationOutcome::Deny);
        assert!(!reject.is_allowed());
    }

    #[test]
    fn test_update_tool_call_params() {
        let params: UpdateToolCallParams = serde_json::from_value(json!({
            "toolCallId": 3,
            "status": "finished",
            "content": {"type": "markdown", "markdown": "done"}
        }))
        .unwrap();
        assert_eq!(params.tool_call_id, ToolCallId(3));
        assert_eq!(params.status, ToolCallStatus::Finished);
    }
}
