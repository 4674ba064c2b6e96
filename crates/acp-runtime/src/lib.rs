//! ACP Runtime Library
//!
//! Coordinator side of the Agent-Coordinator Protocol:
//! - Agent subprocess supervision
//! - Line-framed JSON-RPC 2.0 transport with request correlation
//! - Inbound dispatch to typed coordinator callbacks
//! - Session state machine and tool-call tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       acp-runtime                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  acp/          - Process, transport, connection, dispatch   │
//! │  config.rs     - Agent and runtime configuration (TOML)     │
//! │  types/        - JSON-RPC and ACP payload types             │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod acp;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{AgentConfig, LaunchConfig, RuntimeConfig};
pub use error::{AcpError, Error, Result};
pub use types::*;

pub use acp::{
    // Connection
    AcpConnection, ConnectionBuilder, ConnectionEvent, ConnectionStatus, EventBus,
    // Session
    SessionState, SessionStateMachine,
    // Dispatch
    register_client, CoordinatorClient, Dispatcher,
    // Coordinator bookkeeping
    ConfirmationPrompter, CoordinatorDelegate, FixedPrompter, ToolCallTracker, Transcript,
    // Process
    AgentProcess, ProcessExit,
};
