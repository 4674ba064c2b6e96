//! ACP (Agent-Coordinator Protocol) runtime
//!
//! The coordinator launches an agent as a child process and talks JSON-RPC 2.0
//! over its stdin/stdout, one JSON document per line.
//!
//! # Architecture
//!
//! ```text
//!   AcpConnection ── request() ──> PendingRequests ──> Transport ──> agent stdin
//!        │                               ^
//!        │                               │ resolve(id)
//!   read loop <── FrameReader <──────────┴────────────────────────── agent stdout
//!        │
//!        └── requests / notifications ──> Dispatcher ──> CoordinatorClient
//! ```
//!
//! - `AgentProcess` owns the child and reports its exit.
//! - `SessionStateMachine` gates which calls are legal at any moment.
//! - `EventBus` carries everything observable to UIs and loggers.
//! - `CoordinatorDelegate` is the stock client: tool-call tracking, the
//!   assistant transcript and remembered approvals.

mod client;
mod codec;
mod connection;
mod correlation;
mod dispatcher;
mod events;
mod process;
mod session;
mod tool_calls;
mod transport;

pub use client::{register_client, CoordinatorClient};
pub use codec::{classify, decode, encode, Envelope};
pub use connection::{AcpConnection, ConnectionBuilder, ConnectionStatus};
pub use correlation::{PendingRequestInfo, PendingRequests, PendingResponse};
pub use dispatcher::{listener_fn, request_fn, Dispatcher, NotificationListener, RequestHandler};
pub use events::{ConnectionEvent, EventBus};
pub use process::{spawn_stderr_drain, AgentProcess, AgentStdio, ProcessExit};
pub use session::{SessionState, SessionStateMachine, Transition};
pub use tool_calls::{
    ApprovalKey, ConfirmationPrompter, CoordinatorDelegate, FixedPrompter, ToolCallTracker,
    Transcript, TranscriptEntry,
};
pub use transport::{BoxedReader, BoxedWriter, FrameReader, Received, Transport};

