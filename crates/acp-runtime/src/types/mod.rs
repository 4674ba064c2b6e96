//! Shared type definitions
//!
//! JSON-RPC building blocks, ACP method payloads, and the coordinator's view
//! of tool calls.

mod acp_types;
mod jsonrpc_types;
mod tool_call_types;

pub use acp_types::*;
pub use jsonrpc_types::*;
pub use tool_call_types::*;
