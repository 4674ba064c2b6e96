//! Error types for the ACP runtime

use crate::acp::SessionState;
use crate::types::{
    JsonRpcError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};
use thiserror::Error;

/// Main error type for runtime operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("ACP protocol error: {0}")]
    Acp(#[from] AcpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Protocol-level errors.
///
/// Per-frame errors (`Decode`, `ProtocolViolation`) never abort the read loop.
/// `ConnectionClosed` is terminal for the connection and is delivered to every
/// pending caller. `InvalidState` is local and never reaches the wire.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcpError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Agent returned error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Request timeout")]
    Timeout,

    #[error("Handler already registered for method: {0}")]
    DuplicateHandler(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl From<JsonRpcError> for AcpError {
    fn from(err: JsonRpcError) -> Self {
        AcpError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl Error {
    /// Whether this error means the connection is gone for good.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::Acp(AcpError::ConnectionClosed(_)))
    }

    /// Translate into the error object written back for a failed inbound call.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Error::Acp(AcpError::MethodNotFound(method)) => {
                JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
            }
            Error::Acp(AcpError::InvalidParams(msg)) => JsonRpcError::new(INVALID_PARAMS, msg),
            Error::Json(e) => JsonRpcError::new(INVALID_PARAMS, e.to_string()),
            Error::Acp(AcpError::Rpc {
                code,
                message,
                data,
            }) => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => JsonRpcError::new(INTERNAL_ERROR, other.to_string()),
        }
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
