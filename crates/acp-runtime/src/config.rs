//! Launch and runtime configuration
//!
//! Supplied by setup code, either built in Rust or loaded from TOML:
//!
//! ```toml
//! [agent]
//! name = "gemini"
//! command = "gemini"
//! args = ["--experimental-acp"]
//!
//! [runtime]
//! terminate_grace_ms = 3000
//! confirmation_timeout_ms = 600000
//! ```

use crate::error::{Error, Result};
use crate::types::ACP_PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How to launch the agent subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Display name used in logs
    #[serde(default = "default_agent_name")]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

fn default_agent_name() -> String {
    "agent".to_string()
}

impl AgentConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: default_agent_name(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Config("agent.command must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Timeouts and limits for a connection.
///
/// Durations are stored in milliseconds on disk. A missing timeout means the
/// runtime waits indefinitely, since tool confirmations may sit with a human
/// for as long as they like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Protocol version announced by `initialize`
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Bound on coordinator calls (`initialize`, `sendUserMessage`, ...)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Bound on a human answering `requestToolCallConfirmation`
    #[serde(default)]
    pub confirmation_timeout_ms: Option<u64>,
    /// How long `cancelSendMessage` waits for an acknowledgement
    #[serde(default = "default_cancel_ack_timeout_ms")]
    pub cancel_ack_timeout_ms: Option<u64>,
    /// Grace period between the stop signal and a forced kill
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Frames longer than this are dropped
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_protocol_version() -> String {
    ACP_PROTOCOL_VERSION.to_string()
}

fn default_cancel_ack_timeout_ms() -> Option<u64> {
    Some(5_000)
}

fn default_terminate_grace_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            request_timeout_ms: None,
            confirmation_timeout_ms: None,
            cancel_ack_timeout_ms: default_cancel_ack_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            event_capacity: default_event_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn confirmation_timeout(&self) -> Option<Duration> {
        self.confirmation_timeout_ms.map(Duration::from_millis)
    }

    pub fn cancel_ack_timeout(&self) -> Option<Duration> {
        self.cancel_ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_cancel_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cancel_ack_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace_ms = grace.as_millis() as u64;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.terminate_grace_ms == 0 {
            return Err(Error::Config(
                "runtime.terminate_grace_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config(
                "runtime.event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config(
                "runtime.max_frame_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to bring up one agent connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl LaunchConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.agent.validate()?;
        config.runtime.validate()?;
        Ok(config)
    }
}
