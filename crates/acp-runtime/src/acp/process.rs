//! Agent process supervision
//!
//! The child is owned by a monitor task that reaps it the moment it exits and
//! publishes the exit status on a watch channel. Termination asks politely
//! first (SIGTERM on unix) and falls back to a kill once the grace period runs
//! out.

use crate::config::AgentConfig;
use crate::error::{AcpError, Error, Result};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How the agent process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(ExitStatus),
    /// The OS could not report a status for the child
    Unknown(String),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited(status) if status.success())
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Exited(status) => status.code(),
            ProcessExit::Unknown(_) => None,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited(status) => write!(f, "{}", status),
            ProcessExit::Unknown(reason) => write!(f, "unknown exit ({})", reason),
        }
    }
}

/// Pipes taken from a freshly spawned agent
pub struct AgentStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Handle to a running agent subprocess
pub struct AgentProcess {
    name: String,
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    _monitor_task: JoinHandle<()>,
}

impl AgentProcess {
    /// Spawn the agent with piped stdin, stdout and stderr.
    pub fn start(config: &AgentConfig) -> Result<(Self, AgentStdio)> {
        debug!(
            "Spawning agent {}: {} {:?} (cwd: {:?})",
            config.name, config.command, config.args, config.cwd
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Acp(AcpError::Spawn(format!(
                "failed to launch {}: {}",
                config.command, e
            )))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Acp(AcpError::Spawn("failed to capture stdin".to_string())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Acp(AcpError::Spawn("failed to capture stdout".to_string())))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Acp(AcpError::Spawn("failed to capture stderr".to_string())))?;

        let pid = child.id();
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor_task = tokio::spawn(Self::monitor(config.name.clone(), child, kill_rx, exit_tx));

        info!("Agent {} started (pid {:?})", config.name, pid);

        Ok((
            Self {
                name: config.name.clone(),
                pid,
                kill_tx,
                exit_rx,
                _monitor_task: monitor_task,
            },
            AgentStdio {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    /// Owns the child until it exits, forwarding kill requests to it
    async fn monitor(
        name: String,
        mut child: Child,
        mut kill_rx: mpsc::Receiver<()>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
    ) {
        let mut handle_alive = true;
        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => ProcessExit::Exited(status),
                        Err(e) => ProcessExit::Unknown(e.to_string()),
                    };
                }
                request = kill_rx.recv(), if handle_alive => {
                    if request.is_none() {
                        // Nobody can stop the agent anymore; don't leave it running.
                        debug!("Handle for agent {} dropped, killing", name);
                        handle_alive = false;
                    }
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill agent {}: {}", name, e);
                    }
                }
            }
        };

        info!("Agent {} exited: {}", name, exit);
        exit_tx.send_replace(Some(exit));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already been reaped
    pub fn try_wait(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Watch channel that flips to `Some` once the process has been reaped
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Wait until the process exits.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(|| ProcessExit::Unknown("process monitor stopped".to_string()))
    }

    /// Ask the agent to stop, then kill it if it is still alive after `grace`.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.try_wait() {
            return exit;
        }

        info!("Terminating agent {} (grace {:?})", self.name, grace);
        self.signal_stop();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "Agent {} still running after {:?}, killing",
                    self.name, grace
                );
                self.kill().await
            }
        }
    }

    /// Kill immediately and wait for the process to be reaped.
    pub async fn kill(&self) -> ProcessExit {
        if self.kill_tx.send(()).await.is_err() {
            debug!("Agent {} monitor already finished", self.name);
        }
        self.wait().await
    }

    #[cfg(unix)]
    fn signal_stop(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };

        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(pid as i32);
        if let Err(e) = kill(target, Signal::SIGTERM) {
            debug!("SIGTERM to agent {} (pid {}) failed: {}", self.name, pid, e);
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&self) {
        // No graceful signal here; the grace period still gives a closed stdin
        // time to take effect before the kill.
        debug!("Agent {} has no stop signal on this platform", self.name);
    }
}

/// Drain agent stderr into the log so the child can never block on a full pipe.
pub fn spawn_stderr_drain(name: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Agent {} stderr closed", name);
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        // Agents log here routinely; not an error by itself.
                        warn!("Agent {} stderr: {}", name, trimmed);
                    }
                }
                Err(e) => {
                    error!("Error reading agent {} stderr: {}", name, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_invalid_command() {
        let result = AgentProcess::start(&AgentConfig::new("nonexistent_command_12345"));

        match result {
            Err(Error::Acp(AcpError::Spawn(msg))) => {
                assert!(msg.contains("nonexistent_command_12345"))
            }
            Err(other) => panic!("Expected Spawn error, got {other:?}"),
            Ok(_) => panic!("Expected Spawn error"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let config = AgentConfig::new("sh").with_args(["-c", "exit 3"]);
        let (process, _stdio) = AgentProcess::start(&config).unwrap();

        let exit = process.wait().await;
        assert_eq!(exit.code(), Some(3));
        assert!(!process.is_running());
        assert_eq!(process.try_wait(), Some(exit));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_cooperative_child() {
        let config = AgentConfig::new("sleep").with_args(["30"]);
        let (process, _stdio) = AgentProcess::start(&config).unwrap();
        assert!(process.is_running());

        let exit = process.terminate(Duration::from_secs(5)).await;
        assert!(!exit.success());
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        // Ignores SIGTERM, so only the kill can end it.
        let config = AgentConfig::new("sh").with_args(["-c", "trap '' TERM; sleep 30"]);
        let (process, _stdio) = AgentProcess::start(&config).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let exit = process.terminate(Duration::from_millis(200)).await;
        assert!(!exit.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_after_exit_returns_status() {
        let config = AgentConfig::new("true");
        let (process, _stdio) = AgentProcess::start(&config).unwrap();
        process.wait().await;

        let exit = process.terminate(Duration::from_millis(10)).await;
        assert!(exit.success());
    }
}
