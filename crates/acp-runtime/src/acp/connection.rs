//! ACP connection
//!
//! Ties the pieces together for one agent: the supervised process, the framed
//! transport, the pending-request table, the inbound dispatcher and the
//! session state machine. A single reader task owns the agent's stdout for
//! the lifetime of the connection; everything else may be called from any
//! task.

use super::codec::{self, Envelope};
use super::correlation::{PendingRequestInfo, PendingRequests, PendingResponse};
use super::dispatcher::Dispatcher;
use super::events::{ConnectionEvent, EventBus};
use super::process::{spawn_stderr_drain, AgentProcess, ProcessExit};
use super::session::{SessionState, SessionStateMachine};
use super::transport::{FrameReader, Received, Transport};
use crate::config::{AgentConfig, RuntimeConfig};
use crate::error::{AcpError, Error, Result};
use crate::types::{
    methods, InitializeParams, InitializeResponse, SendUserMessageParams, UserMessageChunk,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Longest slice of a bad frame quoted in logs
const FRAME_PREVIEW_CHARS: usize = 200;

/// An agent notification waiting for its listeners
struct QueuedNotification {
    method: String,
    params: Option<Value>,
}

/// Observable outcome of a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: SessionState,
    /// Last known exit of the agent process, if it was spawned by us
    pub exit: Option<ProcessExit>,
    /// Why the connection closed; `None` while it is open
    pub close_reason: Option<String>,
}

/// State shared between the connection handle and its reader task
struct Shared {
    name: String,
    transport: Transport,
    pending: Arc<PendingRequests>,
    session: SessionStateMachine,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    close_reason: Mutex<Option<String>>,
}

impl Shared {
    /// Close exactly once: Terminated, refuse sends, fail pending requests.
    fn close(&self, reason: &str) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.to_string());
        }

        self.transport.mark_closed();
        if let Some(transition) = self.session.terminate() {
            self.events.transition(transition);
        }
        let failed = self.pending.fail_all(reason);
        info!(
            "Connection to {} closed: {} ({} pending requests failed)",
            self.name, reason, failed
        );
        true
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// A failed write closes the whole connection, not just the transport.
    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode(envelope)?;
        let result = self.transport.send(&frame).await;
        if let Err(Error::Acp(AcpError::ConnectionClosed(reason))) = &result {
            self.close(reason);
        }
        result
    }

    fn handle_frame(
        self: &Arc<Self>,
        bytes: &[u8],
        handlers: &mut JoinSet<()>,
        notifications: &mpsc::UnboundedSender<QueuedNotification>,
    ) {
        trace!("Received frame: {}", String::from_utf8_lossy(bytes));

        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(Error::Acp(AcpError::Decode(msg))) => match codec::json_start(bytes) {
                // Some agents print banners on stdout ahead of the first frame.
                Some(start) => {
                    debug!("Skipping {} bytes of non-JSON output before frame", start);
                    match codec::decode(&bytes[start..]) {
                        Ok(envelope) => envelope,
                        Err(e) => return self.report_bad_frame(bytes, e),
                    }
                }
                None => return self.report_bad_frame(bytes, Error::Acp(AcpError::Decode(msg))),
            },
            Err(e) => return self.report_bad_frame(bytes, e),
        };

        match envelope {
            Envelope::Response { id, outcome } => match id.as_u64() {
                Some(id) => {
                    self.pending.resolve(id, outcome.map_err(AcpError::from));
                }
                None => warn!("Received response with non-numeric id {}", id),
            },
            Envelope::Request { id, method, params } => {
                debug!("Agent request {} (id {})", method, id);
                let shared = Arc::clone(self);
                handlers.spawn(async move {
                    let response = shared.dispatcher.dispatch_request(id, &method, params).await;
                    if let Err(e) = shared.send_envelope(&response).await {
                        warn!("Failed to answer agent request {}: {}", method, e);
                    }
                });
            }
            Envelope::Notification { method, params } => {
                if let Err(rejected) = notifications.send(QueuedNotification { method, params }) {
                    warn!("Notification queue closed, dropping {}", rejected.0.method);
                }
            }
        }
    }

    fn report_bad_frame(&self, bytes: &[u8], err: Error) {
        let preview: String = String::from_utf8_lossy(bytes)
            .chars()
            .take(FRAME_PREVIEW_CHARS)
            .collect();
        match err {
            Error::Acp(AcpError::ProtocolViolation(msg)) => {
                warn!("Dropping invalid frame from {}: {} ({})", self.name, msg, preview);
                self.events.publish(ConnectionEvent::ProtocolViolation(msg));
            }
            other => warn!("Skipping non-JSON output from {}: {} ({})", self.name, other, preview),
        }
    }
}

/// Resolves when the agent process exits; never resolves without a process.
async fn process_exited(exit_rx: Option<&mut watch::Receiver<Option<ProcessExit>>>) {
    if let Some(rx) = exit_rx {
        let reaped = rx.wait_for(Option::is_some).await.is_ok();
        if reaped {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Runs listeners one notification at a time, in arrival order.
///
/// Off the read loop, so a listener may await a response from the agent.
async fn deliver_notifications(
    dispatcher: Arc<Dispatcher>,
    mut queue: mpsc::UnboundedReceiver<QueuedNotification>,
) {
    while let Some(notification) = queue.recv().await {
        dispatcher
            .dispatch_notification(&notification.method, notification.params)
            .await;
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader,
    mut shutdown_rx: watch::Receiver<bool>,
    mut exit_rx: Option<watch::Receiver<Option<ProcessExit>>>,
    grace: Duration,
) {
    let mut handlers = JoinSet::new();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let mut listeners = tokio::spawn(deliver_notifications(
        Arc::clone(&shared.dispatcher),
        notify_rx,
    ));
    let mut exited = false;
    let mut drain_deadline = tokio::time::Instant::now();

    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break "connection stopped".to_string(),

            reason = shared.transport.closed() => break reason,

            received = reader.receive() => match received {
                Received::Frame(bytes) => shared.handle_frame(&bytes, &mut handlers, &notify_tx),
                Received::Oversized(len) => {
                    let msg = format!("frame of {} bytes exceeds the frame limit", len);
                    warn!("Dropping frame from {}: {}", shared.name, msg);
                    shared.events.publish(ConnectionEvent::ProtocolViolation(msg));
                }
                Received::Eof => break "agent closed its output".to_string(),
                Received::Failed(e) => {
                    error!("Error reading from agent {}: {}", shared.name, e);
                    break format!("read failed: {}", e);
                }
            },

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    error!("Inbound handler task failed: {}", e);
                }
            }

            _ = process_exited(exit_rx.as_mut()), if !exited => {
                // Give buffered output a moment to arrive before closing.
                exited = true;
                drain_deadline = tokio::time::Instant::now() + grace;
            }

            _ = tokio::time::sleep_until(drain_deadline), if exited => {
                break "agent process exited".to_string();
            }
        }
    };

    shared.close(&reason);
    handlers.shutdown().await;

    // Queued notifications still reach their listeners before Disconnected
    drop(notify_tx);
    if tokio::time::timeout(grace, &mut listeners).await.is_err() {
        warn!("Notification listeners for {} did not finish", shared.name);
        listeners.abort();
    }

    let exit = match exit_rx.as_mut() {
        Some(rx) => {
            let _ = tokio::time::timeout(grace, rx.wait_for(Option::is_some)).await;
            rx.borrow().clone()
        }
        None => None,
    };

    debug!("Reader for {} finished", shared.name);
    shared.events.publish(ConnectionEvent::Disconnected {
        reason: shared.close_reason().unwrap_or(reason),
        exit,
    });
}

/// Returns the session to Ready when a prompt call ends, however it ends
struct PromptGuard<'a> {
    shared: &'a Shared,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if let Some(transition) = self.shared.session.finish_prompt() {
            self.shared.events.transition(transition);
        }
    }
}

fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        Error::Acp(AcpError::ProtocolViolation(format!(
            "invalid {} result: {}",
            method, e
        )))
    })
}

fn params_value<P: Serialize>(params: P) -> Result<Option<Value>> {
    Ok(match serde_json::to_value(params)? {
        Value::Null => None,
        value => Some(value),
    })
}

/// Configures and starts an [`AcpConnection`]
pub struct ConnectionBuilder {
    name: String,
    runtime: RuntimeConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    events: Option<EventBus>,
}

impl ConnectionBuilder {
    fn new() -> Self {
        Self {
            name: "agent".to_string(),
            runtime: RuntimeConfig::default(),
            dispatcher: None,
            events: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Handlers for agent-initiated calls. Register them before starting.
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Launch the agent process and connect to its stdio.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self, agent: &AgentConfig) -> Result<AcpConnection> {
        info!("Connecting to agent: {} ({})", agent.name, agent.command);
        let (process, stdio) = AgentProcess::start(agent)?;
        let stderr_task = spawn_stderr_drain(agent.name.clone(), stdio.stderr);

        Ok(self
            .name(agent.name.clone())
            .start(stdio.stdout, stdio.stdin, Some(process), Some(stderr_task)))
    }

    /// Connect over an existing byte stream pair instead of a child process.
    pub fn connect(
        self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> AcpConnection {
        self.start(reader, writer, None, None)
    }

    fn start(
        self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        process: Option<AgentProcess>,
        stderr_task: Option<JoinHandle<()>>,
    ) -> AcpConnection {
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(self.runtime.event_capacity));
        let dispatcher = self.dispatcher.unwrap_or_default();

        let shared = Arc::new(Shared {
            name: self.name,
            transport: Transport::new(writer),
            pending: Arc::new(PendingRequests::new()),
            session: SessionStateMachine::new(),
            dispatcher,
            events,
            close_reason: Mutex::new(None),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let exit_rx = process.as_ref().map(AgentProcess::subscribe_exit);
        let reader = FrameReader::new(reader, self.runtime.max_frame_bytes);
        let reader_task = tokio::spawn(read_loop(
            Arc::clone(&shared),
            reader,
            shutdown_rx,
            exit_rx,
            self.runtime.terminate_grace(),
        ));

        AcpConnection {
            shared,
            runtime: self.runtime,
            process,
            shutdown_tx,
            reader_task: Mutex::new(Some(reader_task)),
            stderr_task: Mutex::new(stderr_task),
        }
    }
}

/// Coordinator side of one ACP agent connection
pub struct AcpConnection {
    shared: Arc<Shared>,
    runtime: RuntimeConfig,
    process: Option<AgentProcess>,
    shutdown_tx: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl AcpConnection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Spawn `agent` with default runtime settings and no inbound handlers.
    pub fn spawn(agent: &AgentConfig) -> Result<Self> {
        Self::builder().spawn(agent)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(AgentProcess::id)
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> SessionState {
        self.shared.session.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.session.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequestInfo> {
        self.shared.pending.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.session.is_terminated()
            && self.process.as_ref().map_or(true, AgentProcess::is_running)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            exit: self.process.as_ref().and_then(AgentProcess::try_wait),
            close_reason: self.shared.close_reason(),
        }
    }

    // ------------------------------------------------------------------
    // Protocol methods
    // ------------------------------------------------------------------

    /// Negotiate the protocol. Ready on an authenticated answer, otherwise
    /// still Initializing until [`authenticate`](Self::authenticate) and a retry.
    pub async fn initialize(&self, protocol_version: &str) -> Result<InitializeResponse> {
        info!("Initializing ACP connection for {}", self.shared.name);
        let transition = self.shared.session.begin_initialize()?;
        self.shared.events.transition(transition);

        let params = params_value(InitializeParams {
            protocol_version: protocol_version.to_string(),
        })?;
        let result = match self.call(methods::INITIALIZE, params).await {
            Ok(value) => decode_result::<InitializeResponse>(methods::INITIALIZE, value),
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if let Some(transition) = self.shared.session.initialize_failed() {
                    self.shared.events.transition(transition);
                }
                return Err(e);
            }
        };

        if response.protocol_version != protocol_version {
            warn!(
                "Agent {} speaks protocol {} (requested {})",
                self.shared.name, response.protocol_version, protocol_version
            );
        }

        let transition = self
            .shared
            .session
            .finish_initialize(response.is_authenticated)?;
        self.shared.events.transition(transition);

        if response.is_authenticated {
            info!("ACP connection initialized for {}", self.shared.name);
        } else {
            info!("Agent {} requires authentication", self.shared.name);
        }
        Ok(response)
    }

    pub async fn authenticate(&self) -> Result<()> {
        self.shared.session.check_authenticate()?;
        self.call(methods::AUTHENTICATE, None).await?;
        debug!("Authenticated with {}", self.shared.name);
        Ok(())
    }

    /// Send a prompt and wait for the agent to finish answering it.
    ///
    /// Streamed output arrives meanwhile through the dispatcher. The session
    /// is Busy for the duration and back to Ready afterwards, even on error.
    pub async fn send_user_message(&self, chunks: Vec<UserMessageChunk>) -> Result<()> {
        let transition = self.shared.session.begin_prompt()?;
        self.shared.events.transition(transition);
        let _guard = PromptGuard {
            shared: &self.shared,
        };

        let params = params_value(SendUserMessageParams { chunks })?;
        self.call(methods::SEND_USER_MESSAGE, params).await?;
        Ok(())
    }

    /// Ask the agent to stop the running prompt.
    ///
    /// The request always reaches the wire. Agents may never answer it, so
    /// the wait for an acknowledgement is bounded by the cancel timeout and an
    /// unanswered or refused cancellation is not an error.
    pub async fn cancel_send_message(&self) -> Result<()> {
        let transition = self.shared.session.begin_cancel()?;
        self.shared.events.transition(transition);

        let pending = self.start_call(methods::CANCEL_SEND_MESSAGE, None).await?;
        match pending.wait(self.runtime.cancel_ack_timeout()).await {
            Ok(_) => Ok(()),
            Err(Error::Acp(AcpError::Timeout)) => {
                debug!("Agent {} did not acknowledge cancellation", self.shared.name);
                Ok(())
            }
            Err(Error::Acp(AcpError::Rpc { code, message, .. })) => {
                warn!(
                    "Agent {} refused cancellation ({}): {}",
                    self.shared.name, code, message
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Generic calls
    // ------------------------------------------------------------------

    /// Call an arbitrary agent method, independent of session state.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let value = self.call(method, params_value(params)?).await?;
        decode_result(method, value)
    }

    pub async fn request_raw(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call(method, params).await
    }

    /// Send a notification; nothing is awaited beyond the write.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        self.ensure_open()?;
        let envelope = Envelope::notification(method, params_value(params)?);
        self.shared.send_envelope(&envelope).await
    }

    fn ensure_open(&self) -> Result<()> {
        match self.shared.close_reason() {
            Some(reason) => Err(Error::Acp(AcpError::ConnectionClosed(reason))),
            None => Ok(()),
        }
    }

    /// Register, then write. The waiter exists before the agent can answer.
    async fn start_call(&self, method: &str, params: Option<Value>) -> Result<PendingResponse> {
        self.ensure_open()?;
        let id = self.shared.pending.allocate_id();
        let pending = self.shared.pending.register(id, method)?;

        debug!("Sending {} (id {}) to {}", method, id, self.shared.name);
        let envelope = Envelope::request(id, method, params);
        self.shared.send_envelope(&envelope).await?;
        Ok(pending)
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let pending = self.start_call(method, params).await?;
        pending.wait(self.runtime.request_timeout()).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear the connection down and wait for the reader to finish.
    ///
    /// Pending requests fail with `ConnectionClosed`, the agent's stdin is
    /// closed, and the process gets the configured grace period before it is
    /// killed.
    pub async fn stop(&self) -> ConnectionStatus {
        info!("Stopping connection to {}", self.shared.name);
        // Closing first also abandons a write stuck on a full pipe
        self.shared.close("connection stopped");
        let grace = self.runtime.terminate_grace();
        if tokio::time::timeout(grace, self.shared.transport.shutdown())
            .await
            .is_err()
        {
            warn!("Closing stdin of {} timed out", self.shared.name);
        }

        if let Some(process) = &self.process {
            let exit = process.terminate(self.runtime.terminate_grace()).await;
            debug!("Agent {} stopped: {}", self.shared.name, exit);
        }

        self.shutdown_tx.send_replace(true);
        let reader_task = self.reader_task.lock().take();
        if let Some(task) = reader_task {
            if let Err(e) = task.await {
                error!("Reader task for {} failed: {}", self.shared.name, e);
            }
        }

        let stderr_task = self.stderr_task.lock().take();
        if let Some(mut task) = stderr_task {
            if tokio::time::timeout(Duration::from_millis(500), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        self.status()
    }

    /// Wait until the connection has closed on its own or through [`stop`](Self::stop).
    pub async fn closed(&self) -> ConnectionStatus {
        let mut rx = self.subscribe_state();
        // The sender lives in `self`, so this only ends on Terminated.
        let _ = rx.wait_for(|state| *state == SessionState::Terminated).await;
        self.status()
    }
}

impl Drop for AcpConnection {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
