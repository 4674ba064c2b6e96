//! acp-run
//!
//! Launches an ACP agent from a TOML config, sends it one prompt, prints the
//! streamed answer and shuts the agent down again.

use acp_runtime::{
    register_client, AcpConnection, AssistantMessageChunk, ConnectionEvent, CoordinatorDelegate,
    Dispatcher, EventBus, FixedPrompter, LaunchConfig, ToolCallConfirmationOutcome,
    UserMessageChunk,
};
use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "acp-run", version, about = "Send one prompt to an ACP agent")]
struct Args {
    /// Agent launch configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Prompt text
    #[arg(short, long)]
    message: String,

    /// Files to attach to the prompt
    #[arg(long = "path")]
    paths: Vec<PathBuf>,

    /// How to answer tool call confirmations
    #[arg(long, value_enum, default_value_t = ConfirmPolicy::Deny)]
    confirm: ConfirmPolicy,

    /// Override the protocol version sent with `initialize`
    #[arg(long)]
    protocol_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfirmPolicy {
    Allow,
    AlwaysAllow,
    Deny,
}

impl From<ConfirmPolicy> for ToolCallConfirmationOutcome {
    fn from(policy: ConfirmPolicy) -> Self {
        match policy {
            ConfirmPolicy::Allow => ToolCallConfirmationOutcome::Allow,
            ConfirmPolicy::AlwaysAllow => ToolCallConfirmationOutcome::AlwaysAllow,
            ConfirmPolicy::Deny => ToolCallConfirmationOutcome::Deny,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the agent's answer
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let launch = LaunchConfig::load_from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let protocol_version = args
        .protocol_version
        .clone()
        .unwrap_or_else(|| launch.runtime.protocol_version.clone());

    let events = EventBus::new(launch.runtime.event_capacity);
    let printer = tokio::spawn(print_events(events.subscribe()));

    let delegate = CoordinatorDelegate::new(Arc::new(FixedPrompter(args.confirm.into())), events.clone())
        .with_confirmation_timeout(launch.runtime.confirmation_timeout());
    let delegate = Arc::new(delegate);
    let dispatcher = Dispatcher::new();
    register_client(&dispatcher, delegate.clone())?;

    let connection = AcpConnection::builder()
        .runtime(launch.runtime.clone())
        .dispatcher(Arc::new(dispatcher))
        .events(events)
        .spawn(&launch.agent)
        .with_context(|| format!("starting agent {}", launch.agent.name))?;

    let outcome = run_prompt(&connection, &protocol_version, prompt_chunks(&args)).await;

    let status = connection.stop().await;
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Event printer did not finish");
    }
    println!();

    match &status.exit {
        Some(exit) if !exit.success() => warn!("Agent exited: {}", exit),
        Some(exit) => debug!("Agent exited: {}", exit),
        None => {}
    }
    info!(
        "Done: {} tool call(s), {} bytes of answer",
        delegate.tool_calls().len(),
        delegate.transcript().text().len()
    );

    outcome
}

fn prompt_chunks(args: &Args) -> Vec<UserMessageChunk> {
    let mut chunks = vec![UserMessageChunk::text(args.message.clone())];
    chunks.extend(
        args.paths
            .iter()
            .map(|path| UserMessageChunk::Path { path: path.clone() }),
    );
    chunks
}

async fn run_prompt(
    connection: &AcpConnection,
    protocol_version: &str,
    chunks: Vec<UserMessageChunk>,
) -> anyhow::Result<()> {
    let response = connection.initialize(protocol_version).await?;
    if !response.is_authenticated {
        info!("Authenticating with {}", connection.name());
        connection.authenticate().await?;
        let response = connection.initialize(protocol_version).await?;
        if !response.is_authenticated {
            bail!("agent {} is still unauthenticated", connection.name());
        }
    }

    let prompt = connection.send_user_message(chunks);
    tokio::pin!(prompt);

    tokio::select! {
        result = &mut prompt => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling prompt");
            connection.cancel_send_message().await?;
            prompt.await?;
        }
    }
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<ConnectionEvent>) {
    let mut stdout = std::io::stdout();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Output lagged, {} event(s) skipped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ConnectionEvent::AssistantChunk(AssistantMessageChunk::Text { text }) => {
                print!("{}", text);
                if let Err(e) = stdout.flush() {
                    debug!("Failed to flush stdout: {}", e);
                }
            }
            ConnectionEvent::AssistantChunk(AssistantMessageChunk::Thought { thought }) => {
                debug!("Thinking: {}", thought);
            }
            ConnectionEvent::ToolCallPushed(call) => info!("Tool call {}: {}", call.id, call.label),
            ConnectionEvent::ToolCallUpdated(call) => {
                debug!("Tool call {} is {:?}", call.id, call.phase)
            }
            ConnectionEvent::ConfirmationRequested { id, label, .. } => {
                info!("Tool call {} needs confirmation: {}", id, label)
            }
            ConnectionEvent::ConfirmationAnswered { id, outcome } => {
                info!("Tool call {} answered: {}", id, outcome)
            }
            ConnectionEvent::ProtocolViolation(message) => warn!("Agent misbehaved: {}", message),
            ConnectionEvent::StateChanged { from, to } => debug!("Session {} -> {}", from, to),
            ConnectionEvent::Disconnected { reason, .. } => {
                debug!("Disconnected: {}", reason);
                break;
            }
        }
    }
}
