//! Typed coordinator-side handlers for agent-initiated calls

use super::dispatcher::{listener_fn, request_fn, Dispatcher, RequestHandler};
use crate::error::{AcpError, Error, Result};
use crate::types::{
    methods, PushToolCallParams, PushToolCallResponse, RequestToolCallConfirmationParams,
    RequestToolCallConfirmationResponse, StreamAssistantMessageChunkParams, UpdateToolCallParams,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Callback interface for everything the agent can ask of the coordinator.
///
/// Install an implementation with [`register_client`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// A piece of the assistant's answer to the current prompt
    async fn stream_assistant_message_chunk(
        &self,
        params: StreamAssistantMessageChunkParams,
    ) -> Result<()>;

    /// Ask permission before a side-effecting tool call. May wait on a human.
    async fn request_tool_call_confirmation(
        &self,
        params: RequestToolCallConfirmationParams,
    ) -> Result<RequestToolCallConfirmationResponse>;

    /// Announce a tool call that needs no confirmation
    async fn push_tool_call(&self, params: PushToolCallParams) -> Result<PushToolCallResponse>;

    async fn update_tool_call(&self, params: UpdateToolCallParams) -> Result<()>;
}

fn decode_params<P: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<P> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| Error::Acp(AcpError::InvalidParams(format!("{}: {}", method, e))))
}

/// Adapt a typed client method into a JSON request handler
fn typed<P, R, F, Fut>(
    method: &'static str,
    client: &Arc<dyn CoordinatorClient>,
    call: F,
) -> Arc<dyn RequestHandler>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Arc<dyn CoordinatorClient>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let client = Arc::clone(client);
    let call = Arc::new(call);
    request_fn(move |params| invoke(method, Arc::clone(&client), Arc::clone(&call), params))
}

async fn invoke<P, R, F, Fut>(
    method: &'static str,
    client: Arc<dyn CoordinatorClient>,
    call: Arc<F>,
    params: Option<Value>,
) -> Result<Value>
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(Arc<dyn CoordinatorClient>, P) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let params = decode_params::<P>(method, params)?;
    let result = call(client, params).await?;
    Ok(serde_json::to_value(result)?)
}

/// Route the inbound ACP methods to `client`.
///
/// `streamAssistantMessageChunk` is normally a notification, but agents that
/// send it as a request get a `null` result.
pub fn register_client(dispatcher: &Dispatcher, client: Arc<dyn CoordinatorClient>) -> Result<()> {
    {
        let client = Arc::clone(&client);
        dispatcher.listen(
            methods::STREAM_ASSISTANT_MESSAGE_CHUNK,
            listener_fn(move |params| {
                let client = Arc::clone(&client);
                async move {
                    let params: StreamAssistantMessageChunkParams =
                        decode_params(methods::STREAM_ASSISTANT_MESSAGE_CHUNK, params)?;
                    client.stream_assistant_message_chunk(params).await
                }
            }),
        );
    }

    dispatcher.register(
        methods::STREAM_ASSISTANT_MESSAGE_CHUNK,
        typed(
            methods::STREAM_ASSISTANT_MESSAGE_CHUNK,
            &client,
            |client, params: StreamAssistantMessageChunkParams| async move {
                client.stream_assistant_message_chunk(params).await
            },
        ),
    )?;
    dispatcher.register(
        methods::REQUEST_TOOL_CALL_CONFIRMATION,
        typed(
            methods::REQUEST_TOOL_CALL_CONFIRMATION,
            &client,
            |client, params: RequestToolCallConfirmationParams| async move {
                client.request_tool_call_confirmation(params).await
            },
        ),
    )?;
    dispatcher.register(
        methods::PUSH_TOOL_CALL,
        typed(methods::PUSH_TOOL_CALL, &client, |client, params: PushToolCallParams| async move {
            client.push_tool_call(params).await
        }),
    )?;
    dispatcher.register(
        methods::UPDATE_TOOL_CALL,
        typed(methods::UPDATE_TOOL_CALL, &client, |client, params: UpdateToolCallParams| async move {
            client.update_tool_call(params).await
        }),
    )?;
    Ok(())
}
