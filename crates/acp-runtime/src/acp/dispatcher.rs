//! Routing of agent-initiated calls to coordinator handlers
//!
//! Handlers are registered per method before the connection starts reading.
//! Every inbound request produces exactly one response envelope: the
//! handler's result, a `MethodNotFound` error, or the handler's failure
//! translated into a JSON-RPC error object. Notifications fan out to
//! listeners and never produce a reply.

use super::codec::Envelope;
use crate::error::{AcpError, Error, Result};
use crate::types::RequestId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers one inbound request method
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<Value>;
}

/// Observes one inbound notification method
#[async_trait]
pub trait NotificationListener: Send + Sync {
    async fn notify(&self, params: Option<Value>) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<Value> {
        (self.0)(params).await
    }
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> NotificationListener for FnListener<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn notify(&self, params: Option<Value>) -> Result<()> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a [`RequestHandler`]
pub fn request_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap an async closure as a [`NotificationListener`]
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn NotificationListener>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnListener(f))
}

/// Method table for agent-initiated calls
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn NotificationListener>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for `method`.
    ///
    /// A second handler for the same method is rejected here, at setup time,
    /// rather than surfacing at dispatch.
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let method = method.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&method) {
            return Err(Error::Acp(AcpError::DuplicateHandler(method)));
        }
        debug!("Registered handler for {}", method);
        handlers.insert(method, handler);
        Ok(())
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.handlers.write().remove(method).is_some()
    }

    /// Add a listener for notifications named `method`. Any number may be added.
    pub fn listen(&self, method: impl Into<String>, listener: Arc<dyn NotificationListener>) {
        self.listeners
            .write()
            .entry(method.into())
            .or_default()
            .push(listener);
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.read().contains_key(method)
    }

    pub fn has_listeners(&self, method: &str) -> bool {
        self.listeners
            .read()
            .get(method)
            .is_some_and(|listeners| !listeners.is_empty())
    }

    /// Run the handler for an inbound request and build the response envelope.
    pub async fn dispatch_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Envelope {
        let handler = self.handlers.read().get(method).cloned();

        let result = match handler {
            Some(handler) => handler.handle(params).await,
            None => {
                warn!("No handler for agent request {} (id {})", method, id);
                Err(Error::Acp(AcpError::MethodNotFound(method.to_string())))
            }
        };

        match result {
            Ok(value) => Envelope::success(id, value),
            Err(e) => {
                if !matches!(e, Error::Acp(AcpError::MethodNotFound(_))) {
                    warn!("Handler for {} (id {}) failed: {}", method, id, e);
                }
                Envelope::failure(id, e.to_rpc_error())
            }
        }
    }

    /// Deliver a notification to every listener. Failures are only logged.
    ///
    /// Returns false when nobody listens for `method`.
    pub async fn dispatch_notification(&self, method: &str, params: Option<Value>) -> bool {
        let listeners = self.listeners.read().get(method).cloned().unwrap_or_default();
        if listeners.is_empty() {
            debug!("Unhandled notification: {}", method);
            return false;
        }

        let calls = listeners.iter().map(|listener| listener.notify(params.clone()));
        for result in futures::future::join_all(calls).await {
            if let Err(e) = result {
                warn!("Listener for {} failed: {}", method, e);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonRpcError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn error_of(envelope: Envelope) -> (RequestId, JsonRpcError) {
        match envelope {
            Envelope::Response { id, outcome: Err(e) } => (id, e),
            other => panic!("Expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registered_handler_answers() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(
                "pushToolCall",
                request_fn(|_params| async { Ok(json!({"id": 1})) }),
            )
            .unwrap();

        let response = dispatcher
            .dispatch_request(RequestId::Number(4), "pushToolCall", None)
            .await;
        assert_eq!(response, Envelope::success(RequestId::Number(4), json!({"id": 1})));
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_request_id() {
        let dispatcher = Dispatcher::new();
        let response = dispatcher
            .dispatch_request(RequestId::Str("req-9".into()), "fs/readTextFile", None)
            .await;

        let (id, error) = error_of(response);
        assert_eq!(id, RequestId::Str("req-9".into()));
        assert_eq!(error.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handler_failures_become_error_responses() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(
                "boom",
                request_fn(|_| async { Err(Error::Acp(AcpError::Handler("exploded".into()))) }),
            )
            .unwrap();
        dispatcher
            .register(
                "picky",
                request_fn(|_| async { Err(Error::Acp(AcpError::InvalidParams("label".into()))) }),
            )
            .unwrap();

        let (_, error) = error_of(dispatcher.dispatch_request(RequestId::Number(1), "boom", None).await);
        assert_eq!(error.code, INTERNAL_ERROR);
        assert!(error.message.contains("exploded"));

        let (_, error) = error_of(dispatcher.dispatch_request(RequestId::Number(2), "picky", None).await);
        assert_eq!(error.code, INVALID_PARAMS);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register("m", request_fn(|_| async { Ok(Value::Null) }))
            .unwrap();

        let err = dispatcher
            .register("m", request_fn(|_| async { Ok(Value::Null) }))
            .unwrap_err();
        assert!(matches!(err, Error::Acp(AcpError::DuplicateHandler(m)) if m == "m"));

        assert!(dispatcher.unregister("m"));
        assert!(!dispatcher.has_handler("m"));
    }

    #[tokio::test]
    async fn test_notifications_reach_every_listener() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            dispatcher.listen(
                "streamAssistantMessageChunk",
                listener_fn(move |_| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }
        // A failing listener does not stop the others.
        dispatcher.listen(
            "streamAssistantMessageChunk",
            listener_fn(|_| async { Err(Error::Acp(AcpError::Handler("nope".into()))) }),
        );

        assert!(
            dispatcher
                .dispatch_notification("streamAssistantMessageChunk", Some(json!({})))
                .await
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!dispatcher.dispatch_notification("other", None).await);
    }
}
