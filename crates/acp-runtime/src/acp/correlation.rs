//! Correlation of coordinator requests with agent responses
//!
//! Every outgoing request is registered here before its frame is written, so a
//! fast response can never arrive ahead of its waiter. Each entry resolves at
//! most once: by a matching response, by [`PendingRequests::fail_all`] when
//! the connection goes away, or by being abandoned when its waiter is dropped.

use crate::error::{AcpError, Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type Outcome = std::result::Result<Value, AcpError>;

struct PendingEntry {
    method: String,
    created_at: DateTime<Utc>,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingEntry>,
    /// Set once the connection has closed; no further registrations succeed
    closed: Option<String>,
}

/// Snapshot of an outstanding request, for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequestInfo {
    pub id: u64,
    pub method: String,
    pub created_at: DateTime<Utc>,
}

/// Table of outstanding coordinator requests for one connection
pub struct PendingRequests {
    next_id: AtomicU64,
    table: Mutex<PendingTable>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(PendingTable::default()),
        }
    }

    /// Next request id; strictly increasing for the life of this table.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a waiter for `id`. Must happen before the request is sent.
    pub fn register(self: &Arc<Self>, id: u64, method: &str) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table.lock();
            if let Some(reason) = &table.closed {
                return Err(Error::Acp(AcpError::ConnectionClosed(reason.clone())));
            }
            if table.entries.contains_key(&id) {
                return Err(Error::Acp(AcpError::ProtocolViolation(format!(
                    "request id {} is already pending",
                    id
                ))));
            }
            table.entries.insert(
                id,
                PendingEntry {
                    method: method.to_string(),
                    created_at: Utc::now(),
                    tx,
                },
            );
        }

        trace!("Registered pending request {} ({})", id, method);
        Ok(PendingResponse {
            id,
            method: method.to_string(),
            rx,
            table: Arc::clone(self),
            settled: false,
        })
    }

    /// Complete the entry for `id`. Unknown ids are ignored with a warning.
    pub fn resolve(&self, id: u64, outcome: std::result::Result<Value, AcpError>) -> bool {
        let entry = self.table.lock().entries.remove(&id);
        match entry {
            Some(entry) => {
                let elapsed = Utc::now() - entry.created_at;
                debug!(
                    "Resolving request {} ({}) after {}ms",
                    id,
                    entry.method,
                    elapsed.num_milliseconds()
                );
                if entry.tx.send(outcome).is_err() {
                    debug!("Waiter for request {} went away before resolution", id);
                }
                true
            }
            None => {
                warn!("Received response for unknown request: {}", id);
                false
            }
        }
    }

    /// Drop the entry for `id` without resolving it; a late response is discarded.
    pub fn abandon(&self, id: u64) -> bool {
        let removed = self.table.lock().entries.remove(&id).is_some();
        if removed {
            debug!("Abandoned pending request {}", id);
        }
        removed
    }

    /// Fail every pending request with `ConnectionClosed` and refuse new ones.
    ///
    /// Returns how many requests were failed. Later calls fail nothing.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingEntry)> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            debug!("Failing request {} ({}): {}", id, entry.method, reason);
            let _ = entry
                .tx
                .send(Err(AcpError::ConnectionClosed(reason.to_string())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.table.lock().entries.contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<PendingRequestInfo> {
        let table = self.table.lock();
        let mut infos: Vec<_> = table
            .entries
            .iter()
            .map(|(id, entry)| PendingRequestInfo {
                id: *id,
                method: entry.method.clone(),
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable result of one coordinator request.
///
/// Dropping it before it completes abandons the table entry.
pub struct PendingResponse {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<PendingRequests>,
    settled: bool,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait at most `timeout`; on expiry the entry is abandoned.
    pub async fn with_timeout(self, timeout: Duration) -> Result<Value> {
        let id = self.id;
        let method = self.method.clone();
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Request {} ({}) timed out after {:?}", id, method, timeout);
                Err(Error::Acp(AcpError::Timeout))
            }
        }
    }

    /// Wait with an optional bound
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Value> {
        match timeout {
            Some(timeout) => self.with_timeout(timeout).await,
            None => self.await,
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(received) => {
                this.settled = true;
                Poll::Ready(match received {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(Error::Acp(e)),
                    Err(_) => Err(Error::Acp(AcpError::ConnectionClosed(
                        "response slot dropped".to_string(),
                    ))),
                })
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            self.table.abandon(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_ids_strictly_increase() {
        let pending = PendingRequests::new();
        assert_eq!(pending.allocate_id(), 1);
        assert_eq!(pending.allocate_id(), 2);
        assert_eq!(pending.allocate_id(), 3);
    }

    #[test]
    fn test_fresh_table_starts_its_own_sequence() {
        let first = PendingRequests::new();
        first.allocate_id();
        first.allocate_id();
        assert_eq!(PendingRequests::new().allocate_id(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_resolution_matches_by_id() {
        let pending = Arc::new(PendingRequests::new());
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let id = pending.allocate_id();
                pending.register(id, "echo").unwrap()
            })
            .collect();

        for id in [4u64, 2, 5, 1, 3] {
            assert!(pending.resolve(id, Ok(json!({ "echo": id }))));
        }

        for waiter in waiters {
            let id = waiter.id();
            assert_eq!(waiter.await.unwrap(), json!({ "echo": id }));
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_outcome_is_delivered() {
        let pending = Arc::new(PendingRequests::new());
        let waiter = pending.register(1, "authenticate").unwrap();
        pending.resolve(
            1,
            Err(AcpError::Rpc {
                code: -32000,
                message: "denied".into(),
                data: None,
            }),
        );

        match waiter.await {
            Err(Error::Acp(AcpError::Rpc { code, .. })) => assert_eq!(code, -32000),
            other => panic!("Expected Rpc error, got {other:?}"),
        }
    }

    #[test]
    fn test_resolving_unknown_or_twice_is_noop() {
        let pending = Arc::new(PendingRequests::new());
        assert!(!pending.resolve(99, Ok(Value::Null)));

        let _waiter = pending.register(1, "m").unwrap();
        assert!(pending.resolve(1, Ok(Value::Null)));
        assert!(!pending.resolve(1, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_each_once() {
        let pending = Arc::new(PendingRequests::new());
        let waiters: Vec<_> = (1..=3)
            .map(|id| pending.register(id, "sendUserMessage").unwrap())
            .collect();

        assert_eq!(pending.fail_all("agent exited"), 3);
        assert_eq!(pending.fail_all("agent exited"), 0);

        for waiter in waiters {
            match waiter.await {
                Err(Error::Acp(AcpError::ConnectionClosed(reason))) => {
                    assert_eq!(reason, "agent exited")
                }
                other => panic!("Expected ConnectionClosed, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_register_after_close_fails() {
        let pending = Arc::new(PendingRequests::new());
        pending.fail_all("stopped");
        let err = pending.register(1, "initialize").err().unwrap();
        assert!(err.is_connection_closed());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let pending = Arc::new(PendingRequests::new());
        let _first = pending.register(1, "a").unwrap();
        assert!(pending.register(1, "b").is_err());
    }

    #[test]
    fn test_dropping_waiter_abandons_entry() {
        let pending = Arc::new(PendingRequests::new());
        let waiter = pending.register(1, "cancelSendMessage").unwrap();
        assert!(pending.contains(1));
        drop(waiter);
        assert!(!pending.contains(1));
        // Late response for the abandoned id is ignored.
        assert!(!pending.resolve(1, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_timeout_abandons_entry() {
        let pending = Arc::new(PendingRequests::new());
        let waiter = pending.register(1, "sendUserMessage").unwrap();

        let err = waiter
            .with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Acp(AcpError::Timeout)));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let pending = Arc::new(PendingRequests::new());
        let _b = pending.register(2, "b").unwrap();
        let _a = pending.register(1, "a").unwrap();
        let ids: Vec<_> = pending.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
