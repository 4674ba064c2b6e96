//! Newline-delimited framing over the agent's stdio
//!
//! Writing goes through a single async mutex so two frames can never
//! interleave. Reading is done by exactly one [`FrameReader`], owned by the
//! connection's read loop.

use crate::error::{AcpError, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, trace};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the transport
pub struct Transport {
    writer: Mutex<Option<BoxedWriter>>,
    /// Why the transport closed; `None` while open
    closed: watch::Sender<Option<String>>,
}

impl Transport {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        }
    }

    /// Write one frame followed by the delimiter and flush.
    ///
    /// Concurrent callers are serialized; a frame is always written whole.
    /// A write stuck on a peer that stopped reading is abandoned as soon as
    /// the transport is closed.
    pub async fn send(&self, frame: &str) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut guard = self.writer.lock().await;
        // Closed while queued behind another writer
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Some(writer) = guard.as_mut() else {
            return Err(self.closed_error());
        };

        trace!("Sending frame: {}", frame);
        let written = tokio::select! {
            biased;
            result = write_frame(writer, frame) => result,
            reason = self.closed() => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("closed mid-write: {}", reason),
            )),
        };

        if let Err(e) = written {
            error!("Failed to write frame to agent: {}", e);
            guard.take();
            self.close_with(format!("write failed: {}", e));
            return Err(self.closed_error());
        }

        Ok(())
    }

    /// Refuse further sends and abort an in-flight write.
    pub fn mark_closed(&self) {
        self.close_with("transport is closed".to_string());
    }

    /// Refuse further sends and drop the writer, closing the agent's stdin.
    pub async fn shutdown(&self) {
        self.mark_closed();
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down agent stdin: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Resolves with the close reason once the transport is closed.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| "transport is closed".to_string())
    }

    /// First reason wins
    fn close_with(&self, reason: String) -> bool {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "transport is closed".to_string());
        Error::Acp(AcpError::ConnectionClosed(reason))
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// One read from the agent's output
#[derive(Debug)]
pub enum Received {
    /// A complete line, without its delimiter
    Frame(Vec<u8>),
    /// A line longer than the frame limit was skipped; carries its length
    /// without the delimiter
    Oversized(usize),
    Eof,
    Failed(std::io::Error),
}

/// Read half of the transport
pub struct FrameReader {
    reader: BufReader<BoxedReader>,
    buf: Vec<u8>,
    /// Length so far of an oversized line being skipped
    discarding: Option<usize>,
    max_frame_bytes: usize,
}

impl FrameReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(Box::new(reader)),
            buf: Vec::new(),
            discarding: None,
            max_frame_bytes,
        }
    }

    /// Read until the next newline, accumulating across partial reads.
    ///
    /// A trailing line without a delimiter is returned as a frame before EOF.
    /// Cancel safe: a partial line survives until the next call.
    pub async fn receive(&mut self) -> Received {
        loop {
            let available = match self.reader.fill_buf().await {
                Ok(bytes) => bytes,
                Err(e) => return Received::Failed(e),
            };

            if available.is_empty() {
                if let Some(len) = self.discarding.take() {
                    return Received::Oversized(len);
                }
                if !self.buf.is_empty() {
                    return Received::Frame(std::mem::take(&mut self.buf));
                }
                return Received::Eof;
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let take = newline.map_or(available.len(), |pos| pos + 1);

            match self.discarding.as_mut() {
                Some(len) => *len += take,
                None => self.buf.extend_from_slice(&available[..take]),
            }
            self.reader.consume(take);

            if self.discarding.is_none() {
                // The delimiter does not count towards the limit
                let payload = self.buf.len() - usize::from(newline.is_some());
                if payload > self.max_frame_bytes {
                    self.discarding = Some(self.buf.len());
                    self.buf.clear();
                }
            }

            if newline.is_some() {
                if let Some(len) = self.discarding.take() {
                    return Received::Oversized(len - 1);
                }
                let mut frame = std::mem::take(&mut self.buf);
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                return Received::Frame(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn frame(received: Received) -> String {
        match received {
            Received::Frame(bytes) => String::from_utf8(bytes).unwrap(),
            other => panic!("Expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reassembles_partial_reads() {
        let (mut agent, coordinator) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(coordinator, 1024);

        let writer = tokio::spawn(async move {
            let parts: [&[u8]; 4] = [b"{\"id\":", b"1,\"res", b"ult\":null}\n{\"a\"", b":2}\n"];
            for part in parts {
                agent.write_all(part).await.unwrap();
                agent.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        assert_eq!(frame(reader.receive().await), r#"{"id":1,"result":null}"#);
        assert_eq!(frame(reader.receive().await), r#"{"a":2}"#);
        writer.await.unwrap();
        assert!(matches!(reader.receive().await, Received::Eof));
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let (mut agent, coordinator) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(coordinator, 1024);
        agent.write_all(b"{\"x\":1}\r\n{\"y\":2}").await.unwrap();
        drop(agent);

        assert_eq!(frame(reader.receive().await), r#"{"x":1}"#);
        assert_eq!(frame(reader.receive().await), r#"{"y":2}"#);
        assert!(matches!(reader.receive().await, Received::Eof));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (mut agent, coordinator) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(coordinator, 16);
        agent.write_all(&[b'x'; 100]).await.unwrap();
        agent.write_all(b"\n{\"ok\":1}\n").await.unwrap();
        drop(agent);

        match reader.receive().await {
            Received::Oversized(len) => assert_eq!(len, 100),
            other => panic!("Expected oversized, got {other:?}"),
        }
        assert_eq!(frame(reader.receive().await), r#"{"ok":1}"#);
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let (mut agent, coordinator) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(coordinator, 16);
        agent.write_all(&[b'y'; 16]).await.unwrap();
        agent.write_all(b"\n").await.unwrap();
        agent.write_all(&[b'z'; 17]).await.unwrap();
        agent.write_all(b"\n").await.unwrap();
        drop(agent);

        assert_eq!(frame(reader.receive().await), "y".repeat(16));
        match reader.receive().await {
            Received::Oversized(len) => assert_eq!(len, 17),
            other => panic!("Expected oversized, got {other:?}"),
        }
        assert!(matches!(reader.receive().await, Received::Eof));
    }

    #[tokio::test]
    async fn test_read_error_after_frame() {
        let agent = tokio_test::io::Builder::new()
            .read(b"{\"id\":1,")
            .read(b"\"result\":true}\n")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut reader = FrameReader::new(agent, 1024);

        assert_eq!(frame(reader.receive().await), r#"{"id":1,"result":true}"#);
        match reader.receive().await {
            Received::Failed(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("Expected read failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_writes_frame_and_delimiter() {
        let agent = tokio_test::io::Builder::new()
            .write(b"{\"jsonrpc\":\"2.0\"}\n")
            .build();
        let transport = Transport::new(agent);

        transport.send(r#"{"jsonrpc":"2.0"}"#).await.unwrap();
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (agent, coordinator) = tokio::io::duplex(256);
        let transport = Arc::new(Transport::new(coordinator));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let transport = Arc::clone(&transport);
            tasks.push(tokio::spawn(async move {
                let payload = format!("{{\"n\":{},\"pad\":\"{}\"}}", i, "z".repeat(200));
                transport.send(&payload).await.unwrap();
            }));
        }

        let reader = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(agent).lines();
            let mut seen = Vec::new();
            while seen.len() < 20 {
                let line = lines.next_line().await.unwrap().unwrap();
                let value: serde_json::Value = serde_json::from_str(&line).unwrap();
                seen.push(value["n"].as_u64().unwrap());
            }
            seen
        });

        for task in tasks {
            task.await.unwrap();
        }
        let mut seen = reader.await.unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (_agent, coordinator) = tokio::io::duplex(64);
        let transport = Transport::new(coordinator);
        transport.shutdown().await;

        let err = transport.send("{}").await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_closes_transport() {
        let (agent, coordinator) = tokio::io::duplex(64);
        drop(agent);
        let transport = Transport::new(coordinator);

        assert!(transport.send("{}").await.is_err());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_blocked_send() {
        // Nobody reads the agent side, so a large frame fills the pipe
        let (_agent, coordinator) = tokio::io::duplex(64);
        let transport = Arc::new(Transport::new(coordinator));

        let blocked = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send(&"x".repeat(10_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(3), transport.shutdown())
            .await
            .expect("shutdown waited on the blocked writer");
        let result = tokio::time::timeout(Duration::from_secs(3), blocked)
            .await
            .expect("blocked send never returned")
            .unwrap();
        assert!(result.unwrap_err().is_connection_closed());
    }

    #[tokio::test]
    async fn test_queued_send_sees_close() {
        let (_agent, coordinator) = tokio::io::duplex(64);
        let transport = Arc::new(Transport::new(coordinator));

        let first = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send(&"x".repeat(10_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Queued behind the blocked writer when the transport closes
        let second = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send("{}").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.mark_closed();
        assert!(first.await.unwrap().is_err());
        let err = second.await.unwrap().unwrap_err();
        assert!(err.is_connection_closed());
        assert_eq!(transport.close_reason().as_deref(), Some("transport is closed"));
    }

    #[tokio::test]
    async fn test_closed_reports_write_failure() {
        let (agent, coordinator) = tokio::io::duplex(64);
        drop(agent);
        let transport = Transport::new(coordinator);

        let err = transport.send("{}").await.unwrap_err();
        assert!(err.is_connection_closed());
        let reason = transport.closed().await;
        assert!(reason.starts_with("write failed"), "{reason}");
    }
}
