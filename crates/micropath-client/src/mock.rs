//! Channel-backed transport for exercising the session without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use micropath_core::errors::ClientError;

use crate::transport::{Connection, OutboundFrame, Transport, TransportEvent};

/// Transport whose connections are plain channels. Each successful `open`
/// hands the test side a [`MockConnection`] through the paired
/// [`MockRemote`].
pub struct MockTransport {
    opens: mpsc::UnboundedSender<MockConnection>,
    fail_opens: Arc<AtomicUsize>,
}

/// Test-side handle: observe opens, drive the server side of each one.
pub struct MockRemote {
    opens: mpsc::UnboundedReceiver<MockConnection>,
    fail_opens: Arc<AtomicUsize>,
}

/// Server side of one mock connection.
pub struct MockConnection {
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Receiver<OutboundFrame>,
}

impl MockTransport {
    pub fn new() -> (Self, MockRemote) {
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        let fail_opens = Arc::new(AtomicUsize::new(0));
        (
            Self {
                opens: opens_tx,
                fail_opens: Arc::clone(&fail_opens),
            },
            MockRemote {
                opens: opens_rx,
                fail_opens,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &mut self,
        _url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Connection, ClientError> {
        let failures = self.fail_opens.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_opens.store(failures - 1, Ordering::SeqCst);
            return Err(ClientError::ConnectFailed("mock open refused".into()));
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let conn = MockConnection {
            events,
            outbound: out_rx,
        };
        self.opens
            .send(conn)
            .map_err(|_| ClientError::ConnectFailed("mock remote dropped".into()))?;
        Ok(Connection::new(out_tx))
    }
}

impl MockRemote {
    /// Make the next `n` opens fail at the transport level.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Wait for the session to open a connection.
    pub async fn next_open(&mut self) -> MockConnection {
        self.opens.recv().await.expect("session dropped transport")
    }

    /// Check for an open without waiting.
    pub fn try_next_open(&mut self) -> Option<MockConnection> {
        self.opens.try_recv().ok()
    }
}

impl MockConnection {
    /// Deliver a raw text frame to the session.
    pub async fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Message(text.into()))
            .await;
    }

    /// Deliver a JSON value as a text frame.
    pub async fn send_json(&self, value: serde_json::Value) {
        self.send_text(value.to_string()).await;
    }

    /// Send the server greeting that completes the connect handshake.
    pub async fn greet(&self, connection_id: &str) {
        self.send_json(serde_json::json!({
            "type": "connected",
            "connection_id": connection_id,
        }))
        .await;
    }

    /// Report a transport-level error (does not close the connection).
    pub async fn error(&self, message: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Error(message.into()))
            .await;
    }

    /// Close the connection with the given close code.
    pub async fn close(&self, code: u16) {
        let _ = self.events.send(TransportEvent::Closed { code }).await;
    }

    /// Wait for the next frame the session sent.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Check for an outbound frame without waiting.
    pub fn try_next_frame(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }

    /// Wait for the next outbound text frame, skipping nothing.
    pub async fn next_text(&mut self) -> Option<String> {
        match self.outbound.recv().await? {
            OutboundFrame::Text(text) => Some(text),
            OutboundFrame::Close => None,
        }
    }
}
