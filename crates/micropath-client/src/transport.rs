use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use micropath_core::errors::ClientError;

/// Close code for a deliberate client-initiated close. Closes with any other
/// code are treated as abnormal and are eligible for reconnection.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Synthetic code used when the transport drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const OUTBOUND_QUEUE: usize = 64;

/// Everything a live connection can report back to the session. The session
/// consumes these from a single channel, one at a time, so no state
/// transition ever races another.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Message(String),
    Error(String),
    Closed { code: u16 },
}

/// Frames the session pushes down a live connection.
#[derive(Debug, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Write half of an open connection. Dropping it tears the connection down.
pub struct Connection {
    outbound: mpsc::Sender<OutboundFrame>,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self { outbound }
    }

    /// Queue a text frame. Never blocks; a full or closed queue drops the
    /// frame with a warning (the close event will follow shortly anyway).
    pub fn send_text(&self, text: String) {
        if let Err(e) = self.outbound.try_send(OutboundFrame::Text(text)) {
            tracing::warn!(error = %e, "dropping outbound frame");
        }
    }

    /// Request a normal-closure close frame.
    pub fn close(&self) {
        let _ = self.outbound.try_send(OutboundFrame::Close);
    }
}

/// A way of opening realtime connections. Implemented by [`WsTransport`]
/// for production and by [`crate::mock::MockTransport`] in tests.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Open a connection to `url`. Inbound traffic is delivered through
    /// `events`; the returned [`Connection`] carries outbound frames.
    async fn open(
        &mut self,
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Connection, ClientError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &mut self,
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Connection, ClientError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE);

        // Writer: forward frames from the session to the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    OutboundFrame::Close => {
                        let _ = sink
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client disconnect".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        // Reader: translate socket traffic into transport events.
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => {
                        if events
                            .send(TransportEvent::Message(text.to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        let code = frame
                            .map(|f| u16::from(f.code))
                            .unwrap_or(ABNORMAL_CLOSURE);
                        let _ = events.send(TransportEvent::Closed { code }).await;
                        return;
                    }
                    // tungstenite answers pings itself; binary frames are
                    // not part of the protocol.
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        let _ = events
                            .send(TransportEvent::Closed { code: ABNORMAL_CLOSURE })
                            .await;
                        return;
                    }
                }
            }
            let _ = events
                .send(TransportEvent::Closed { code: ABNORMAL_CLOSURE })
                .await;
        });

        Ok(Connection::new(out_tx))
    }
}
