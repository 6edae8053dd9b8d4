//! Duplex envelope connection.
//!
//! A [`Connection`] is a sink of outbound [`Message`]s plus a stream of
//! decoded inbound envelopes. The session only ever sees this pair, so the
//! same pumps run over a real WebSocket or an in-memory channel.

use std::pin::Pin;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use protocol::{decode, encode, Inbound, Message, ProtocolError};
use thiserror::Error;

/// Errors raised by the duplex connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer is gone.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] ProtocolError),
}

/// Outbound half of a connection.
pub type EnvelopeSink = Pin<Box<dyn Sink<Message, Error = ConnectionError> + Send>>;

/// Inbound half of a connection.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Inbound, ConnectionError>> + Send>>;

/// A duplex envelope connection.
pub struct Connection {
    sink: EnvelopeSink,
    stream: EnvelopeStream,
}

impl Connection {
    /// Builds a connection from any sink/stream pair.
    pub fn new<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<Message, Error = ConnectionError> + Send + 'static,
        T: Stream<Item = Result<Inbound, ConnectionError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Adapts an upgraded WebSocket.
    ///
    /// Every envelope goes out as one text frame. Text and binary frames are
    /// decoded on the way in, transport-level ping/pong frames are skipped,
    /// and a close frame ends the stream.
    pub fn from_websocket(socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();

        let sink = tx
            .sink_map_err(|e| ConnectionError::Transport(e.to_string()))
            .with(|msg: Message| {
                future::ready(
                    encode(&msg)
                        .map(|text| WsMessage::Text(text.into()))
                        .map_err(ConnectionError::from),
                )
            });

        let stream = rx
            .take_while(|frame| future::ready(!matches!(frame, Ok(WsMessage::Close(_)))))
            .filter_map(|frame| future::ready(decode_frame(frame)));

        Self::new(sink, stream)
    }

    /// Sends one envelope.
    pub async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        self.sink.send(message).await
    }

    /// Splits the connection into its sink and stream halves.
    pub fn into_parts(self) -> (EnvelopeSink, EnvelopeStream) {
        (self.sink, self.stream)
    }
}

fn decode_frame(
    frame: Result<WsMessage, axum::Error>,
) -> Option<Result<Inbound, ConnectionError>> {
    match frame {
        Ok(WsMessage::Text(text)) => Some(decode(text.as_str()).map_err(ConnectionError::from)),
        Ok(WsMessage::Binary(bytes)) => Some(match std::str::from_utf8(&bytes) {
            Ok(text) => decode(text).map_err(ConnectionError::from),
            Err(e) => Err(ConnectionError::Transport(format!(
                "binary frame is not UTF-8: {e}"
            ))),
        }),
        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Close(_)) => None,
        Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
    }
}

/// In-memory connection used by unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use futures::{SinkExt, StreamExt};
    use protocol::{decode, encode, Message};

    use super::{Connection, ConnectionError};

    /// The client end of an in-memory connection.
    pub(crate) struct TestPeer {
        tx: Option<UnboundedSender<String>>,
        rx: UnboundedReceiver<Message>,
    }

    /// Creates a connection and the peer that drives it.
    pub(crate) fn test_pair() -> (Connection, TestPeer) {
        let (client_tx, client_rx) = unbounded::<String>();
        let (server_tx, server_rx) = unbounded::<Message>();

        let sink = server_tx.sink_map_err(|_| ConnectionError::Closed("peer hung up".to_string()));
        let stream = client_rx.map(|text| decode(&text).map_err(ConnectionError::from));

        (
            Connection::new(sink, stream),
            TestPeer {
                tx: Some(client_tx),
                rx: server_rx,
            },
        )
    }

    impl TestPeer {
        pub(crate) fn send(&self, message: &Message) {
            self.send_raw(&encode(message).unwrap());
        }

        pub(crate) fn send_raw(&self, text: &str) {
            if let Some(tx) = &self.tx {
                let _ = tx.unbounded_send(text.to_string());
            }
        }

        /// Ends the inbound stream, as a disconnecting client would.
        pub(crate) fn hang_up(&mut self) {
            self.tx = None;
        }

        /// Next outbound envelope; `None` on timeout or once the server side closed.
        pub(crate) async fn recv(&mut self, timeout: Duration) -> Option<Message> {
            tokio::time::timeout(timeout, self.rx.next())
                .await
                .ok()
                .flatten()
        }

        /// Skips envelopes until one matches.
        pub(crate) async fn wait_for<F>(&mut self, timeout: Duration, mut pred: F) -> Option<Message>
        where
            F: FnMut(&Message) -> bool,
        {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                let msg = self.recv(left).await?;
                if pred(&msg) {
                    return Some(msg);
                }
            }
        }

        /// Accumulates `output` payloads until `needle` appears.
        pub(crate) async fn wait_for_output(&mut self, timeout: Duration, needle: &str) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut seen = String::new();
            while !seen.contains(needle) {
                let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                match self.recv(left).await {
                    Some(Message::Output(text)) => seen.push_str(&text),
                    Some(_) => {}
                    None => return false,
                }
            }
            true
        }

        /// Waits until the server has closed its sink.
        pub(crate) async fn wait_closed(&mut self, timeout: Duration) -> bool {
            tokio::time::timeout(timeout, async {
                while self.rx.next().await.is_some() {}
            })
            .await
            .is_ok()
        }
    }
}
