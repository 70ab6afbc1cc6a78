//! Message transport over WebSocket.
//!
//! The session runtime talks to the client through the reader/writer trait
//! pair, so tests can substitute channel-backed halves. The WebSocket
//! implementation accepts both wire renderings on inbound (JSON text frames
//! and binary codec frames) and emits the configured one.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use tether_core::error::{Error, Result};
use tether_core::protocol::{Decoded, FrameCodec, Message};

/// Outbound wire rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed binary frames.
    Binary,
}

/// One unit read from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded message.
    Message(Message),
    /// An unpacked batch, in wire order.
    Batch(Vec<Message>),
    /// Transport-level keepalive traffic; refreshes the read deadline and
    /// nothing else.
    Pong,
}

/// Reading half of a transport.
#[async_trait]
pub trait TransportReader: Send {
    /// Receive the next inbound unit. `ConnectionClosed` when the peer goes
    /// away.
    async fn recv(&mut self) -> Result<Inbound>;
}

/// Writing half of a transport.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one message.
    async fn send(&mut self, msg: &Message) -> Result<()>;

    /// Write a batch frame (single messages fall back to `send`).
    async fn send_batch(&mut self, msgs: &[Message]) -> Result<()>;

    /// Transport-level keepalive ping.
    async fn send_ping(&mut self) -> Result<()>;

    /// Best-effort close notification.
    async fn close(&mut self);
}

/// Split a WebSocket into transport halves.
pub fn split_ws(socket: WebSocket, mode: WireMode) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (
        WsReader {
            stream,
            codec: FrameCodec::new(),
        },
        WsWriter {
            sink,
            codec: FrameCodec::new(),
            mode,
        },
    )
}

/// WebSocket reading half.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
    codec: FrameCodec,
}

#[async_trait]
impl TransportReader for WsReader {
    async fn recv(&mut self) -> Result<Inbound> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read error");
                    return Err(Error::ConnectionClosed);
                }
                None => return Err(Error::ConnectionClosed),
            };

            match frame {
                WsMessage::Text(text) => match Message::from_json(text.as_str()) {
                    Ok(msg) => return Ok(Inbound::Message(msg)),
                    Err(e) => {
                        // Inbound codec errors are logged and the frame
                        // dropped; persistent garbage eventually trips the
                        // read deadline.
                        warn!(error = %e, "dropping undecodable text frame");
                        continue;
                    }
                },
                WsMessage::Binary(data) => match self.codec.decode(&data) {
                    Ok(Decoded::Message(msg)) => return Ok(Inbound::Message(msg)),
                    Ok(Decoded::Batch(msgs)) => return Ok(Inbound::Batch(msgs)),
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable binary frame");
                        continue;
                    }
                },
                WsMessage::Ping(_) | WsMessage::Pong(_) => return Ok(Inbound::Pong),
                WsMessage::Close(_) => return Err(Error::ConnectionClosed),
            }
        }
    }
}

/// WebSocket writing half.
pub struct WsWriter {
    sink: SplitSink<WebSocket, WsMessage>,
    codec: FrameCodec,
    mode: WireMode,
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = match self.mode {
            WireMode::Json => WsMessage::Text(msg.to_json()?.into()),
            WireMode::Binary => WsMessage::Binary(self.codec.encode(msg)?),
        };
        self.sink
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn send_batch(&mut self, msgs: &[Message]) -> Result<()> {
        match msgs {
            [] => Ok(()),
            [single] => self.send(single).await,
            _ => match self.mode {
                // Text mode has no batch framing; messages go out one by
                // one.
                WireMode::Json => {
                    for msg in msgs {
                        self.send(msg).await?;
                    }
                    Ok(())
                }
                WireMode::Binary => {
                    let frame = self.codec.encode_batch(msgs)?;
                    self.sink
                        .send(WsMessage::Binary(frame))
                        .await
                        .map_err(|_| Error::ConnectionClosed)
                }
            },
        }
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.sink
            .send(WsMessage::Ping(Vec::new().into()))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.flush().await;
    }
}
