//! Channel-backed transport halves.
//!
//! The runtime sees an ordinary reader/writer pair; the test side drives
//! them through a [`MockClient`]: inject inbound messages, observe every
//! outbound message in wire order, count pings, and hang up by dropping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::error::{Error, Result};
use tether_core::protocol::Message;
use tether_gateway::connection::{Inbound, TransportReader, TransportWriter};

/// Test-side handle to a mock transport.
pub struct MockClient {
    to_server: Option<mpsc::Sender<Inbound>>,
    from_server: mpsc::UnboundedReceiver<Message>,
    pings: Arc<AtomicUsize>,
}

impl MockClient {
    /// Inject one inbound message.
    pub async fn send(&self, msg: Message) {
        if let Some(tx) = &self.to_server {
            let _ = tx.send(Inbound::Message(msg)).await;
        }
    }

    /// Inject transport-level keepalive traffic.
    pub async fn send_pong(&self) {
        if let Some(tx) = &self.to_server {
            let _ = tx.send(Inbound::Pong).await;
        }
    }

    /// Next outbound message within `deadline`, or `None`.
    pub async fn recv(&mut self, deadline: Duration) -> Option<Message> {
        tokio::time::timeout(deadline, self.from_server.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drain whatever arrives within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<Message> {
        let mut msgs = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.from_server.recv()).await {
                Ok(Some(msg)) => msgs.push(msg),
                _ => break,
            }
        }
        msgs
    }

    /// Transport pings observed so far.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Hang up: the server's next read fails with `ConnectionClosed`.
    pub fn hang_up(&mut self) {
        self.to_server = None;
    }
}

/// Reading half backed by a channel.
pub struct MockReader {
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl TransportReader for MockReader {
    async fn recv(&mut self) -> Result<Inbound> {
        self.rx.recv().await.ok_or(Error::ConnectionClosed)
    }
}

/// Writing half backed by a channel.
pub struct MockWriter {
    tx: mpsc::UnboundedSender<Message>,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn send_batch(&mut self, msgs: &[Message]) -> Result<()> {
        for msg in msgs {
            self.send(msg).await?;
        }
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Build a connected (reader, writer, client) triple.
pub fn mock_transport() -> (MockReader, MockWriter, MockClient) {
    let (to_server_tx, to_server_rx) = mpsc::channel(64);
    let (from_server_tx, from_server_rx) = mpsc::unbounded_channel();
    let pings = Arc::new(AtomicUsize::new(0));

    (
        MockReader { rx: to_server_rx },
        MockWriter {
            tx: from_server_tx,
            pings: pings.clone(),
        },
        MockClient {
            to_server: Some(to_server_tx),
            from_server: from_server_rx,
            pings,
        },
    )
}
