//! The per-connection session runtime.
//!
//! Every accepted connection runs a read pump (routing inbound messages to
//! chat, terminal, or control handling), a write pump (sole consumer of the
//! outbound channel, enqueueing each message for retry before it hits the
//! wire), a retry pump, and optionally a batch collector. Chat replies and
//! terminal output fan out through per-request tasks that all converge on
//! the bounded outbound channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::constants::{
    BATCH_SIZE, BATCH_TIMEOUT, OUTBOUND_BUFFER, PING_INTERVAL, READ_TIMEOUT,
    RETRY_SCAN_INTERVAL, WRITE_TIMEOUT,
};
use tether_core::error::{Error, Result};
use tether_core::protocol::message::now_ms;
use tether_core::protocol::{
    AckPayload, Body, ChatStreamPayload, Message, PingPayload, SessionStartPayload,
};
use tether_core::queue::MessageQueue;
use uuid::Uuid;

use crate::chat::{classify, ChatHandler};
use crate::terminal::{TerminalHandler, TerminalManager};

use super::transport::{Inbound, TransportReader, TransportWriter};

const BATCH_CHANNEL: usize = 32;

/// Batch collection settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub size: usize,
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: BATCH_SIZE,
            timeout: BATCH_TIMEOUT,
        }
    }
}

/// Runtime tuning knobs; defaults match the protocol constants.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub retry_scan_interval: Duration,
    pub outbound_buffer: usize,
    /// Batch collection; `None` writes messages one frame each.
    pub batching: Option<BatchConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            retry_scan_interval: RETRY_SCAN_INTERVAL,
            outbound_buffer: OUTBOUND_BUFFER,
            batching: None,
        }
    }
}

/// What a session runtime works with.
pub struct SessionDeps {
    pub queue: Arc<MessageQueue>,
    pub terminals: Arc<TerminalManager>,
    pub chat: Arc<dyn ChatHandler>,
}

/// Write-pump instructions.
enum Outbound {
    /// Fresh messages are waiting in the queue's pending list.
    Flush,
    /// Resend an already-sequenced message (retry or replay).
    Resend(Message),
}

/// Producer-side handle: enqueue for sequencing, then signal the writer.
/// Blocks when the outbound channel is full (backpressure propagates to the
/// producing pump); sends are dropped silently once the channel is gone.
#[derive(Clone)]
struct OutboundHandle {
    queue: Arc<MessageQueue>,
    tx: mpsc::Sender<Outbound>,
}

impl OutboundHandle {
    async fn send(&self, msg: Message) {
        self.queue.enqueue(msg);
        let _ = self.tx.send(Outbound::Flush).await;
    }

    async fn resend(&self, msg: Message) {
        let _ = self.tx.send(Outbound::Resend(msg)).await;
    }
}

/// The connection state machine.
pub struct SessionRuntime {
    session_id: String,
    config: RuntimeConfig,
    queue: Arc<MessageQueue>,
    terminals: Arc<TerminalManager>,
    terminal_handler: TerminalHandler,
    chat: Arc<dyn ChatHandler>,
    last_activity: std::sync::Mutex<Instant>,
}

impl SessionRuntime {
    /// Build a runtime with a freshly minted session id.
    pub fn new(config: RuntimeConfig, deps: SessionDeps) -> Self {
        Self::with_session_id(Uuid::new_v4().to_string(), config, deps)
    }

    /// Build a runtime resuming an externally minted session id (shared
    /// with the assistant adapter so snapshots land under the same name).
    pub fn with_session_id(session_id: String, config: RuntimeConfig, deps: SessionDeps) -> Self {
        Self {
            session_id,
            config,
            terminal_handler: TerminalHandler::new(deps.terminals.clone()),
            queue: deps.queue,
            terminals: deps.terminals,
            chat: deps.chat,
            last_activity: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// The server-minted session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Instant of the last inbound message.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Drive the connection until the transport fails or closes. Owns the
    /// full shutdown cascade: pumps, terminals, assistant.
    pub async fn run<R, W>(self, mut reader: R, writer: W)
    where
        R: TransportReader,
        W: TransportWriter + 'static,
    {
        info!(session_id = %self.session_id, "session started");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Message>>(BATCH_CHANNEL);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let outbound = OutboundHandle {
            queue: self.queue.clone(),
            tx: outbound_tx,
        };

        let collector_task = tokio::spawn(collector_pump(
            outbound_rx,
            self.queue.clone(),
            batch_tx,
            self.config.batching.clone(),
            shutdown_rx.clone(),
        ));
        let writer_task = tokio::spawn(write_pump(
            writer,
            batch_rx,
            self.config.write_timeout,
            self.config.ping_interval,
            shutdown_rx.clone(),
            shutdown_tx.clone(),
        ));
        let retry_task = tokio::spawn(retry_pump(
            self.queue.clone(),
            outbound.clone(),
            self.config.retry_scan_interval,
            shutdown_rx.clone(),
        ));

        // Announce the session id so the client can reconnect later.
        outbound
            .send(Message::new(Body::SessionStart(SessionStartPayload {
                session_id: self.session_id.clone(),
            })))
            .await;

        loop {
            match tokio::time::timeout(self.config.read_timeout, reader.recv()).await {
                Ok(Ok(Inbound::Message(msg))) => {
                    self.route(msg, &outbound, &shutdown_rx).await;
                }
                Ok(Ok(Inbound::Batch(msgs))) => {
                    for msg in msgs {
                        self.route(msg, &outbound, &shutdown_rx).await;
                    }
                }
                Ok(Ok(Inbound::Pong)) => continue,
                Ok(Err(Error::ConnectionClosed)) => {
                    info!(session_id = %self.session_id, "connection closed by peer");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(session_id = %self.session_id, error = %e, "transport read error");
                    break;
                }
                Err(_) => {
                    warn!(session_id = %self.session_id, "read deadline expired");
                    break;
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
        }

        // Session-fatal path: cancel everything derived from this
        // connection.
        let _ = shutdown_tx.send(true);
        drop(outbound);

        let _ = tokio::join!(collector_task, writer_task, retry_task);
        self.terminals.shutdown().await;
        self.chat.close().await;

        info!(session_id = %self.session_id, "session ended");
    }

    /// Route one inbound message by kind.
    async fn route(
        &self,
        msg: Message,
        outbound: &OutboundHandle,
        shutdown: &watch::Receiver<bool>,
    ) {
        debug!(kind = msg.kind(), id = %msg.id, "inbound message");
        *self.last_activity.lock().unwrap() = Instant::now();
        let Message { id, body, .. } = msg;

        match body {
            Body::Chat(chat) => {
                let handler = self.chat.clone();
                let outbound = outbound.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut replies = tokio::select! {
                        _ = shutdown.changed() => return,
                        result = handler.handle_chat(&chat.role, &chat.content) => match result {
                            Ok(replies) => replies,
                            Err(e) => {
                                let classified = classify(&e);
                                warn!(error = %e, "chat handler failed");
                                outbound
                                    .send(Message::reply_to(
                                        Body::ChatError(classified.to_payload()),
                                        &id,
                                    ))
                                    .await;
                                outbound.send(ack_message(&id, false)).await;
                                return;
                            }
                        },
                    };

                    loop {
                        tokio::select! {
                            // Session teardown: dropping `replies` tells the
                            // handler the client is gone.
                            _ = shutdown.changed() => break,
                            chunk = replies.recv() => {
                                let Some(chunk) = chunk else { break };
                                let finished = chunk.finished;
                                outbound
                                    .send(Message::reply_to(
                                        Body::ChatStream(ChatStreamPayload {
                                            content: chunk.content,
                                            finished,
                                            tokens: None,
                                            cost: None,
                                            file_edits: None,
                                        }),
                                        &id,
                                    ))
                                    .await;
                                if finished {
                                    outbound.send(ack_message(&id, true)).await;
                                    break;
                                }
                            }
                        }
                    }
                });
            }

            Body::TerminalCreate(create) => match self.terminal_handler.handle_create(&id, create)
            {
                Ok(created) => {
                    outbound.send(created.reply).await;

                    // Fan-out: one task per terminal forwards its output,
                    // tagged with the terminal id.
                    let outbound = outbound.clone();
                    let mut shutdown = shutdown.clone();
                    let terminal_id = created.terminal_id;
                    let mut output = created.output;
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                data = output.recv() => {
                                    let Some(data) = data else { break };
                                    outbound
                                        .send(TerminalHandler::output_message(&terminal_id, &data))
                                        .await;
                                }
                            }
                        }
                        debug!(terminal_id = %terminal_id, "terminal fan-out ended");
                    });
                }
                Err(reply) => outbound.send(reply).await,
            },

            Body::TerminalInput(input) => {
                let reply = self.terminal_handler.handle_input(&id, input).await;
                outbound.send(reply).await;
            }
            Body::TerminalResize(resize) => {
                let reply = self.terminal_handler.handle_resize(&id, resize);
                outbound.send(reply).await;
            }
            Body::TerminalClose(close) => {
                let reply = self.terminal_handler.handle_close(&id, close).await;
                outbound.send(reply).await;
            }
            Body::TerminalList(_) => {
                let reply = self.terminal_handler.handle_list(&id);
                outbound.send(reply).await;
            }

            Body::Ping(_) => {
                outbound
                    .send(Message::reply_to(
                        Body::Pong(PingPayload {
                            timestamp_ms: Some(now_ms()),
                            metrics: None,
                        }),
                        &id,
                    ))
                    .await;
            }

            Body::Ack(ack) => {
                // In-flight is keyed by message id; the seq_num field rides
                // along unused.
                self.queue.ack(&ack.message_id);
            }

            Body::Reconnect(reconnect) => {
                if reconnect.session_id == self.session_id {
                    let replay = self.queue.messages_after(reconnect.last_seq_num);
                    info!(
                        last_seq = reconnect.last_seq_num,
                        count = replay.len(),
                        "replaying messages after reconnect"
                    );
                    for msg in replay {
                        outbound.resend(msg).await;
                    }
                } else {
                    // Resume only works within the same runtime instance;
                    // the client must reopen fresh.
                    debug!(
                        offered = %reconnect.session_id,
                        "reconnect for another session ignored"
                    );
                }
            }

            Body::SessionEnd(end) => {
                info!(reason = ?end.reason, "client ended session");
            }

            other => {
                warn!(kind = other.kind(), id = %id, "unhandled message kind");
            }
        }
    }
}

fn ack_message(message_id: &str, success: bool) -> Message {
    Message::new(Body::Ack(AckPayload {
        message_id: message_id.to_string(),
        seq_num: None,
        success,
    }))
}

/// Drains the queue on writer signals and hands the writer ready batches.
/// With batching disabled every message ships alone, immediately.
async fn collector_pump(
    mut rx: mpsc::Receiver<Outbound>,
    queue: Arc<MessageQueue>,
    batch_tx: mpsc::Sender<Vec<Message>>,
    batching: Option<BatchConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    match batching {
        None => loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                op = rx.recv() => {
                    let Some(op) = op else { break };
                    match op {
                        Outbound::Flush => {
                            while let Some(msg) = queue.dequeue() {
                                if batch_tx.send(vec![msg]).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Outbound::Resend(msg) => {
                            if batch_tx.send(vec![msg]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        },
        Some(config) => {
            let mut pending: Vec<Message> = Vec::with_capacity(config.size);
            let mut ticker = tokio::time::interval(config.timeout);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        match op {
                            Outbound::Flush => {
                                while let Some(msg) = queue.dequeue() {
                                    pending.push(msg);
                                    if pending.len() >= config.size {
                                        if batch_tx.send(std::mem::take(&mut pending)).await.is_err() {
                                            return;
                                        }
                                        ticker.reset();
                                    }
                                }
                            }
                            Outbound::Resend(msg) => {
                                pending.push(msg);
                                if pending.len() >= config.size {
                                    if batch_tx.send(std::mem::take(&mut pending)).await.is_err() {
                                        return;
                                    }
                                    ticker.reset();
                                }
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !pending.is_empty()
                            && batch_tx.send(std::mem::take(&mut pending)).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }

            if !pending.is_empty() {
                let _ = batch_tx.send(pending).await;
            }
        }
    }
}

/// Sole writer: each batch goes out under the write deadline; a ticker
/// pings the transport when the connection has been idle.
async fn write_pump<W: TransportWriter>(
    mut writer: W,
    mut batch_rx: mpsc::Receiver<Vec<Message>>,
    write_timeout: Duration,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            batch = batch_rx.recv() => {
                let Some(batch) = batch else { break };
                let result = timed_write(&mut writer, &batch, write_timeout).await;
                if let Err(e) = result {
                    warn!(error = %e, "write failed, closing session");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                last_write = Instant::now();
            }
            _ = ticker.tick() => {
                if last_write.elapsed() < ping_interval {
                    continue;
                }
                let ping = tokio::time::timeout(write_timeout, writer.send_ping()).await;
                match ping {
                    Ok(Ok(())) => last_write = Instant::now(),
                    _ => {
                        warn!("ping failed, closing session");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
        }
    }

    writer.close().await;
}

async fn timed_write<W: TransportWriter>(
    writer: &mut W,
    batch: &[Message],
    deadline: Duration,
) -> Result<()> {
    match tokio::time::timeout(deadline, writer.send_batch(batch)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

/// Periodically rescues unacked in-flight messages for resend.
async fn retry_pump(
    queue: Arc<MessageQueue>,
    outbound: OutboundHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for msg in queue.check_retries(Instant::now()) {
                    debug!(seq = msg.seq, retry = msg.retry_count, "resending unacked message");
                    outbound.resend(msg).await;
                }
            }
        }
    }
}
