//! Terminal message handling.
//!
//! Translates terminal wire messages into manager operations and builds the
//! reply messages. Operation failures become `terminal_error` frames; they
//! never tear down the session.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tracing::debug;

use tether_core::constants::{DEFAULT_COLS, DEFAULT_ROWS};
use tether_core::protocol::{
    AckPayload, Body, Message, TerminalClosePayload, TerminalCreatePayload,
    TerminalCreatedPayload, TerminalErrorPayload, TerminalInputPayload, TerminalListPayload,
    TerminalOutputPayload, TerminalResizePayload,
};

use super::manager::TerminalManager;

/// A freshly created terminal: the reply to send plus the output stream to
/// fan out.
pub struct CreatedTerminal {
    pub reply: Message,
    pub terminal_id: String,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Stateless adapter between terminal wire messages and the manager.
pub struct TerminalHandler {
    manager: Arc<TerminalManager>,
}

impl TerminalHandler {
    pub fn new(manager: Arc<TerminalManager>) -> Self {
        Self { manager }
    }

    /// Create a terminal and hand back its output stream.
    ///
    /// On failure the error reply is returned instead; no process is left
    /// behind.
    pub fn handle_create(
        &self,
        request_id: &str,
        payload: TerminalCreatePayload,
    ) -> std::result::Result<CreatedTerminal, Message> {
        let rows = payload.rows.unwrap_or(DEFAULT_ROWS);
        let cols = payload.cols.unwrap_or(DEFAULT_COLS);
        let env = payload
            .env
            .unwrap_or_default()
            .iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let session = self
            .manager
            .create(payload.workdir, env, rows, cols)
            .map_err(|e| self.error_reply(request_id, None, &e.to_string()))?;

        let output = match session.take_output() {
            Some(rx) => rx,
            None => {
                return Err(self.error_reply(
                    request_id,
                    Some(session.id().to_string()),
                    "terminal output already consumed",
                ));
            }
        };

        let terminal_id = session.id().to_string();
        let reply = Message::reply_to(
            Body::TerminalCreated(TerminalCreatedPayload {
                terminal_id: terminal_id.clone(),
            }),
            request_id,
        );

        Ok(CreatedTerminal {
            reply,
            terminal_id,
            output,
        })
    }

    /// Decode and deliver input bytes; reply with an ack.
    pub async fn handle_input(&self, request_id: &str, payload: TerminalInputPayload) -> Message {
        let data = match BASE64.decode(payload.data.as_bytes()) {
            Ok(data) => data,
            Err(e) => {
                return self.error_reply(
                    request_id,
                    Some(payload.terminal_id),
                    &format!("invalid base64 input: {}", e),
                );
            }
        };

        let result = match self.manager.get(&payload.terminal_id) {
            Ok(session) => session.write(data).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.ack_reply(request_id),
            Err(e) => self.error_reply(request_id, Some(payload.terminal_id), &e.to_string()),
        }
    }

    /// Resize a terminal; reply with an ack.
    pub fn handle_resize(&self, request_id: &str, payload: TerminalResizePayload) -> Message {
        let result = match self.manager.get(&payload.terminal_id) {
            Ok(session) => session.resize(payload.rows, payload.cols),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(
                    terminal_id = %payload.terminal_id,
                    rows = payload.rows,
                    cols = payload.cols,
                    "terminal resized"
                );
                self.ack_reply(request_id)
            }
            Err(e) => self.error_reply(request_id, Some(payload.terminal_id), &e.to_string()),
        }
    }

    /// Close a terminal; reply with an ack.
    pub async fn handle_close(&self, request_id: &str, payload: TerminalClosePayload) -> Message {
        match self.manager.close(&payload.terminal_id).await {
            Ok(()) => self.ack_reply(request_id),
            Err(e) => self.error_reply(request_id, Some(payload.terminal_id), &e.to_string()),
        }
    }

    /// List running terminals.
    pub fn handle_list(&self, request_id: &str) -> Message {
        Message::reply_to(
            Body::TerminalList(TerminalListPayload {
                terminals: self.manager.list(),
            }),
            request_id,
        )
    }

    /// Build a `terminal_output` frame tagged with its terminal id.
    pub fn output_message(terminal_id: &str, data: &[u8]) -> Message {
        Message::new(Body::TerminalOutput(TerminalOutputPayload {
            terminal_id: terminal_id.to_string(),
            data: BASE64.encode(data),
        }))
    }

    fn ack_reply(&self, request_id: &str) -> Message {
        Message::new(Body::Ack(AckPayload {
            message_id: request_id.to_string(),
            seq_num: None,
            success: true,
        }))
    }

    fn error_reply(
        &self,
        request_id: &str,
        terminal_id: Option<String>,
        message: &str,
    ) -> Message {
        Message::reply_to(
            Body::TerminalError(TerminalErrorPayload {
                terminal_id,
                message: message.to_string(),
            }),
            request_id,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::manager::ManagerConfig;

    fn handler() -> TerminalHandler {
        TerminalHandler::new(Arc::new(TerminalManager::new(ManagerConfig {
            shell: "/bin/sh".into(),
            max_sessions: 2,
            ..Default::default()
        })))
    }

    #[tokio::test]
    async fn input_to_unknown_terminal_is_an_error_frame() {
        let handler = handler();
        let reply = handler
            .handle_input(
                "m1",
                TerminalInputPayload {
                    terminal_id: "ghost".into(),
                    data: BASE64.encode(b"ls\n"),
                },
            )
            .await;

        match reply.body {
            Body::TerminalError(err) => {
                assert_eq!(err.terminal_id.as_deref(), Some("ghost"));
                assert!(err.message.contains("not found"));
            }
            other => panic!("expected terminal_error, got {:?}", other),
        }
        assert_eq!(reply.correlation_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn bad_base64_is_an_error_frame() {
        let handler = handler();
        let reply = handler
            .handle_input(
                "m2",
                TerminalInputPayload {
                    terminal_id: "t1".into(),
                    data: "!!! not base64 !!!".into(),
                },
            )
            .await;

        assert!(matches!(reply.body, Body::TerminalError(_)));
    }

    #[tokio::test]
    async fn create_input_output_close_flow() {
        let handler = handler();
        let created = match handler.handle_create("m3", TerminalCreatePayload::default()) {
            Ok(c) => c,
            Err(_) => {
                eprintln!("skipping: no pty available");
                return;
            }
        };

        assert!(matches!(created.reply.body, Body::TerminalCreated(_)));
        assert_eq!(created.reply.correlation_id.as_deref(), Some("m3"));

        let ack = handler
            .handle_input(
                "m4",
                TerminalInputPayload {
                    terminal_id: created.terminal_id.clone(),
                    data: BASE64.encode(b"echo gw-test\n"),
                },
            )
            .await;
        assert!(matches!(ack.body, Body::Ack(_)));

        // Output frames are tagged with the terminal id (terminal isolation).
        let mut output = created.output;
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(std::time::Duration::from_millis(500), output.recv()).await
            {
                Ok(Some(chunk)) => {
                    let msg = TerminalHandler::output_message(&created.terminal_id, &chunk);
                    match msg.body {
                        Body::TerminalOutput(out) => {
                            assert_eq!(out.terminal_id, created.terminal_id);
                            seen.push_str(&String::from_utf8_lossy(
                                &BASE64.decode(out.data.as_bytes()).unwrap(),
                            ));
                        }
                        other => panic!("expected terminal_output, got {:?}", other),
                    }
                    if seen.contains("gw-test") {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert!(seen.contains("gw-test"));

        let ack = handler
            .handle_close(
                "m5",
                TerminalClosePayload {
                    terminal_id: created.terminal_id.clone(),
                },
            )
            .await;
        assert!(matches!(ack.body, Body::Ack(_)));

        let listing = handler.handle_list("m6");
        match listing.body {
            Body::TerminalList(list) => assert!(list.terminals.is_empty()),
            other => panic!("expected terminal_list, got {:?}", other),
        }
    }
}
