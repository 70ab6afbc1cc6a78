//! Scripted assistant stub.
//!
//! Answers every chat with a fixed token sequence followed by a finished
//! chunk, mirroring the adapter's streaming contract without a child
//! process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::error::{Error, Result};
use tether_gateway::chat::{ChatHandler, ReplyChunk};

/// A `ChatHandler` that replays a script.
pub struct StubAssistant {
    tokens: Vec<String>,
    fail_with: Option<String>,
    received: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

impl StubAssistant {
    /// Reply to every chat with these tokens, then finish.
    pub fn scripted(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            fail_with: None,
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Fail every chat with this error message.
    pub fn failing(message: &str) -> Self {
        Self {
            tokens: Vec::new(),
            fail_with: Some(message.to_string()),
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Messages seen so far, as (role, content) pairs.
    pub fn received(&self) -> Vec<(String, String)> {
        self.received.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatHandler for StubAssistant {
    async fn handle_chat(&self, role: &str, content: &str) -> Result<mpsc::Receiver<ReplyChunk>> {
        if let Some(message) = &self.fail_with {
            return Err(Error::Assistant {
                message: message.clone(),
            });
        }

        self.received
            .lock()
            .unwrap()
            .push((role.to_string(), content.to_string()));

        let (tx, rx) = mpsc::channel(8);
        let tokens = self.tokens.clone();
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(ReplyChunk::partial(token)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(ReplyChunk::finished("")).await;
        });

        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
