//! Chat-side state: conversation context, file watching, and error recovery.

pub mod context;
pub mod recovery;
pub mod watcher;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::error::Result;

pub use context::{
    load_or_create, ContextStore, ConversationContext, FileRole, Role, SharedContext,
};
pub use recovery::{
    classify, classify_message, ClassifiedError, ErrorKind, ErrorRecovery, RecoveryConfig,
    RecoveryHooks,
};
pub use watcher::{ProjectWatcher, WatcherConfig};

/// One streamed chunk of a chat reply. A chunk with `finished` set closes
/// the stream; its content may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyChunk {
    pub content: String,
    pub finished: bool,
}

impl ReplyChunk {
    pub fn partial(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finished: false,
        }
    }

    pub fn finished(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finished: true,
        }
    }
}

/// Something that can answer chat messages with a stream of reply chunks.
///
/// The session runtime consumes the assistant adapter through this trait;
/// tests substitute a scripted stub.
#[async_trait]
pub trait ChatHandler: Send + Sync {
    /// Handle one user message. The returned stream yields zero or more
    /// partial chunks followed by exactly one finished chunk (unless the
    /// caller goes away first).
    async fn handle_chat(&self, role: &str, content: &str) -> Result<mpsc::Receiver<ReplyChunk>>;

    /// Release resources. Idempotent.
    async fn close(&self);
}
