//! Error types for tether-core.

use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Inbound frame length exceeds the 1 MiB limit.
    #[error("frame too large: {size} bytes")]
    FrameTooLarge { size: usize },

    /// Stream ended mid-frame.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// PTY allocation failed.
    #[error("pty allocation failed: {message}")]
    PtyAlloc { message: String },

    /// Child process spawn failed.
    #[error("spawn failed: {message}")]
    Spawn { message: String },

    /// PTY I/O error.
    #[error("pty error: {message}")]
    Pty { message: String },

    /// Terminal input could not be delivered within the write timeout.
    #[error("terminal write timed out")]
    WriteTimeout,

    /// Terminal exists but its child has exited.
    #[error("terminal not running: {0}")]
    NotRunning(String),

    /// No terminal with the given id.
    #[error("terminal not found: {0}")]
    NotFound(String),

    /// Terminal session cap reached.
    #[error("terminal cap reached ({max})")]
    CapReached { max: usize },

    /// Assistant child did not produce a prompt in time.
    #[error("assistant initialization timed out")]
    InitTimeout,

    /// Assistant process error.
    #[error("assistant error: {message}")]
    Assistant { message: String },

    /// Internal channel closed unexpectedly.
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Filesystem watcher error.
    #[error("watch error: {message}")]
    Watch { message: String },
}

impl Error {
    /// True if the session can outlive this error (the operation failed but
    /// the connection stays up).
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Error::WriteTimeout
                | Error::NotRunning(_)
                | Error::NotFound(_)
                | Error::CapReached { .. }
        )
    }
}

/// Convenience result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
