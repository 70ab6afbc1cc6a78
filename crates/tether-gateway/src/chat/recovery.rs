//! Error classification and recovery.
//!
//! Failures crossing into user-visible territory are classified into a
//! small taxonomy; each kind carries a retryable flag, a wire code, and a
//! user-facing template message. Recovery dispatches per kind through the
//! [`RecoveryHooks`] trait, which the component owning the resources
//! implements; the recovery module depends only on that interface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use tether_core::constants::{RECOVERY_BASE_DELAY, RECOVERY_MAX_DELAY, RECOVERY_MAX_RETRIES};
use tether_core::error::{Error, Result};
use tether_core::protocol::ChatErrorPayload;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Process,
    Api,
    Filesystem,
    Auth,
    RateLimit,
    Unknown,
}

impl ErrorKind {
    /// Whether a retry can reasonably help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::Process
                | ErrorKind::Api
                | ErrorKind::RateLimit
        )
    }

    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Process => "PROCESS",
            ErrorKind::Api => "API",
            ErrorKind::Filesystem => "FILESYSTEM",
            ErrorKind::Auth => "AUTH",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// User-facing template message.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "Connection lost. Retrying...",
            ErrorKind::Timeout => "Request timed out. Please try again.",
            ErrorKind::Process => "AI assistant is restarting. Please wait...",
            ErrorKind::Api => "AI service temporarily unavailable. Retrying...",
            ErrorKind::Auth => "Authentication required. Please check your API keys.",
            ErrorKind::RateLimit => "Rate limit exceeded. Please wait before sending more messages.",
            ErrorKind::Filesystem => "File access error. Please check permissions.",
            ErrorKind::Unknown => "Something went wrong. Please try again.",
        }
    }
}

/// An error with its classification attached.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    /// Render as a `chat_error` payload.
    pub fn to_payload(&self) -> ChatErrorPayload {
        let mut details = HashMap::new();
        details.insert("detail".to_string(), self.message.clone());
        if let Some(delay) = self.retry_after {
            details.insert("retry_after_ms".to_string(), delay.as_millis().to_string());
        }

        ChatErrorPayload {
            message: self.user_message().to_string(),
            code: self.kind.code().to_string(),
            retryable: self.retryable(),
            details: Some(details),
        }
    }
}

/// Classify an error by its variant and message patterns. Unmatched errors
/// are `Unknown`.
pub fn classify(err: &Error) -> ClassifiedError {
    // Strong signals from the variant first.
    let kind = match err {
        Error::Timeout | Error::InitTimeout | Error::WriteTimeout => Some(ErrorKind::Timeout),
        Error::ConnectionClosed => Some(ErrorKind::Connection),
        Error::Spawn { .. } | Error::Pty { .. } | Error::Assistant { .. } => {
            Some(ErrorKind::Process)
        }
        Error::Watch { .. } => Some(ErrorKind::Filesystem),
        _ => None,
    };

    match kind {
        Some(kind) => ClassifiedError::new(kind, err.to_string()),
        None => classify_message(&err.to_string()),
    }
}

/// Classify from an error message alone.
pub fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    let kind = if lower.contains("connection") {
        ErrorKind::Connection
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("process") || lower.contains("exec") {
        ErrorKind::Process
    } else if lower.contains("api") || lower.contains("http") {
        ErrorKind::Api
    } else if lower.contains("file") || lower.contains("directory") {
        ErrorKind::Filesystem
    } else if lower.contains("auth") || lower.contains("unauthorized") {
        ErrorKind::Auth
    } else if lower.contains("rate") || lower.contains("quota") {
        ErrorKind::RateLimit
    } else {
        ErrorKind::Unknown
    };

    ClassifiedError::new(kind, message)
}

/// Recovery actions provided by the component owning the resources being
/// recovered.
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    /// Tear down and relaunch the supervised process.
    async fn restart_process(&self) -> Result<()>;

    /// Re-establish the I/O path to the process.
    async fn reset_connection(&self) -> Result<()>;

    /// Persist state and drain buffers.
    async fn cleanup_resources(&self) -> Result<()>;
}

/// Recovery tuning knobs.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: RECOVERY_MAX_RETRIES,
            base_delay: RECOVERY_BASE_DELAY,
            max_delay: RECOVERY_MAX_DELAY,
        }
    }
}

/// Per-kind retry accounting plus backoff-and-dispatch.
pub struct ErrorRecovery {
    config: RecoveryConfig,
    attempts: Mutex<HashMap<ErrorKind, u32>>,
}

impl ErrorRecovery {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to recover from `err` using `hooks`.
    ///
    /// Dispatch by kind: process restarts the child, timeout waits a second
    /// then restarts, connection resets the I/O path, filesystem cleans up,
    /// api and rate-limit take no local action (the natural retry path runs
    /// after any declared retry-after), auth and unknown never recover.
    /// Attempts are capped per kind.
    pub async fn recover(&self, err: &ClassifiedError, hooks: &dyn RecoveryHooks) -> Result<()> {
        warn!(
            kind = err.kind.code(),
            message = %err.message,
            "handling assistant error"
        );

        if matches!(err.kind, ErrorKind::Auth | ErrorKind::Unknown) {
            return Err(Error::Assistant {
                message: format!("no recovery strategy for {}", err.kind.code()),
            });
        }

        let prior = self.attempts(err.kind);
        if prior >= self.config.max_retries {
            return Err(Error::Assistant {
                message: format!(
                    "recovery for {} exhausted after {} attempts",
                    err.kind.code(),
                    prior
                ),
            });
        }

        let delay = err.retry_after.unwrap_or_else(|| self.backoff(prior));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match err.kind {
            ErrorKind::Process => hooks.restart_process().await?,
            ErrorKind::Timeout => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                hooks.restart_process().await?;
            }
            ErrorKind::Connection => hooks.reset_connection().await?,
            ErrorKind::Filesystem => hooks.cleanup_resources().await?,
            // Let the caller's natural retry path handle these.
            ErrorKind::Api | ErrorKind::RateLimit => {}
            ErrorKind::Auth | ErrorKind::Unknown => unreachable!(),
        }

        self.record_attempt(err.kind);
        info!(kind = err.kind.code(), "recovery successful");
        Ok(())
    }

    /// Clear the attempt counter for a kind.
    pub fn reset(&self, kind: ErrorKind) {
        self.attempts.lock().unwrap().remove(&kind);
    }

    fn attempts(&self, kind: ErrorKind) -> u32 {
        *self.attempts.lock().unwrap().get(&kind).unwrap_or(&0)
    }

    fn record_attempt(&self, kind: ErrorKind) {
        *self.attempts.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    /// Exponential backoff: base doubling per prior attempt, capped.
    fn backoff(&self, prior_attempts: u32) -> Duration {
        let mut delay = self.config.base_delay;
        for _ in 0..prior_attempts {
            delay = delay.saturating_mul(2);
            if delay >= self.config.max_delay {
                return self.config.max_delay;
            }
        }
        delay.min(self.config.max_delay)
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
