//! Protocol and configuration constants for the tether gateway.

use std::time::Duration;

// =============================================================================
// Framing Constants
// =============================================================================

/// Length of the frame header: 1 flag byte + 4-byte big-endian length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum frame payload size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Payloads below this size are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 1024;

/// zstd compression level (fast, reasonable ratio for mobile links).
pub const COMPRESSION_LEVEL: i32 = 3;

/// Frame flag: payload is zstd-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Frame flag: payload is a batch of messages.
pub const FLAG_BATCH: u8 = 0x02;

// =============================================================================
// Queue Constants
// =============================================================================

/// Maximum pending messages before the oldest is evicted.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Maximum resend attempts before an unacked message is dropped.
pub const MAX_RETRIES: u32 = 3;

/// Age at which an in-flight message becomes due for resend.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between retry scans.
pub const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Connection Timing
// =============================================================================

/// Transport read deadline, refreshed by inbound traffic and pongs.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-message transport write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between transport-level pings on an idle connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the per-connection outbound channel.
pub const OUTBOUND_BUFFER: usize = 256;

/// Default batch size when batching is enabled.
pub const BATCH_SIZE: usize = 10;

/// Flush timeout for a partially filled batch.
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(50);

// =============================================================================
// Terminal Constants
// =============================================================================

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Default terminal columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default TERM environment variable.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Maximum concurrent terminal sessions per connection.
pub const MAX_TERMINALS: usize = 10;

/// Send timeout for terminal input.
pub const TERMINAL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL on terminal close.
pub const TERMINAL_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Idle age at which a terminal is reaped.
pub const TERMINAL_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Interval between idle-terminal sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Assistant Constants
// =============================================================================

/// Time allowed for the assistant child to reach its first prompt.
pub const ASSISTANT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall deadline for a single chat response.
pub const CHAT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Capacity of the assistant output channel.
pub const ASSISTANT_OUTPUT_BUFFER: usize = 100;

/// Capacity of the assistant error channel.
pub const ASSISTANT_ERROR_BUFFER: usize = 10;

// =============================================================================
// Watcher Constants
// =============================================================================

/// Per-path debounce window for filesystem events.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Sanity cap on auto-added watch directories.
pub const MAX_WATCHED_DIRS: usize = 256;

/// Capacity of the debounced file-event channel.
pub const FILE_EVENT_BUFFER: usize = 100;

// =============================================================================
// Recovery Constants
// =============================================================================

/// Per-kind recovery attempts before giving up.
pub const RECOVERY_MAX_RETRIES: u32 = 3;

/// Base delay for recovery backoff.
pub const RECOVERY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap on recovery backoff.
pub const RECOVERY_MAX_DELAY: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limits_are_consistent() {
        assert!(MIN_COMPRESS_SIZE < MAX_FRAME_SIZE);
        assert_eq!(FRAME_HEADER_LEN, 1 + 4);
    }

    #[test]
    fn flags_do_not_overlap() {
        assert_eq!(FLAG_COMPRESSED & FLAG_BATCH, 0);
    }

    #[test]
    fn timing_constants_are_ordered() {
        assert!(RETRY_SCAN_INTERVAL < RETRY_TIMEOUT);
        assert!(PING_INTERVAL < READ_TIMEOUT);
        assert!(CLEANUP_INTERVAL < TERMINAL_IDLE_TIMEOUT);
        assert!(RECOVERY_BASE_DELAY < RECOVERY_MAX_DELAY);
    }
}
