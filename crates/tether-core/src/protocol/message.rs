//! Canonical message model.
//!
//! Every frame on the wire carries one [`Message`]: a small envelope (id,
//! sequence number, timestamp, delivery flags) plus a kind-tagged [`Body`].
//! The body is adjacently tagged so the JSON rendering exposes the wire
//! constants (`"type"`, `"payload"`) while bincode round-trips the same
//! structure for binary frames. Option fields are always serialized; skipping
//! them would break positional decoding.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport unit. Envelope fields plus a kind-tagged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier, unique within a session.
    pub id: String,
    /// Sender-assigned sequence number; 0 until the queue assigns one.
    #[serde(default)]
    pub seq: u64,
    /// Milliseconds since the Unix epoch at creation time.
    #[serde(default)]
    pub timestamp_ms: u64,
    /// Sender expects an explicit ack.
    #[serde(default)]
    pub requires_ack: bool,
    /// Resend attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Correlates replies with the request that caused them.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Kind tag and payload.
    pub body: Body,
}

/// Message kinds and their payloads.
///
/// Tag strings are the wire constants. `file_*` and `git_*` kinds are
/// reserved: the model carries them but the gateway does not route them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Body {
    Chat(ChatPayload),
    ChatReply(ChatReplyPayload),
    ChatStream(ChatStreamPayload),
    ChatError(ChatErrorPayload),
    TerminalCreate(TerminalCreatePayload),
    TerminalCreated(TerminalCreatedPayload),
    TerminalInput(TerminalInputPayload),
    TerminalOutput(TerminalOutputPayload),
    TerminalResize(TerminalResizePayload),
    TerminalClose(TerminalClosePayload),
    TerminalError(TerminalErrorPayload),
    TerminalList(TerminalListPayload),
    FileOpen(FilePayload),
    FileSave(FilePayload),
    FileClose(FilePayload),
    FileChanged(FilePayload),
    FileSync(FilePayload),
    GitStatus(GitQueryPayload),
    GitDiff(GitQueryPayload),
    Ping(PingPayload),
    Pong(PingPayload),
    Ack(AckPayload),
    Reconnect(ReconnectPayload),
    SessionStart(SessionStartPayload),
    SessionEnd(SessionEndPayload),
    Unknown(UnknownPayload),
}

impl Body {
    /// Wire constant for this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Chat(_) => "chat",
            Body::ChatReply(_) => "chat_reply",
            Body::ChatStream(_) => "chat_stream",
            Body::ChatError(_) => "chat_error",
            Body::TerminalCreate(_) => "terminal_create",
            Body::TerminalCreated(_) => "terminal_created",
            Body::TerminalInput(_) => "terminal_input",
            Body::TerminalOutput(_) => "terminal_output",
            Body::TerminalResize(_) => "terminal_resize",
            Body::TerminalClose(_) => "terminal_close",
            Body::TerminalError(_) => "terminal_error",
            Body::TerminalList(_) => "terminal_list",
            Body::FileOpen(_) => "file_open",
            Body::FileSave(_) => "file_save",
            Body::FileClose(_) => "file_close",
            Body::FileChanged(_) => "file_changed",
            Body::FileSync(_) => "file_sync",
            Body::GitStatus(_) => "git_status",
            Body::GitDiff(_) => "git_diff",
            Body::Ping(_) => "ping",
            Body::Pong(_) => "pong",
            Body::Ack(_) => "ack",
            Body::Reconnect(_) => "reconnect",
            Body::SessionStart(_) => "session_start",
            Body::SessionEnd(_) => "session_end",
            Body::Unknown(_) => "unknown",
        }
    }
}

impl Message {
    /// Create a message with a fresh id and current timestamp.
    pub fn new(body: Body) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq: 0,
            timestamp_ms: now_ms(),
            requires_ack: false,
            retry_count: 0,
            correlation_id: None,
            body,
        }
    }

    /// Create a reply correlated with a request id.
    pub fn reply_to(body: Body, request_id: &str) -> Self {
        let mut msg = Self::new(body);
        msg.correlation_id = Some(request_id.to_string());
        msg
    }

    /// Wire constant for this message's kind.
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Render to a JSON text frame.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Codec {
            message: format!("json encode failed: {}", e),
        })
    }

    /// Parse a JSON text frame.
    ///
    /// Unrecognized kinds degrade to [`Body::Unknown`] so newer clients don't
    /// tear down older gateways; anything without a valid envelope is a codec
    /// error.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        match serde_json::from_str::<Message>(text) {
            Ok(msg) => Ok(msg),
            Err(strict) => {
                #[derive(Deserialize)]
                struct Envelope {
                    id: String,
                    #[serde(default)]
                    seq: u64,
                    #[serde(default)]
                    timestamp_ms: u64,
                    #[serde(default)]
                    requires_ack: bool,
                    #[serde(default)]
                    retry_count: u32,
                    #[serde(default)]
                    correlation_id: Option<String>,
                }

                let env: Envelope =
                    serde_json::from_str(text).map_err(|_| crate::Error::Codec {
                        message: format!("json decode failed: {}", strict),
                    })?;

                Ok(Message {
                    id: env.id,
                    seq: env.seq,
                    timestamp_ms: env.timestamp_ms,
                    requires_ack: env.requires_ack,
                    retry_count: env.retry_count,
                    correlation_id: env.correlation_id,
                    body: Body::Unknown(UnknownPayload::default()),
                })
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Payloads
// =============================================================================

/// Client chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// Complete (non-streamed) chat reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReplyPayload {
    pub content: String,
    pub finished: bool,
}

/// One streamed chunk of a chat reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatStreamPayload {
    pub content: String,
    pub finished: bool,
    #[serde(default)]
    pub tokens: Option<u32>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub file_edits: Option<Vec<String>>,
}

/// Chat failure, classified for the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatErrorPayload {
    pub message: String,
    pub code: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: Option<HashMap<String, String>>,
}

/// Terminal creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalCreatePayload {
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
}

/// Server-minted terminal id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalCreatedPayload {
    pub terminal_id: String,
}

/// Raw input bytes for a terminal, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalInputPayload {
    pub terminal_id: String,
    pub data: String,
}

/// Raw output bytes from a terminal, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalOutputPayload {
    pub terminal_id: String,
    pub data: String,
}

/// Terminal window-size change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalResizePayload {
    pub terminal_id: String,
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub width_px: Option<u16>,
    #[serde(default)]
    pub height_px: Option<u16>,
}

/// Terminal close request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalClosePayload {
    pub terminal_id: String,
}

/// Terminal operation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalErrorPayload {
    #[serde(default)]
    pub terminal_id: Option<String>,
    pub message: String,
}

/// Terminal listing; empty on request, populated on reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalListPayload {
    #[serde(default)]
    pub terminals: Vec<String>,
}

/// Reserved file-operation payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Reserved git-query payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitQueryPayload {
    #[serde(default)]
    pub path: Option<String>,
}

/// Keepalive payload, shared by ping and pong.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    #[serde(default)]
    pub metrics: Option<HashMap<String, f64>>,
}

/// Delivery acknowledgment.
///
/// `seq_num` is carried for wire compatibility; the gateway keys in-flight
/// tracking by message id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: String,
    #[serde(default)]
    pub seq_num: Option<u64>,
    pub success: bool,
}

/// Session resumption request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPayload {
    pub session_id: String,
    pub last_seq_num: u64,
}

/// Announces the server-minted session id after upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStartPayload {
    pub session_id: String,
}

/// Graceful session end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEndPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Placeholder body for unrecognized kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnknownPayload {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_id_and_timestamp() {
        let msg = Message::new(Body::Ping(PingPayload::default()));
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp_ms > 0);
        assert_eq!(msg.seq, 0);
        assert_eq!(msg.kind(), "ping");
    }

    #[test]
    fn reply_carries_correlation_id() {
        let msg = Message::reply_to(
            Body::Pong(PingPayload::default()),
            "req-1",
        );
        assert_eq!(msg.correlation_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn json_roundtrip_chat() {
        let msg = Message::new(Body::Chat(ChatPayload {
            role: "user".into(),
            content: "fix the tests".into(),
            files: Some(vec!["src/lib.rs".into()]),
            metadata: None,
        }));

        let text = msg.to_json().unwrap();
        let back = Message::from_json(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn json_uses_wire_kind_constants() {
        let msg = Message::new(Body::TerminalInput(TerminalInputPayload {
            terminal_id: "t1".into(),
            data: "aGkK".into(),
        }));

        let text = msg.to_json().unwrap();
        assert!(text.contains(r#""type":"terminal_input""#));
        assert!(text.contains(r#""terminal_id":"t1""#));
    }

    #[test]
    fn unknown_kind_degrades_gracefully() {
        let text = r#"{"id":"m9","body":{"type":"hologram_sync","payload":{"x":1}}}"#;
        let msg = Message::from_json(text).unwrap();
        assert_eq!(msg.id, "m9");
        assert!(matches!(msg.body, Body::Unknown(_)));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(Message::from_json("not json").is_err());
        assert!(Message::from_json(r#"{"no_id":true}"#).is_err());
    }

    #[test]
    fn ack_seq_num_is_optional() {
        let text = r#"{"id":"a1","body":{"type":"ack","payload":{"message_id":"m1","success":true}}}"#;
        let msg = Message::from_json(text).unwrap();
        match msg.body {
            Body::Ack(ack) => {
                assert_eq!(ack.message_id, "m1");
                assert_eq!(ack.seq_num, None);
                assert!(ack.success);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn every_kind_has_a_wire_constant() {
        let bodies = [
            Body::Chat(ChatPayload {
                role: "user".into(),
                content: String::new(),
                files: None,
                metadata: None,
            }),
            Body::TerminalList(TerminalListPayload::default()),
            Body::GitStatus(GitQueryPayload::default()),
            Body::FileChanged(FilePayload::default()),
            Body::Unknown(UnknownPayload::default()),
        ];

        for body in bodies {
            assert!(!body.kind().is_empty());
            assert!(!body.kind().contains(char::is_uppercase));
        }
    }
}
