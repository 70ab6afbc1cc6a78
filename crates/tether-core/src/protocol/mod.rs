//! Wire protocol for the tether gateway.
//!
//! One canonical message model ([`Message`]) rendered to two encodings:
//! JSON for WebSocket text frames, bincode inside a length-prefixed frame
//! for binary ([`codec::FrameCodec`]).

pub mod codec;
pub mod message;

pub use codec::{Decoded, FrameCodec};
pub use message::{
    AckPayload, Body, ChatErrorPayload, ChatPayload, ChatReplyPayload, ChatStreamPayload,
    FilePayload, GitQueryPayload, Message, PingPayload, ReconnectPayload, SessionEndPayload,
    SessionStartPayload, TerminalClosePayload, TerminalCreatePayload, TerminalCreatedPayload,
    TerminalErrorPayload, TerminalInputPayload, TerminalListPayload, TerminalOutputPayload,
    TerminalResizePayload, UnknownPayload,
};
