//! Binary frame codec.
//!
//! Format: `[1 byte flags][4 bytes big-endian length][payload]`
//!
//! - flag bit 0: payload is zstd-compressed
//! - flag bit 1: payload is a batch (a bincode `Vec<Message>`)
//!
//! Single messages are compressed only when the payload exceeds 1 KiB and
//! compression saves at least 10%. Batches are always compressed. Batch
//! payloads carry messages, never frames, so batches cannot nest.
//!
//! The codec owns only its compression level; callers are expected to
//! serialize writes on the underlying transport.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{
    COMPRESSION_LEVEL, FLAG_BATCH, FLAG_COMPRESSED, FRAME_HEADER_LEN, MAX_FRAME_SIZE,
    MIN_COMPRESS_SIZE,
};
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A single message.
    Message(Message),
    /// An unpacked batch, in wire order.
    Batch(Vec<Message>),
}

/// Codec for length-prefixed, optionally compressed frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    level: i32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default compression level.
    pub fn new() -> Self {
        Self {
            level: COMPRESSION_LEVEL,
        }
    }

    /// Encode a single message to a wire frame.
    pub fn encode(&self, msg: &Message) -> Result<Bytes> {
        let raw = bincode::serialize(msg).map_err(|e| Error::Codec {
            message: format!("serialization failed: {}", e),
        })?;

        let mut flags = 0u8;
        let mut payload = raw;

        // Compress only when it pays: payload over the threshold and the
        // compressed form at least 10% smaller.
        if payload.len() > MIN_COMPRESS_SIZE {
            let compressed = self.compress(&payload)?;
            if compressed.len() * 10 <= payload.len() * 9 {
                flags |= FLAG_COMPRESSED;
                payload = compressed;
            }
        }

        self.frame(flags, &payload)
    }

    /// Encode a batch of messages into a single frame.
    ///
    /// Batches are always compressed. An empty batch is a codec error.
    pub fn encode_batch(&self, msgs: &[Message]) -> Result<Bytes> {
        if msgs.is_empty() {
            return Err(Error::Codec {
                message: "refusing to encode an empty batch".into(),
            });
        }

        let raw = bincode::serialize(&msgs).map_err(|e| Error::Codec {
            message: format!("batch serialization failed: {}", e),
        })?;
        let payload = self.compress(&raw)?;

        self.frame(FLAG_BATCH | FLAG_COMPRESSED, &payload)
    }

    /// Decode one complete frame.
    ///
    /// Fails with `FrameTooLarge` when the declared length exceeds 1 MiB and
    /// `ShortRead` when the buffer ends mid-frame.
    pub fn decode(&self, data: &[u8]) -> Result<Decoded> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(Error::ShortRead {
                expected: FRAME_HEADER_LEN,
                got: data.len(),
            });
        }

        let flags = data[0];
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge { size: len });
        }

        if data.len() < FRAME_HEADER_LEN + len {
            return Err(Error::ShortRead {
                expected: FRAME_HEADER_LEN + len,
                got: data.len(),
            });
        }

        let payload = &data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        let raw = if flags & FLAG_COMPRESSED != 0 {
            self.decompress(payload)?
        } else {
            payload.to_vec()
        };

        if flags & FLAG_BATCH != 0 {
            let msgs: Vec<Message> = bincode::deserialize(&raw).map_err(|e| Error::Codec {
                message: format!("batch deserialization failed: {}", e),
            })?;
            Ok(Decoded::Batch(msgs))
        } else {
            let msg: Message = bincode::deserialize(&raw).map_err(|e| Error::Codec {
                message: format!("deserialization failed: {}", e),
            })?;
            Ok(Decoded::Message(msg))
        }
    }

    fn frame(&self, flags: u8, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u8(flags);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| Error::Codec {
            message: format!("compression failed: {}", e),
        })
    }

    /// Decompress with the frame limit enforced on the output side, so a
    /// small frame cannot expand into an oversized message.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = zstd::Decoder::new(data).map_err(|e| Error::Codec {
            message: format!("failed to create decompressor: {}", e),
        })?;

        let mut output = Vec::new();
        let mut buf = [0u8; 8192];

        loop {
            let n = decoder.read(&mut buf).map_err(|e| Error::Codec {
                message: format!("decompression failed: {}", e),
            })?;
            if n == 0 {
                break;
            }
            if output.len() + n > MAX_FRAME_SIZE {
                return Err(Error::FrameTooLarge {
                    size: output.len() + n,
                });
            }
            output.extend_from_slice(&buf[..n]);
        }

        Ok(output)
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::protocol::{Body, ChatPayload};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encode_decode_is_identity(content in ".{0,2048}", seq in 0u64..u64::MAX) {
            let codec = FrameCodec::new();
            let mut msg = Message::new(Body::Chat(ChatPayload {
                role: "user".into(),
                content,
                files: None,
                metadata: None,
            }));
            msg.seq = seq;

            let frame = codec.encode(&msg).unwrap();
            let Decoded::Message(back) = codec.decode(&frame).unwrap() else {
                panic!("expected single message");
            };
            prop_assert_eq!(back, msg);
        }
    }
}
