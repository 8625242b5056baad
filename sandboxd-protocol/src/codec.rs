//! Frame codec for stream transports
//!
//! Wire layout: one opcode byte (WebSocket numbering: 0x1 text, 0x2 binary),
//! a big-endian u32 payload length, then the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;

/// Maximum frame payload (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const HEADER_LEN: usize = 5;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown frame opcode: {0:#x}")]
    UnknownOpcode(u8),

    #[error("Text frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Codec used by both ends of a PTY stream
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the header without consuming
        let opcode = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if opcode != OPCODE_TEXT && opcode != OPCODE_BINARY {
            return Err(CodecError::UnknownOpcode(opcode));
        }

        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        let frame = if opcode == OPCODE_TEXT {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
            Frame::Text(text)
        } else {
            Frame::Binary(payload)
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (opcode, payload): (u8, Bytes) = match item {
            Frame::Text(text) => (OPCODE_TEXT, Bytes::from(text)),
            Frame::Binary(data) => (OPCODE_BINARY, data),
        };

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(opcode);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
