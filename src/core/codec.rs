//! Tokio codec framing chunks off a byte stream.
//!
//! The decoder validates only what the frame layer can know: a recognized
//! 3-byte magic, a valid chunk flag, and a declared size within the local
//! receive limit. Everything inside the payload is the concern of the
//! handshake and secure-channel layers.

use crate::core::chunk::{ChunkFlag, Frame, MessageKind, CHUNK_HEADER_SIZE};
use crate::error::UaError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard ceiling applied before the transport handshake has negotiated real
/// limits. Prevents a hostile Hello from forcing a huge allocation.
pub const PRE_HANDSHAKE_CHUNK_LIMIT: u32 = 8 * 1024;

/// Framing codec for UACP/UASC chunks.
#[derive(Debug)]
pub struct ChunkCodec {
    /// Largest chunk this side is willing to receive, including the header.
    max_chunk_size: u32,
}

impl ChunkCodec {
    /// Codec restricted to the pre-handshake limit. Call
    /// [`set_max_chunk_size`](Self::set_max_chunk_size) once the handshake
    /// has negotiated the real receive buffer size.
    pub fn new() -> Self {
        Self {
            max_chunk_size: PRE_HANDSHAKE_CHUNK_LIMIT,
        }
    }

    pub fn set_max_chunk_size(&mut self, size: u32) {
        self.max_chunk_size = size;
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkCodec {
    type Item = Frame;
    type Error = UaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, UaError> {
        if src.len() < CHUNK_HEADER_SIZE {
            return Ok(None);
        }

        let kind = MessageKind::from_magic([src[0], src[1], src[2]])?;
        let flag = ChunkFlag::from_byte(src[3])?;
        let size = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);

        if (size as usize) < CHUNK_HEADER_SIZE {
            return Err(UaError::InvalidHeader);
        }
        if size > self.max_chunk_size {
            return Err(UaError::MessageTooLarge {
                size: size as usize,
                max: self.max_chunk_size,
            });
        }

        if src.len() < size as usize {
            // Reserve up front so subsequent reads land in one buffer.
            src.reserve(size as usize - src.len());
            return Ok(None);
        }

        src.advance(CHUNK_HEADER_SIZE);
        let payload = src.split_to(size as usize - CHUNK_HEADER_SIZE).to_vec();

        Ok(Some(Frame {
            kind,
            flag,
            payload,
        }))
    }
}

impl Encoder<Frame> for ChunkCodec {
    type Error = UaError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), UaError> {
        let size = frame.wire_size();
        if size > u32::MAX as usize {
            return Err(UaError::MessageTooLarge {
                size,
                max: u32::MAX,
            });
        }

        dst.reserve(size);
        dst.put_slice(&frame.kind.magic());
        dst.put_u8(frame.flag.as_byte());
        dst.put_u32_le(size as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunk::SecureHeader;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = ChunkCodec::new();
        codec.set_max_chunk_size(1 << 20);
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::secure(
            MessageKind::Message,
            ChunkFlag::Intermediate,
            SecureHeader {
                channel_id: 9,
                token_id: 1,
                sequence_number: 2,
                request_id: 5,
            },
            &[0xAB; 100],
        );
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded.kind, frame.kind);
        assert_eq!(decoded.flag, frame.flag);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn partial_header_yields_none() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::from(&b"MSGF\x20"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_body_yields_none_then_frame() {
        let mut codec = ChunkCodec::new();
        let frame = Frame::new(MessageKind::Hello, vec![1, 2, 3, 4]);
        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire).unwrap();

        let mut buf = BytesMut::from(&wire[..wire.len() - 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[wire.len() - 2..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_magic_rejected() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::from(&b"QQQF\x0C\x00\x00\x00abcd"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(UaError::InvalidHeader)
        ));
    }

    #[test]
    fn declared_size_over_limit_rejected() {
        let mut codec = ChunkCodec::new();
        codec.set_max_chunk_size(64);
        let mut buf = BytesMut::new();
        buf.put_slice(b"MSGF");
        buf.put_u32_le(1_000_000);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(UaError::MessageTooLarge { size: 1_000_000, .. })
        ));
    }

    #[test]
    fn declared_size_below_header_rejected() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(b"MSGF");
        buf.put_u32_le(4);
        buf.put_slice(&[0u8; 8]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(UaError::InvalidHeader)
        ));
    }
}
