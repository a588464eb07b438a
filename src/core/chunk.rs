//! UACP/UASC chunk wire format.
//!
//! Every unit on the wire is a chunk with an 8-byte header:
//!
//! ```text
//! [MessageKind(3)] [ChunkFlag(1)] [Size(4, LE)] [Body(N)]
//! ```
//!
//! Secure-conversation chunks (`OPN`/`CLO`/`MSG`) additionally carry a
//! 16-byte secure header at the start of the body:
//!
//! ```text
//! [ChannelId(4, LE)] [TokenId(4, LE)] [SequenceNumber(4, LE)] [RequestId(4, LE)]
//! ```
//!
//! All integers are little-endian, per the OPC UA binary encoding. `Size` is
//! the total chunk size including the 8-byte header, which lets a reader
//! frame chunks without understanding their contents.

use crate::error::{Result, UaError};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the fixed chunk header.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Size of the secure-conversation header that follows the chunk header.
pub const SECURE_HEADER_SIZE: usize = 16;

/// Sequence numbers wrap to 1 after this value, per OPC UA part 6.
pub const SEQUENCE_WRAP: u32 = u32::MAX - 1024;

/// Kind of a chunk, identified by its 3-byte magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Transport handshake request
    Hello,
    /// Transport handshake response
    Acknowledge,
    /// Fatal error notification, last chunk before close
    Error,
    /// OpenSecureChannel exchange (issue or renew)
    OpenChannel,
    /// CloseSecureChannel request
    CloseChannel,
    /// Secured application message
    Message,
}

impl MessageKind {
    pub const fn magic(self) -> [u8; 3] {
        match self {
            MessageKind::Hello => *b"HEL",
            MessageKind::Acknowledge => *b"ACK",
            MessageKind::Error => *b"ERR",
            MessageKind::OpenChannel => *b"OPN",
            MessageKind::CloseChannel => *b"CLO",
            MessageKind::Message => *b"MSG",
        }
    }

    pub fn from_magic(magic: [u8; 3]) -> Result<Self> {
        match &magic {
            b"HEL" => Ok(MessageKind::Hello),
            b"ACK" => Ok(MessageKind::Acknowledge),
            b"ERR" => Ok(MessageKind::Error),
            b"OPN" => Ok(MessageKind::OpenChannel),
            b"CLO" => Ok(MessageKind::CloseChannel),
            b"MSG" => Ok(MessageKind::Message),
            _ => Err(UaError::InvalidHeader),
        }
    }

    /// Whether chunks of this kind carry a secure-conversation header.
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            MessageKind::OpenChannel | MessageKind::CloseChannel | MessageKind::Message
        )
    }
}

/// Position of a chunk within its logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFlag {
    /// More chunks of the same message follow
    Intermediate,
    /// Last chunk of the message
    Final,
    /// Sender aborted the message; discard accumulated chunks
    Abort,
}

impl ChunkFlag {
    pub const fn as_byte(self) -> u8 {
        match self {
            ChunkFlag::Intermediate => b'C',
            ChunkFlag::Final => b'F',
            ChunkFlag::Abort => b'A',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'C' => Ok(ChunkFlag::Intermediate),
            b'F' => Ok(ChunkFlag::Final),
            b'A' => Ok(ChunkFlag::Abort),
            _ => Err(UaError::InvalidHeader),
        }
    }
}

/// Secure-conversation header carried by `OPN`/`CLO`/`MSG` chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecureHeader {
    /// Channel the chunk belongs to; stable for the channel's life
    pub channel_id: u32,
    /// Security token the body was secured under
    pub token_id: u32,
    /// Per-direction monotonic sequence number
    pub sequence_number: u32,
    /// Correlates a response with its originating request
    pub request_id: u32,
}

impl SecureHeader {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.channel_id);
        buf.put_u32_le(self.token_id);
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < SECURE_HEADER_SIZE {
            return Err(UaError::InvalidHeader);
        }
        Ok(Self {
            channel_id: buf.get_u32_le(),
            token_id: buf.get_u32_le(),
            sequence_number: buf.get_u32_le(),
            request_id: buf.get_u32_le(),
        })
    }
}

/// One framed chunk as read off or written to the stream.
///
/// For secure kinds, `payload` still contains the secure header followed by
/// the (possibly encrypted) body; `SecureChannel` peels it apart. For
/// handshake kinds the payload is the Hello/Acknowledge/Error body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageKind,
    pub flag: ChunkFlag,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Frame for a handshake-level body.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            flag: ChunkFlag::Final,
            payload,
        }
    }

    /// Secure frame: secure header followed by the secured body.
    pub fn secure(kind: MessageKind, flag: ChunkFlag, header: SecureHeader, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(SECURE_HEADER_SIZE + body.len());
        header.write_to(&mut payload);
        payload.extend_from_slice(body);
        Self {
            kind,
            flag,
            payload: payload.to_vec(),
        }
    }

    /// Split a secure frame's payload into its header and body.
    pub fn split_secure(&self) -> Result<(SecureHeader, &[u8])> {
        if !self.kind.is_secure() {
            return Err(UaError::InvalidHeader);
        }
        let mut slice = &self.payload[..];
        let header = SecureHeader::read_from(&mut slice)?;
        Ok((header, slice))
    }

    /// Total on-wire size of this chunk including the fixed header.
    pub fn wire_size(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }
}

/// Body of an `ERR` chunk: status code plus a length-prefixed reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: u32,
    pub reason: String,
}

impl ErrorBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.reason.len());
        buf.put_u32_le(self.code);
        put_string(&mut buf, &self.reason);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(UaError::InvalidHeader);
        }
        let code = data.get_u32_le();
        let reason = get_string(&mut data)?;
        Ok(Self { code, reason })
    }
}

/// Write a UA length-prefixed UTF-8 string (LE u32 length, no terminator).
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Read a UA length-prefixed UTF-8 string.
pub fn get_string(buf: &mut impl Buf) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(UaError::InvalidHeader);
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(UaError::InvalidHeader);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| UaError::InvalidHeader)
}

/// Next sequence number after `current`, handling the defined wrap point.
pub fn next_sequence(current: u32) -> u32 {
    if current >= SEQUENCE_WRAP {
        1
    } else {
        current + 1
    }
}
