//! UACP transport handshake.
//!
//! Before any secure-conversation traffic, the two peers exchange a
//! `HEL`/`ACK` pair advertising their transport limits. Either side may
//! reduce the other's proposal: the effective limit for every field is the
//! minimum of the two proposals, and neither side may exceed it afterwards.
//!
//! The handshake bodies are fixed-layout little-endian structures, not
//! bincode, because they are wire-level UACP and must be readable before any
//! codec context exists.

use crate::config::PROTOCOL_VERSION;
use crate::core::chunk::{self, Frame, MessageKind};
use crate::error::{Result, UaError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Transport limits proposed by one side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParams {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            receive_buffer_size: crate::config::DEFAULT_RECEIVE_BUFFER_SIZE,
            send_buffer_size: crate::config::DEFAULT_SEND_BUFFER_SIZE,
            max_message_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            max_chunk_count: crate::config::DEFAULT_MAX_CHUNK_COUNT,
        }
    }
}

impl TransportParams {
    pub fn from_config(cfg: &crate::config::TransportConfig) -> Self {
        Self {
            receive_buffer_size: cfg.receive_buffer_size,
            send_buffer_size: cfg.send_buffer_size,
            max_message_size: cfg.max_message_size,
            max_chunk_count: cfg.max_chunk_count,
        }
    }

    /// Field-wise minimum of the two proposals.
    ///
    /// Buffer sizes cross over: what the peer can receive bounds what we may
    /// send, so our `send_buffer_size` is clamped by their
    /// `receive_buffer_size` and vice versa.
    pub fn negotiate(&self, peer: &TransportParams) -> TransportParams {
        TransportParams {
            receive_buffer_size: self.receive_buffer_size.min(peer.send_buffer_size),
            send_buffer_size: self.send_buffer_size.min(peer.receive_buffer_size),
            max_message_size: self.max_message_size.min(peer.max_message_size),
            max_chunk_count: self.max_chunk_count.min(peer.max_chunk_count),
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.receive_buffer_size);
        buf.put_u32_le(self.send_buffer_size);
        buf.put_u32_le(self.max_message_size);
        buf.put_u32_le(self.max_chunk_count);
    }

    fn read_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 16 {
            return Err(UaError::InvalidHeader);
        }
        Ok(Self {
            receive_buffer_size: buf.get_u32_le(),
            send_buffer_size: buf.get_u32_le(),
            max_message_size: buf.get_u32_le(),
            max_chunk_count: buf.get_u32_le(),
        })
    }
}

/// Body of a `HEL` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub params: TransportParams,
    pub endpoint_url: String,
}

impl Hello {
    pub fn new(params: TransportParams, endpoint_url: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            params,
            endpoint_url: endpoint_url.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(24 + self.endpoint_url.len());
        buf.put_u32_le(self.protocol_version);
        self.params.write_to(&mut buf);
        chunk::put_string(&mut buf, &self.endpoint_url);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(UaError::InvalidHeader);
        }
        let protocol_version = data.get_u32_le();
        let params = TransportParams::read_from(&mut data)?;
        let endpoint_url = chunk::get_string(&mut data)?;
        Ok(Self {
            protocol_version,
            params,
            endpoint_url,
        })
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(MessageKind::Hello, self.encode())
    }
}

/// Body of an `ACK` chunk. Carries the values the server has granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub protocol_version: u32,
    pub params: TransportParams,
}

impl Acknowledge {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u32_le(self.protocol_version);
        self.params.write_to(&mut buf);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(UaError::InvalidHeader);
        }
        let protocol_version = data.get_u32_le();
        let params = TransportParams::read_from(&mut data)?;
        Ok(Self {
            protocol_version,
            params,
        })
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(MessageKind::Acknowledge, self.encode())
    }
}

/// Server side of the handshake: validate a received Hello and produce the
/// Acknowledge plus the effective negotiated limits.
///
/// The endpoint URL in the Hello is advisory; a mismatch is logged but does
/// not reject the connection.
pub fn accept_hello(
    hello: &Hello,
    local: &TransportParams,
    local_endpoint: &str,
) -> Result<(Acknowledge, TransportParams)> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(UaError::UnsupportedVersion(hello.protocol_version));
    }

    if hello.endpoint_url != local_endpoint {
        debug!(
            requested = %hello.endpoint_url,
            serving = %local_endpoint,
            "peer requested a different endpoint URL"
        );
    }

    let negotiated = local.negotiate(&hello.params);
    // The Acknowledge is written from the server's point of view; the peer
    // applies it with buffer sizes swapped back.
    let ack = Acknowledge {
        protocol_version: PROTOCOL_VERSION,
        params: negotiated,
    };
    Ok((ack, negotiated))
}

/// Client side: fold the server's Acknowledge into effective limits.
pub fn accept_acknowledge(ack: &Acknowledge, local: &TransportParams) -> Result<TransportParams> {
    if ack.protocol_version != PROTOCOL_VERSION {
        return Err(UaError::UnsupportedVersion(ack.protocol_version));
    }
    // The server already took the minimum; folding our own proposal in again
    // keeps the result within both sides' limits even against a sloppy peer.
    Ok(TransportParams {
        receive_buffer_size: local.receive_buffer_size.min(ack.params.send_buffer_size),
        send_buffer_size: local.send_buffer_size.min(ack.params.receive_buffer_size),
        max_message_size: local.max_message_size.min(ack.params.max_message_size),
        max_chunk_count: local.max_chunk_count.min(ack.params.max_chunk_count),
    })
}
