//! # Error Types
//!
//! Comprehensive error handling for the OPC UA server core.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level I/O errors to secure-channel violations.
//!
//! ## Error Categories
//! - **Transport errors**: connect/accept failures, handshake mismatches,
//!   read/write failures on the underlying stream
//! - **Protocol errors**: malformed chunks, sequence-number violations,
//!   messages exceeding negotiated limits
//! - **Security errors**: policy mismatch during channel-open,
//!   decryption/verification failure on receive
//! - **Dispatch errors**: unrecognized message types (non-fatal)
//! - **Cancellation**: a distinct, expected outcome that unwinds blocking
//!   calls cleanly and is never logged as an anomaly
//!
//! Errors local to one connection never propagate to the accept loop or to
//! other connections. Only listener-level errors escape `listen_and_serve`.

use std::io;
use thiserror::Error;

/// OPC UA TCP status codes carried in `ERR` chunks.
///
/// These are the wire values defined by the OPC UA specification; only the
/// subset this core can actually produce is listed.
pub mod status {
    pub const BAD_TCP_MESSAGE_TYPE_INVALID: u32 = 0x807E_0000;
    pub const BAD_TCP_MESSAGE_TOO_LARGE: u32 = 0x8080_0000;
    pub const BAD_TCP_ENDPOINT_URL_INVALID: u32 = 0x8083_0000;
    pub const BAD_TCP_INTERNAL_ERROR: u32 = 0x8082_0000;
    pub const BAD_SEQUENCE_NUMBER_INVALID: u32 = 0x807A_0000;
    pub const BAD_SECURE_CHANNEL_ID_INVALID: u32 = 0x8022_0000;
    pub const BAD_SECURITY_CHECKS_FAILED: u32 = 0x8013_0000;
    pub const BAD_SECURITY_POLICY_REJECTED: u32 = 0x8055_0000;
    pub const BAD_PROTOCOL_VERSION_UNSUPPORTED: u32 = 0x80BE_0000;
    pub const BAD_SECURE_CHANNEL_CLOSED: u32 = 0x8086_0000;
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum UaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// Clean peer-initiated secure-channel close.
    #[error("secure channel closed")]
    ChannelClosed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid chunk header")]
    InvalidHeader,

    #[error("message of {size} bytes exceeds negotiated maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: u32 },

    #[error("message spans more than {0} chunks")]
    TooManyChunks(u32),

    #[error("sequence number violation: expected {expected}, got {got}")]
    SequenceViolation { expected: u32, got: u32 },

    #[error("chunk addressed to unknown secure channel {0}")]
    UnknownChannel(u32),

    #[error("security token {0} is not valid for this channel")]
    InvalidToken(u32),

    #[error("security error: {0}")]
    Security(String),

    #[error("unexpected message type")]
    UnexpectedMessage,

    #[error("a response was already sent for this request")]
    ResponseAlreadySent,

    #[error("operation timed out")]
    Timeout,

    /// Context cancellation. Expected during shutdown.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid endpoint URL: {0}")]
    BadEndpointUrl(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Error reported by the peer in an `ERR` chunk.
    #[error("peer error 0x{code:08X}: {reason}")]
    PeerError { code: u32, reason: String },
}

impl UaError {
    /// Status code to report to the peer in an `ERR` chunk before the
    /// channel is torn down.
    pub fn status_code(&self) -> u32 {
        use status::*;
        match self {
            UaError::MessageTooLarge { .. } | UaError::TooManyChunks(_) => {
                BAD_TCP_MESSAGE_TOO_LARGE
            }
            UaError::SequenceViolation { .. } => BAD_SEQUENCE_NUMBER_INVALID,
            UaError::UnknownChannel(_) => BAD_SECURE_CHANNEL_ID_INVALID,
            UaError::InvalidToken(_) | UaError::Security(_) => BAD_SECURITY_CHECKS_FAILED,
            UaError::UnsupportedVersion(_) => BAD_PROTOCOL_VERSION_UNSUPPORTED,
            UaError::InvalidHeader | UaError::UnexpectedMessage => BAD_TCP_MESSAGE_TYPE_INVALID,
            UaError::BadEndpointUrl(_) => BAD_TCP_ENDPOINT_URL_INVALID,
            UaError::ChannelClosed => BAD_SECURE_CHANNEL_CLOSED,
            _ => BAD_TCP_INTERNAL_ERROR,
        }
    }

    /// Whether this error is an expected shutdown path rather than a fault.
    pub fn is_clean_shutdown(&self) -> bool {
        matches!(
            self,
            UaError::Cancelled | UaError::ChannelClosed | UaError::ConnectionClosed
        )
    }
}

/// Type alias for Results using UaError
pub type Result<T> = std::result::Result<T, UaError>;
