//! # Core Wire Components
//!
//! Low-level chunk handling, framing codec, and body serialization.
//!
//! This module provides the foundation for the protocol, handling chunk
//! framing, the secure-conversation header, and the opaque body encoding.
//!
//! ## Components
//! - **Chunk**: UACP/UASC chunk format with message-kind magic and
//!   chunk-final flags
//! - **Codec**: Tokio codec for framing chunks over byte streams
//! - **Body**: serde/bincode boundary for message payloads
//!
//! ## Wire Format
//! ```text
//! [Magic(3)] [Flag(1)] [Size(4, LE)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Declared chunk size validated against the negotiated receive buffer
//!   before any allocation
//! - A strict pre-handshake size ceiling bounds hostile Hello chunks

pub mod body;
pub mod chunk;
pub mod codec;
