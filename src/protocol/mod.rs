//! # Protocol Layer
//!
//! Transport handshake, decoded message types, and the handler contract.
//!
//! ## Components
//! - **Handshake**: UACP Hello/Acknowledge exchange with per-field minimum
//!   negotiation of transport limits
//! - **Message**: closed sum type over the supported request/response kinds,
//!   with an explicit `Unsupported` variant
//! - **Dispatcher**: `Handler` trait, `Request`, and the write-once
//!   `ResponseWriter`

pub mod dispatcher;
pub mod handshake;
pub mod message;
