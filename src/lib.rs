//! # opcua-protocol
//!
//! Async OPC UA server protocol core for Rust services.
//!
//! This crate implements the layered handshake an OPC UA server must drive
//! before any application request can be served: the UACP transport
//! handshake (capability negotiation), the UASC secure conversation
//! (chunking, sequencing, security-token lifecycle), and the request
//! dispatch loop that hands decoded messages to a pluggable [`Handler`].
//!
//! ## Architecture
//! - **core**: chunk wire format, framing codec, opaque body serialization
//! - **protocol**: Hello/Acknowledge handshake, the closed [`Message`] sum
//!   type, and the handler contract
//! - **transport**: endpoint URLs, the connection listener, established
//!   connections
//! - **security**: pluggable security-policy provider (None and symmetric
//!   AEAD)
//! - **service**: the secure channel, the server accept loop, discovery
//!   handlers
//! - **utils**: logging, metrics, timeouts
//!
//! ## Example
//! ```rust,no_run
//! use opcua_protocol::{DiscoveryHandler, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> opcua_protocol::Result<()> {
//!     let config = ServerConfig::new("opc.tcp://0.0.0.0:4840/plant");
//!     let server = Server::new(config)?;
//!     let handler = Arc::new(DiscoveryHandler::new(Arc::clone(server.config())));
//!     server.listen_and_serve(handler).await
//! }
//! ```
//!
//! ## Concurrency model
//! One task per accepted connection plus one accept loop; a connection and
//! its secure channel are exclusively owned by their task for their entire
//! life. Cancellation flows through a shared [`CancellationToken`] rather
//! than global state.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod security;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::ServerConfig;
pub use error::{Result, UaError};
pub use protocol::dispatcher::{Handler, HandlerFunc, Request, ResponseWriter};
pub use protocol::message::Message;
pub use security::{SecurityMode, SecurityPolicy};
pub use service::{DiscoveryHandler, SecureChannel, Server};
pub use transport::EndpointUrl;
