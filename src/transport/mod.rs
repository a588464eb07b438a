//! # Transport Layer
//!
//! Endpoint URL parsing, the connection listener, and established transport
//! connections with negotiated limits.

pub mod listener;
pub mod uri;

pub use listener::{dial, Listener, TransportConn};
pub use uri::EndpointUrl;
