//! # Service Layer
//!
//! The secure channel, the server accept loop, and the built-in discovery
//! handlers.
//!
//! ## Components
//! - **Channel**: secure conversation over one transport connection —
//!   reassembly, sequencing, token lifecycle
//! - **Server**: configuration owner, accept loop, one handler task per
//!   connection
//! - **Discovery**: FindServers / GetEndpoints answered from static config

pub mod channel;
pub mod discovery;
pub mod server;

pub use channel::{ChannelState, Received, SecureChannel};
pub use discovery::DiscoveryHandler;
pub use server::Server;
