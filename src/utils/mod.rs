//! # Utility Modules
//!
//! Supporting utilities used throughout the protocol implementation.
//!
//! ## Components
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: async timeout wrappers and shared constants

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::Metrics;
