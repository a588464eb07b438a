//! Observability counters.
//!
//! Thread-safe, append-only metrics for monitoring server health. Uses
//! atomic counters so connection tasks never contend on a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector shared by the server and its connection tasks.
#[derive(Debug)]
pub struct Metrics {
    /// Total connections that completed the transport handshake
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Secure channels successfully opened
    pub channels_opened: AtomicU64,
    /// Secure-channel open attempts that failed
    pub channels_failed: AtomicU64,
    /// Security tokens issued (initial issues)
    pub tokens_issued: AtomicU64,
    /// Security tokens renewed
    pub tokens_renewed: AtomicU64,
    /// Application messages received
    pub messages_received: AtomicU64,
    /// Application messages sent
    pub messages_sent: AtomicU64,
    /// Body bytes received
    pub bytes_received: AtomicU64,
    /// Body bytes sent
    pub bytes_sent: AtomicU64,
    /// Requests dispatched to the handler
    pub requests_dispatched: AtomicU64,
    /// Messages of an unrecognized type (logged and dropped)
    pub unsupported_messages: AtomicU64,
    /// Protocol errors fatal to a channel
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            channels_failed: AtomicU64::new(0),
            tokens_issued: AtomicU64::new(0),
            tokens_renewed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            unsupported_messages: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_failed(&self) {
        self.channels_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_issued(&self) {
        self.tokens_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_renewed(&self) {
        self.tokens_renewed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn request_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsupported_message(&self) {
        self.unsupported_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since the collector was created.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Emit a one-line summary at info level.
    pub fn log_summary(&self) {
        info!(
            uptime_secs = self.uptime_secs(),
            connections_total = self.connections_total.load(Ordering::Relaxed),
            connections_active = self.connections_active.load(Ordering::Relaxed),
            channels_opened = self.channels_opened.load(Ordering::Relaxed),
            tokens_renewed = self.tokens_renewed.load(Ordering::Relaxed),
            messages_received = self.messages_received.load(Ordering::Relaxed),
            messages_sent = self.messages_sent.load(Ordering::Relaxed),
            protocol_errors = self.protocol_errors.load(Ordering::Relaxed),
            "server metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.connection_established();
        m.connection_established();
        m.connection_closed();
        m.message_received(100);
        m.message_received(50);

        assert_eq!(m.connections_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.connections_active.load(Ordering::Relaxed), 1);
        assert_eq!(m.messages_received.load(Ordering::Relaxed), 2);
        assert_eq!(m.bytes_received.load(Ordering::Relaxed), 150);
    }

    #[test]
    fn uptime_starts_at_zero_and_summary_emits() {
        let m = Metrics::new();
        assert!(m.uptime_secs() < 60);
        m.log_summary();
    }
}
