//! Server accept loop and per-connection handler loop.
//!
//! The server owns the configuration, the transport listener, and the loop
//! that spawns one independent task per accepted connection. Each task
//! opens a secure channel, then drives receive → dispatch → respond until
//! its own terminal condition; errors on one connection never touch the
//! accept loop or any other connection.
//!
//! Shutdown policy is abort-on-listener-close: cancelling the server stops
//! the accept loop and propagates through each task's cancellation token
//! into in-flight `receive` calls, which unwind cleanly.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::dispatcher::{Handler, Request, ResponseWriter};
use crate::protocol::handshake::TransportParams;
use crate::protocol::message::Message;
use crate::security::{self, SecurityPolicy};
use crate::service::channel::SecureChannel;
use crate::transport::{EndpointUrl, Listener, TransportConn};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_TIMEOUT};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// OPC UA server protocol core.
pub struct Server {
    config: Arc<ServerConfig>,
    policy: Arc<dyn SecurityPolicy>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    next_channel_id: AtomicU32,
}

impl Server {
    /// Build a server from a validated configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate_strict()?;
        let policy = security::policy_from_config(&config.security)?;
        Ok(Self {
            config: Arc::new(config),
            policy,
            metrics: Arc::new(Metrics::new()),
            cancel: CancellationToken::new(),
            next_channel_id: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Token observed by the accept loop and every connection task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the transport listener without serving yet. Useful to learn the
    /// actual bound address when configured with port 0.
    pub async fn bind(&self) -> Result<Listener> {
        let endpoint = EndpointUrl::parse(&self.config.endpoint_url)?;
        let params = TransportParams::from_config(&self.config.transport);
        Listener::bind(endpoint, params, self.config.transport.handshake_timeout).await
    }

    /// Accept connections on `listener`, spawning one handler task per
    /// connection, until the listener fails or the server is cancelled.
    ///
    /// Returns the terminal error. Already-spawned connection tasks are not
    /// awaited here; cancellation reaches them through their tokens.
    #[instrument(skip_all, fields(endpoint = %self.config.endpoint_url))]
    pub async fn serve(&self, mut listener: Listener, handler: Arc<dyn Handler>) -> Result<()> {
        info!("accepting connections");

        loop {
            let conn = match listener.accept(&self.cancel).await {
                Ok(conn) => conn,
                Err(e) => {
                    listener.close();
                    if e.is_clean_shutdown() {
                        debug!("accept loop stopped: {e}");
                    } else {
                        warn!(error = %e, "accept loop failed");
                    }
                    return Err(e);
                }
            };

            self.metrics.connection_established();
            let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);

            let handler = Arc::clone(&handler);
            let policy = Arc::clone(&self.policy);
            let metrics = Arc::clone(&self.metrics);
            let token_lifetime = self.config.security.token_lifetime;
            let cancel = self.cancel.child_token();

            tokio::spawn(async move {
                handle_connection(
                    conn,
                    channel_id,
                    token_lifetime,
                    handler,
                    policy,
                    metrics,
                    cancel,
                )
                .await;
            });
        }
    }

    /// Bind and serve in one call. Blocks until the listener fails or the
    /// server is cancelled, returning the terminal error.
    pub async fn listen_and_serve(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, handler).await
    }

    /// Idempotent shutdown signal: stops the accept loop and cancels every
    /// connection task's token.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Connection handler loop: secure-channel open, then receive → dispatch →
/// respond until a terminal error or cancellation.
async fn handle_connection(
    conn: TransportConn,
    channel_id: u32,
    token_lifetime: Duration,
    handler: Arc<dyn Handler>,
    policy: Arc<dyn SecurityPolicy>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let conn_id = conn.id();
    let peer = conn.peer_addr();

    // No retry on open failure: the transport connection drops with the
    // failed attempt and the peer's reconnect is the recovery path.
    let open = with_timeout_error(
        SecureChannel::accept(
            conn,
            channel_id,
            token_lifetime,
            policy,
            Arc::clone(&metrics),
            &cancel,
        ),
        HANDSHAKE_TIMEOUT,
    )
    .await;

    let mut channel = match open {
        Ok(channel) => {
            metrics.channel_opened();
            channel
        }
        Err(e) => {
            metrics.channel_failed();
            metrics.connection_closed();
            if e.is_clean_shutdown() {
                debug!(conn = conn_id, peer = %peer, "channel open abandoned: {e}");
            } else {
                warn!(conn = conn_id, peer = %peer, error = %e, "secure channel open failed");
            }
            return;
        }
    };

    loop {
        let received = match channel.receive(&cancel).await {
            Ok(received) => received,
            Err(e) => {
                if e.is_clean_shutdown() {
                    debug!(conn = conn_id, channel = channel.id(), "receive loop done: {e}");
                } else {
                    warn!(conn = conn_id, channel = channel.id(), error = %e, "receive failed");
                }
                break;
            }
        };

        debug!(
            conn = conn_id,
            channel = channel.id(),
            request = received.request_id,
            kind = received.message.kind_name(),
            "message received"
        );

        // Soft failure: unrecognized types are dropped, the channel stays up.
        if let Message::Unsupported { type_id } = received.message {
            metrics.unsupported_message();
            warn!(
                conn = conn_id,
                channel = channel.id(),
                type_id,
                "unsupported message type dropped"
            );
            continue;
        }

        let request = Request {
            message: received.message,
            request_id: received.request_id,
            channel_id: channel.id(),
        };
        metrics.request_dispatched();

        let mut writer = ResponseWriter::new();
        handler.serve(&mut writer, &request);

        if let Some(response) = writer.into_response() {
            if let Err(e) = channel.send_response(request.request_id, &response).await {
                warn!(
                    conn = conn_id,
                    channel = channel.id(),
                    error = %e,
                    "response transmission failed"
                );
                break;
            }
        }
    }

    if let Err(e) = channel.close().await {
        debug!(conn = conn_id, error = %e, "channel close");
    }
    metrics.connection_closed();
}
