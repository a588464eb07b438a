//! Transport listener and established connections.
//!
//! The listener binds to the address encoded in the endpoint URL and
//! performs the UACP handshake on every accepted socket. Only sockets that
//! complete the handshake are yielded as [`TransportConn`]s; a failed
//! handshake closes the raw socket and the accept loop moves on.
//!
//! A `TransportConn` is exclusively owned by one connection handler loop for
//! its whole life and is closed exactly once, on loop exit.

use crate::core::chunk::{ErrorBody, Frame, MessageKind};
use crate::core::codec::ChunkCodec;
use crate::error::{Result, UaError};
use crate::protocol::handshake::{self, Acknowledge, Hello, TransportParams};
use crate::transport::uri::EndpointUrl;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// One accepted stream socket plus its negotiated transport limits.
pub struct TransportConn {
    id: u32,
    peer: SocketAddr,
    params: TransportParams,
    framed: Framed<TcpStream, ChunkCodec>,
    closed: bool,
}

impl TransportConn {
    /// Locally-assigned connection id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Limits negotiated during the transport handshake.
    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    /// Write one chunk to the stream. May block on transport backpressure.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(UaError::ConnectionClosed);
        }
        self.framed.send(frame).await
    }

    /// Read the next chunk off the stream.
    ///
    /// An `ERR` chunk from the peer surfaces as [`UaError::PeerError`];
    /// stream end as [`UaError::ConnectionClosed`]; cancellation as
    /// [`UaError::Cancelled`] without consuming any input.
    pub async fn recv_frame(&mut self, cancel: &CancellationToken) -> Result<Frame> {
        if self.closed {
            return Err(UaError::ConnectionClosed);
        }
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(UaError::Cancelled),
            frame = self.framed.next() => frame.ok_or(UaError::ConnectionClosed)??,
        };

        if frame.kind == MessageKind::Error {
            let body = ErrorBody::decode(&frame.payload)?;
            return Err(UaError::PeerError {
                code: body.code,
                reason: body.reason,
            });
        }
        Ok(frame)
    }

    /// Best-effort `ERR` chunk ahead of teardown. Failures are swallowed:
    /// the connection is going away either way.
    pub async fn send_error(&mut self, code: u32, reason: &str) {
        let body = ErrorBody {
            code,
            reason: reason.to_string(),
        };
        let frame = Frame::new(MessageKind::Error, body.encode());
        if let Err(e) = self.send_frame(frame).await {
            debug!(error = %e, "failed to send ERR chunk");
        }
    }

    /// Idempotent close of the underlying socket.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.framed.get_mut().shutdown().await.ok();
        Ok(())
    }
}

impl std::fmt::Debug for TransportConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConn")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("params", &self.params)
            .finish()
    }
}

/// Accepts raw connections and performs the transport handshake on each.
pub struct Listener {
    inner: Option<TcpListener>,
    endpoint: EndpointUrl,
    params: TransportParams,
    handshake_timeout: Duration,
    next_conn_id: u32,
}

impl Listener {
    /// Bind to the address encoded in the endpoint URL.
    #[instrument(skip(params), fields(endpoint = %endpoint))]
    pub async fn bind(
        endpoint: EndpointUrl,
        params: TransportParams,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let inner = TcpListener::bind(endpoint.socket_addr()).await?;
        debug!(addr = %inner.local_addr()?, "listener bound");
        Ok(Self {
            inner: Some(inner),
            endpoint,
            params,
            handshake_timeout,
            next_conn_id: 0,
        })
    }

    /// Address the listener is actually bound to (relevant with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            Some(l) => Ok(l.local_addr()?),
            None => Err(UaError::ConnectionClosed),
        }
    }

    /// Block until a connection completes the transport handshake, the
    /// listener is closed, or `cancel` fires.
    ///
    /// A connection that fails the handshake is dropped and accept keeps
    /// waiting; only listener-level failures terminate the call.
    pub async fn accept(&mut self, cancel: &CancellationToken) -> Result<TransportConn> {
        loop {
            let listener = self.inner.as_ref().ok_or(UaError::ConnectionClosed)?;

            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Err(UaError::Cancelled),
                accepted = listener.accept() => accepted?,
            };

            self.next_conn_id = self.next_conn_id.wrapping_add(1);
            let id = self.next_conn_id;

            match tokio::time::timeout(
                self.handshake_timeout,
                accept_handshake(stream, peer, id, self.params, &self.endpoint),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    debug!(conn = id, peer = %peer, "transport handshake complete");
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    warn!(conn = id, peer = %peer, error = %e, "transport handshake failed");
                }
                Err(_) => {
                    warn!(conn = id, peer = %peer, "transport handshake timed out");
                }
            }
        }
    }

    /// Idempotent close. Pending and future `accept` calls fail with
    /// [`UaError::ConnectionClosed`].
    pub fn close(&mut self) {
        self.inner.take();
    }
}

/// Server side of the Hello/Acknowledge exchange.
async fn accept_handshake(
    stream: TcpStream,
    peer: SocketAddr,
    id: u32,
    local: TransportParams,
    endpoint: &EndpointUrl,
) -> Result<TransportConn> {
    let mut framed = Framed::new(stream, ChunkCodec::new());

    let frame = framed
        .next()
        .await
        .ok_or(UaError::ConnectionClosed)??;
    if frame.kind != MessageKind::Hello {
        return Err(UaError::Handshake(format!(
            "expected HEL, got {:?}",
            frame.kind
        )));
    }

    let hello = Hello::decode(&frame.payload)?;
    let (ack, negotiated) = match handshake::accept_hello(&hello, &local, endpoint.as_str()) {
        Ok(ok) => ok,
        Err(e) => {
            // Tell the peer why before dropping the socket.
            let body = ErrorBody {
                code: e.status_code(),
                reason: e.to_string(),
            };
            framed
                .send(Frame::new(MessageKind::Error, body.encode()))
                .await
                .ok();
            return Err(e);
        }
    };

    framed.send(ack.into_frame()).await?;
    framed
        .codec_mut()
        .set_max_chunk_size(negotiated.receive_buffer_size);

    Ok(TransportConn {
        id,
        peer,
        params: negotiated,
        framed,
        closed: false,
    })
}

/// Client side of the transport handshake: connect and exchange HEL/ACK.
///
/// Exists for the in-process client used by tools and tests; server-side
/// code never calls it.
#[instrument(skip(params), fields(endpoint = %endpoint))]
pub async fn dial(endpoint: &EndpointUrl, params: TransportParams) -> Result<TransportConn> {
    let stream = TcpStream::connect(endpoint.socket_addr()).await?;
    let peer = stream.peer_addr()?;
    let mut framed = Framed::new(stream, ChunkCodec::new());

    let hello = Hello::new(params, endpoint.as_str());
    framed.send(hello.into_frame()).await?;

    let frame = framed
        .next()
        .await
        .ok_or(UaError::ConnectionClosed)??;
    match frame.kind {
        MessageKind::Acknowledge => {}
        MessageKind::Error => {
            let body = ErrorBody::decode(&frame.payload)?;
            return Err(UaError::PeerError {
                code: body.code,
                reason: body.reason,
            });
        }
        other => {
            return Err(UaError::Handshake(format!("expected ACK, got {other:?}")));
        }
    }

    let ack = Acknowledge::decode(&frame.payload)?;
    let negotiated = handshake::accept_acknowledge(&ack, &params)?;
    framed
        .codec_mut()
        .set_max_chunk_size(negotiated.receive_buffer_size);

    debug!(peer = %peer, ?negotiated, "dial handshake complete");

    Ok(TransportConn {
        id: 0,
        peer,
        params: negotiated,
        framed,
        closed: false,
    })
}
