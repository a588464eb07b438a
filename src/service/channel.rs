//! Secure conversation channel.
//!
//! A `SecureChannel` wraps exactly one [`TransportConn`] for its lifetime
//! and owns everything the conversation layer needs: chunk reassembly,
//! per-direction sequence counters, security-token issuance and renewal,
//! and body protection through the configured [`SecurityPolicy`].
//!
//! State machine: `Unopened → Open → Renewing → Open → ... → Closed`. The
//! unopened phase lives entirely inside [`SecureChannel::accept`] and
//! [`SecureChannel::open`], so a constructed value is always `Open`;
//! renewing is transient within one `receive` call and never blocks message
//! processing against the still-valid prior token; `Closed` is terminal.
//!
//! Sequence discipline: each direction numbers its chunks 1, 2, 3, ...
//! (wrapping at the defined point). Any gap or regression on receive is a
//! protocol error that terminates the channel. A reassembled message may
//! span at most the negotiated chunk count and the negotiated message size;
//! exceeding either is equally fatal.

use crate::core::chunk::{
    self, ChunkFlag, Frame, MessageKind, SecureHeader, CHUNK_HEADER_SIZE, SECURE_HEADER_SIZE,
};
use crate::error::{Result, UaError};
use crate::protocol::message::{
    ChannelSecurityToken, CloseChannelRequest, Message, OpenChannelRequest, OpenChannelResponse,
    SecurityTokenRequestType,
};
use crate::security::{SecurityPolicy, SecurityToken};
use crate::transport::TransportConn;
use crate::utils::metrics::Metrics;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// AEAD overhead reserved per protected chunk body (nonce + tag).
const PROTECT_OVERHEAD: usize = 40;

/// Observable channel states. The open exchange happens inside the
/// constructors, so `Unopened` is never observable on a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// One received application message with its correlation id.
#[derive(Debug)]
pub struct Received {
    pub request_id: u32,
    pub message: Message,
}

/// A secure conversation bound 1:1 to a transport connection.
pub struct SecureChannel {
    conn: TransportConn,
    state: ChannelState,
    channel_id: u32,
    policy: Arc<dyn SecurityPolicy>,
    token_lifetime: Duration,
    /// Current token. Exactly one token is current at any instant.
    token: SecurityToken,
    /// Superseded token and the instant it stops being accepted.
    prev_token: Option<(SecurityToken, Instant)>,
    /// Last sequence number received, per direction.
    recv_seq: u32,
    send_seq: u32,
    next_request_id: u32,
    metrics: Arc<Metrics>,
}

impl SecureChannel {
    /// Server side: drive the OpenSecureChannel exchange on a fresh
    /// transport connection and issue the initial token.
    ///
    /// Fails if the peer proposes a different security policy or the
    /// exchange is malformed; the connection it consumed then closes as the
    /// failed attempt is dropped.
    #[instrument(skip_all, fields(conn = conn.id(), channel = channel_id))]
    pub async fn accept(
        mut conn: TransportConn,
        channel_id: u32,
        token_lifetime: Duration,
        policy: Arc<dyn SecurityPolicy>,
        metrics: Arc<Metrics>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let frame = conn.recv_frame(cancel).await?;
        if frame.kind != MessageKind::OpenChannel || frame.flag != ChunkFlag::Final {
            return Err(UaError::UnexpectedMessage);
        }

        let (header, body) = frame.split_secure()?;
        if header.sequence_number != 1 {
            return Err(UaError::SequenceViolation {
                expected: 1,
                got: header.sequence_number,
            });
        }

        let req = match Message::decode(body)? {
            Message::OpenChannelRequest(req) => req,
            _ => return Err(UaError::UnexpectedMessage),
        };
        if req.request_type != SecurityTokenRequestType::Issue {
            return Err(UaError::Handshake(
                "first OpenSecureChannel must be an Issue request".into(),
            ));
        }
        if req.security_policy_uri != policy.uri() {
            let err = UaError::Security(format!(
                "policy {} not offered on this endpoint",
                req.security_policy_uri
            ));
            conn.send_error(err.status_code(), &err.to_string()).await;
            return Err(err);
        }

        let lifetime = granted_lifetime(req.requested_lifetime, token_lifetime);
        let token = SecurityToken::new(random_nonzero(), channel_id, lifetime);
        metrics.token_issued();

        let mut channel = Self {
            conn,
            state: ChannelState::Open,
            channel_id,
            policy,
            token_lifetime,
            token,
            prev_token: None,
            recv_seq: header.sequence_number,
            send_seq: 0,
            next_request_id: 0,
            metrics,
        };

        let response = Message::OpenChannelResponse(OpenChannelResponse {
            token: ChannelSecurityToken {
                channel_id,
                token_id: channel.token.token_id,
                revised_lifetime: lifetime.as_millis() as u32,
            },
            server_nonce: random_nonce(),
        });
        channel
            .send_message(MessageKind::OpenChannel, header.request_id, &response)
            .await?;

        debug!(token = channel.token.token_id, "secure channel open");
        Ok(channel)
    }

    /// Client side: open a secure channel on a dialed connection.
    ///
    /// Exists for the in-process client used by tools and tests.
    #[instrument(skip_all, fields(conn = conn.id()))]
    pub async fn open(
        mut conn: TransportConn,
        token_lifetime: Duration,
        policy: Arc<dyn SecurityPolicy>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let request = Message::OpenChannelRequest(OpenChannelRequest {
            request_type: SecurityTokenRequestType::Issue,
            security_mode: policy.mode(),
            security_policy_uri: policy.uri().to_string(),
            client_nonce: random_nonce(),
            requested_lifetime: token_lifetime.as_millis() as u32,
        });

        let header = SecureHeader {
            channel_id: 0,
            token_id: 0,
            sequence_number: 1,
            request_id: 1,
        };
        let frame = Frame::secure(
            MessageKind::OpenChannel,
            ChunkFlag::Final,
            header,
            &request.encode()?,
        );
        conn.send_frame(frame).await?;

        let frame = conn.recv_frame(cancel).await?;
        if frame.kind != MessageKind::OpenChannel {
            return Err(UaError::UnexpectedMessage);
        }
        let (resp_header, body) = frame.split_secure()?;
        let resp = match Message::decode(body)? {
            Message::OpenChannelResponse(resp) => resp,
            _ => return Err(UaError::UnexpectedMessage),
        };

        let lifetime = Duration::from_millis(u64::from(resp.token.revised_lifetime));
        Ok(Self {
            conn,
            state: ChannelState::Open,
            channel_id: resp.token.channel_id,
            policy,
            token_lifetime: lifetime,
            token: SecurityToken::new(resp.token.token_id, resp.token.channel_id, lifetime),
            prev_token: None,
            recv_seq: resp_header.sequence_number,
            send_seq: 1,
            next_request_id: 2,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Channel identifier, stable for the channel's life.
    pub fn id(&self) -> u32 {
        self.channel_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Id of the current security token.
    pub fn current_token_id(&self) -> u32 {
        self.token.token_id
    }

    /// Connection id of the underlying transport.
    pub fn conn_id(&self) -> u32 {
        self.conn.id()
    }

    /// Block until a complete application message is reassembled, the
    /// connection errors, or `cancel` fires.
    ///
    /// Token renewals requested by the peer are serviced transparently in
    /// here; a peer-initiated CloseSecureChannel surfaces as
    /// [`UaError::ChannelClosed`] after the transport is released.
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<Received> {
        loop {
            let (request_id, bytes) = match self.receive_raw(cancel).await {
                Ok(v) => v,
                Err(e) => {
                    if !e.is_clean_shutdown() {
                        self.metrics.protocol_error();
                        self.conn.send_error(e.status_code(), &e.to_string()).await;
                    }
                    return Err(e);
                }
            };

            self.metrics.message_received(bytes.len() as u64);
            let message = match Message::decode(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    self.metrics.protocol_error();
                    self.conn.send_error(e.status_code(), &e.to_string()).await;
                    return Err(e);
                }
            };

            match message {
                Message::OpenChannelRequest(req)
                    if req.request_type == SecurityTokenRequestType::Renew =>
                {
                    self.renew(request_id, req).await?;
                    continue;
                }
                Message::CloseChannelRequest(_) => {
                    debug!(channel = self.channel_id, "peer closed secure channel");
                    self.state = ChannelState::Closed;
                    self.conn.close().await?;
                    return Err(UaError::ChannelClosed);
                }
                message => return Ok(Received { request_id, message }),
            }
        }
    }

    /// Reassemble one logical message from one or more chunks.
    async fn receive_raw(&mut self, cancel: &CancellationToken) -> Result<(u32, Vec<u8>)> {
        if self.state == ChannelState::Closed {
            return Err(UaError::ChannelClosed);
        }

        let max_message = self.conn.params().max_message_size;
        let max_chunks = self.conn.params().max_chunk_count;

        let mut assembly: Vec<u8> = Vec::new();
        let mut chunks: u32 = 0;
        let mut message_kind: Option<MessageKind> = None;
        let mut request_id: Option<u32> = None;

        loop {
            let frame = self.conn.recv_frame(cancel).await?;
            if !frame.kind.is_secure() {
                return Err(UaError::UnexpectedMessage);
            }

            let (header, body) = frame.split_secure()?;
            if header.channel_id != self.channel_id {
                return Err(UaError::UnknownChannel(header.channel_id));
            }
            self.check_recv_sequence(header.sequence_number)?;

            // An abort carries no usable body, so it must be honored
            // before any decryption is attempted.
            if frame.flag == ChunkFlag::Abort {
                debug!(channel = self.channel_id, "peer aborted in-flight message");
                assembly.clear();
                chunks = 0;
                message_kind = None;
                request_id = None;
                continue;
            }

            // OPN and CLO bodies travel under the null policy; only MSG
            // bodies are protected by the negotiated one.
            let plain = if frame.kind == MessageKind::Message {
                let token = self.token_for(header.token_id)?;
                self.policy.unprotect(&token, body)?
            } else {
                body.to_vec()
            };

            match message_kind {
                None => message_kind = Some(frame.kind),
                Some(kind) if kind != frame.kind => return Err(UaError::UnexpectedMessage),
                Some(_) => {}
            }
            match request_id {
                None => request_id = Some(header.request_id),
                Some(id) if id != header.request_id => return Err(UaError::InvalidHeader),
                Some(_) => {}
            }

            chunks += 1;
            if chunks > max_chunks {
                return Err(UaError::TooManyChunks(max_chunks));
            }
            if assembly.len() + plain.len() > max_message as usize {
                return Err(UaError::MessageTooLarge {
                    size: assembly.len() + plain.len(),
                    max: max_message,
                });
            }
            assembly.extend_from_slice(&plain);

            if frame.flag == ChunkFlag::Final {
                // request_id is always set once a chunk has been accepted.
                let id = request_id.ok_or(UaError::InvalidHeader)?;
                return Ok((id, assembly));
            }
        }
    }

    fn check_recv_sequence(&mut self, got: u32) -> Result<()> {
        let expected = chunk::next_sequence(self.recv_seq);
        if got != expected {
            return Err(UaError::SequenceViolation { expected, got });
        }
        self.recv_seq = got;
        Ok(())
    }

    /// Resolve a received token id against the current token and, within
    /// its overlap window, the superseded one.
    fn token_for(&self, token_id: u32) -> Result<SecurityToken> {
        if token_id == self.token.token_id {
            if self.token.is_expired() {
                return Err(UaError::InvalidToken(token_id));
            }
            return Ok(self.token.clone());
        }
        if let Some((prev, retire_at)) = &self.prev_token {
            if token_id == prev.token_id && Instant::now() < *retire_at {
                return Ok(prev.clone());
            }
        }
        Err(UaError::InvalidToken(token_id))
    }

    /// Install a fresh token in response to a peer Renew request. Messages
    /// already received under the old token stay valid for its overlap
    /// window; subsequent sends use the new token immediately.
    async fn renew(&mut self, request_id: u32, req: OpenChannelRequest) -> Result<()> {
        if req.security_policy_uri != self.policy.uri() {
            return Err(UaError::Security(
                "renewal may not change the security policy".into(),
            ));
        }

        let lifetime = granted_lifetime(req.requested_lifetime, self.token_lifetime);
        let fresh = SecurityToken::new(random_nonzero(), self.channel_id, lifetime);
        let old = std::mem::replace(&mut self.token, fresh);
        let retire_at = Instant::now() + old.overlap_window();
        self.prev_token = Some((old, retire_at));
        self.metrics.token_renewed();

        debug!(
            channel = self.channel_id,
            token = self.token.token_id,
            "security token renewed"
        );

        let response = Message::OpenChannelResponse(OpenChannelResponse {
            token: ChannelSecurityToken {
                channel_id: self.channel_id,
                token_id: self.token.token_id,
                revised_lifetime: lifetime.as_millis() as u32,
            },
            server_nonce: random_nonce(),
        });
        self.send_message(MessageKind::OpenChannel, request_id, &response)
            .await
    }

    /// Encode, secure, chunk, and write a response correlated to
    /// `request_id`. Advances the send-direction sequence counter.
    pub async fn send_response(&mut self, request_id: u32, msg: &Message) -> Result<()> {
        self.send_message(MessageKind::Message, request_id, msg).await
    }

    /// Client side: send a request and return the correlation id assigned
    /// to it.
    pub async fn send_request(&mut self, msg: &Message) -> Result<u32> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.send_message(MessageKind::Message, request_id, msg)
            .await?;
        Ok(request_id)
    }

    /// Client side: request a token renewal and install the granted token.
    pub async fn renew_token(&mut self, cancel: &CancellationToken) -> Result<()> {
        let request = Message::OpenChannelRequest(OpenChannelRequest {
            request_type: SecurityTokenRequestType::Renew,
            security_mode: self.policy.mode(),
            security_policy_uri: self.policy.uri().to_string(),
            client_nonce: random_nonce(),
            requested_lifetime: self.token_lifetime.as_millis() as u32,
        });
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.send_message(MessageKind::OpenChannel, request_id, &request)
            .await?;

        let received = self.receive(cancel).await?;
        match received.message {
            Message::OpenChannelResponse(resp) => {
                let lifetime = Duration::from_millis(u64::from(resp.token.revised_lifetime));
                let fresh =
                    SecurityToken::new(resp.token.token_id, self.channel_id, lifetime);
                let old = std::mem::replace(&mut self.token, fresh);
                self.prev_token = Some((old, Instant::now() + lifetime / 4));
                Ok(())
            }
            _ => Err(UaError::UnexpectedMessage),
        }
    }

    async fn send_message(
        &mut self,
        kind: MessageKind,
        request_id: u32,
        msg: &Message,
    ) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Err(UaError::ChannelClosed);
        }

        let encoded = msg.encode()?;
        let max_message = self.conn.params().max_message_size;
        if encoded.len() > max_message as usize {
            return Err(UaError::MessageTooLarge {
                size: encoded.len(),
                max: max_message,
            });
        }

        let overhead = CHUNK_HEADER_SIZE + SECURE_HEADER_SIZE + PROTECT_OVERHEAD;
        let budget = (self.conn.params().send_buffer_size as usize)
            .saturating_sub(overhead)
            .max(1);
        let pieces: Vec<&[u8]> = if encoded.is_empty() {
            vec![&[]]
        } else {
            encoded.chunks(budget).collect()
        };

        let max_chunks = self.conn.params().max_chunk_count;
        if pieces.len() > max_chunks as usize {
            return Err(UaError::TooManyChunks(max_chunks));
        }

        let last = pieces.len() - 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            let body = if kind == MessageKind::Message {
                self.policy.protect(&self.token, piece)?
            } else {
                piece.to_vec()
            };

            self.send_seq = chunk::next_sequence(self.send_seq);
            let header = SecureHeader {
                channel_id: self.channel_id,
                token_id: self.token.token_id,
                sequence_number: self.send_seq,
                request_id,
            };
            let flag = if i == last {
                ChunkFlag::Final
            } else {
                ChunkFlag::Intermediate
            };
            let frame = Frame::secure(kind, flag, header, &body);
            self.conn.send_frame(frame).await?;
        }

        self.metrics.message_sent(encoded.len() as u64);
        Ok(())
    }

    /// Idempotent close. Notifies the peer best-effort and releases the
    /// transport connection exactly once.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        self.state = ChannelState::Closed;

        let header = SecureHeader {
            channel_id: self.channel_id,
            token_id: self.token.token_id,
            sequence_number: chunk::next_sequence(self.send_seq),
            request_id: self.next_request_id,
        };
        let body = Message::CloseChannelRequest(CloseChannelRequest {}).encode()?;
        let frame = Frame::secure(MessageKind::CloseChannel, ChunkFlag::Final, header, &body);
        if let Err(e) = self.conn.send_frame(frame).await {
            debug!(channel = self.channel_id, error = %e, "close notification not sent");
        }

        self.conn.close().await
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("channel_id", &self.channel_id)
            .field("state", &self.state)
            .field("token_id", &self.token.token_id)
            .finish()
    }
}

fn granted_lifetime(requested_ms: u32, configured: Duration) -> Duration {
    if requested_ms == 0 {
        configured
    } else {
        configured.min(Duration::from_millis(u64::from(requested_ms)))
    }
}

fn random_nonzero() -> u32 {
    loop {
        let id: u32 = rand::rng().random();
        if id != 0 {
            return id;
        }
    }
}

fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 32];
    rand::rng().fill(&mut nonce[..]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granted_lifetime_clamps_to_configured() {
        let configured = Duration::from_secs(600);
        assert_eq!(granted_lifetime(0, configured), configured);
        assert_eq!(
            granted_lifetime(1_000, configured),
            Duration::from_millis(1_000)
        );
        assert_eq!(granted_lifetime(u32::MAX, configured), configured);
    }

    #[test]
    fn random_ids_are_nonzero() {
        for _ in 0..100 {
            assert_ne!(random_nonzero(), 0);
        }
    }
}
