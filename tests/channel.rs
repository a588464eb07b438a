#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Secure-channel tests over a loopback transport: open exchange, chunked
//! reassembly, sequence discipline, token renewal, and close semantics.

use opcua_protocol::core::chunk::{ChunkFlag, Frame, MessageKind, SecureHeader};
use opcua_protocol::error::{status, UaError};
use opcua_protocol::protocol::handshake::TransportParams;
use opcua_protocol::protocol::message::{
    FindServersRequest, Message, OpenChannelRequest, SecurityTokenRequestType, ServiceFault,
};
use opcua_protocol::security::{
    ChaCha20Poly1305Policy, NoSecurity, SecurityMode, SecurityPolicy, SecurityToken,
    POLICY_URI_CHACHA20POLY1305, POLICY_URI_NONE,
};
use opcua_protocol::service::channel::ChannelState;
use opcua_protocol::transport::{dial, EndpointUrl, Listener, TransportConn};
use opcua_protocol::utils::metrics::Metrics;
use opcua_protocol::utils::timeout::HANDSHAKE_TIMEOUT;
use opcua_protocol::SecureChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOKEN_LIFETIME: Duration = Duration::from_secs(600);

async fn bind(params: TransportParams) -> (Listener, EndpointUrl) {
    let endpoint = EndpointUrl::parse("opc.tcp://127.0.0.1:0").unwrap();
    let listener = Listener::bind(endpoint, params, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let endpoint = EndpointUrl::parse(&format!("opc.tcp://127.0.0.1:{}", addr.port())).unwrap();
    (listener, endpoint)
}

async fn accept_channel(listener: &mut Listener, cancel: &CancellationToken) -> SecureChannel {
    let conn = listener.accept(cancel).await.unwrap();
    SecureChannel::accept(
        conn,
        1,
        TOKEN_LIFETIME,
        Arc::new(NoSecurity),
        Arc::new(Metrics::new()),
        cancel,
    )
    .await
    .unwrap()
}

async fn open_client(endpoint: &EndpointUrl, params: TransportParams) -> SecureChannel {
    let conn = dial(endpoint, params).await.unwrap();
    SecureChannel::open(
        conn,
        TOKEN_LIFETIME,
        Arc::new(NoSecurity),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn find_servers(url: &str) -> Message {
    Message::FindServersRequest(FindServersRequest {
        endpoint_url: url.to_string(),
        server_uris: vec![],
    })
}

#[tokio::test]
async fn open_exchange_and_request_response() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &server_cancel).await;
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.id(), 1);

        let received = channel.receive(&server_cancel).await.unwrap();
        assert!(matches!(received.message, Message::FindServersRequest(_)));

        let fault = Message::ServiceFault(ServiceFault { status_code: 0 });
        channel
            .send_response(received.request_id, &fault)
            .await
            .unwrap();
        channel.close().await.unwrap();
    });

    let mut client = open_client(&endpoint, TransportParams::default()).await;
    assert_eq!(client.id(), 1);
    assert_ne!(client.current_token_id(), 0);

    let request_id = client.send_request(&find_servers("opc.tcp://x:4840")).await.unwrap();
    let received = client.receive(&cancel).await.unwrap();
    assert_eq!(received.request_id, request_id);
    assert!(matches!(received.message, Message::ServiceFault(_)));

    server.await.unwrap();
}

#[tokio::test]
async fn large_message_is_chunked_and_reassembled() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &server_cancel).await;
        let received = channel.receive(&server_cancel).await.unwrap();
        match received.message {
            Message::FindServersRequest(req) => req.endpoint_url.len(),
            other => panic!("unexpected message: {other:?}"),
        }
    });

    // Constrain the client's outbound buffer so the body must span several
    // chunks; the message itself stays well under the negotiated maximum.
    let client_params = TransportParams {
        send_buffer_size: 4096,
        ..TransportParams::default()
    };
    let mut client = open_client(&endpoint, client_params).await;

    let long_url = "x".repeat(20_000);
    client.send_request(&find_servers(&long_url)).await.unwrap();

    assert_eq!(server.await.unwrap(), 20_000);
    client.close().await.unwrap();
}

/// Minimal raw peer speaking chunk frames directly, for tests that need
/// control over headers the channel API deliberately hides.
struct RawClient {
    conn: TransportConn,
    channel_id: u32,
    token_id: u32,
}

impl RawClient {
    async fn open(endpoint: &EndpointUrl, params: TransportParams) -> Self {
        let mut conn = dial(endpoint, params).await.unwrap();

        let request = Message::OpenChannelRequest(OpenChannelRequest {
            request_type: SecurityTokenRequestType::Issue,
            security_mode: SecurityMode::None,
            security_policy_uri: POLICY_URI_NONE.to_string(),
            client_nonce: vec![0u8; 32],
            requested_lifetime: 600_000,
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
            &request.encode().unwrap(),
        );
        conn.send_frame(frame).await.unwrap();

        let frame = conn
            .recv_frame(&CancellationToken::new())
            .await
            .unwrap();
        let (_, body) = frame.split_secure().unwrap();
        let (channel_id, token_id) = match Message::decode(body).unwrap() {
            Message::OpenChannelResponse(resp) => (resp.token.channel_id, resp.token.token_id),
            other => panic!("unexpected open response: {other:?}"),
        };

        Self {
            conn,
            channel_id,
            token_id,
        }
    }

    async fn send_chunk(&mut self, flag: ChunkFlag, sequence_number: u32, body: &[u8]) {
        let header = SecureHeader {
            channel_id: self.channel_id,
            token_id: self.token_id,
            sequence_number,
            request_id: 7,
        };
        let frame = Frame::secure(MessageKind::Message, flag, header, body);
        self.conn.send_frame(frame).await.unwrap();
    }

    async fn expect_peer_error(&mut self) -> u32 {
        match self.conn.recv_frame(&CancellationToken::new()).await {
            Err(UaError::PeerError { code, .. }) => code,
            other => panic!("expected ERR chunk, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn sequence_gap_terminates_the_channel() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &cancel).await;
        channel.receive(&cancel).await
    });

    let mut raw = RawClient::open(&endpoint, TransportParams::default()).await;
    // OPN consumed sequence 1; jumping to 5 opens a gap.
    let body = find_servers("opc.tcp://x:4840").encode().unwrap();
    raw.send_chunk(ChunkFlag::Final, 5, &body).await;

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        UaError::SequenceViolation {
            expected: 2,
            got: 5
        }
    ));
    assert_eq!(raw.expect_peer_error().await, status::BAD_SEQUENCE_NUMBER_INVALID);
}

#[tokio::test]
async fn oversized_message_is_rejected_with_err_chunk() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &cancel).await;
        channel.receive(&cancel).await
    });

    // Negotiate a 1 KiB message ceiling, then deliver 2 KB in one chunk.
    let params = TransportParams {
        max_message_size: 1024,
        ..TransportParams::default()
    };
    let mut raw = RawClient::open(&endpoint, params).await;
    raw.send_chunk(ChunkFlag::Final, 2, &vec![0u8; 2048]).await;

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, UaError::MessageTooLarge { size: 2048, max: 1024 }));
    assert_eq!(raw.expect_peer_error().await, status::BAD_TCP_MESSAGE_TOO_LARGE);
}

#[tokio::test]
async fn abort_chunk_discards_partial_message() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &cancel).await;
        channel.receive(&cancel).await.unwrap()
    });

    let mut raw = RawClient::open(&endpoint, TransportParams::default()).await;

    // Half a message, then an abort, then a complete fresh one. Only the
    // fresh message may surface.
    raw.send_chunk(ChunkFlag::Intermediate, 2, &[0xAA; 64]).await;
    raw.send_chunk(ChunkFlag::Abort, 3, &[]).await;
    let body = find_servers("opc.tcp://after-abort:4840").encode().unwrap();
    raw.send_chunk(ChunkFlag::Final, 4, &body).await;

    let received = server.await.unwrap();
    match received.message {
        Message::FindServersRequest(req) => {
            assert_eq!(req.endpoint_url, "opc.tcp://after-abort:4840");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn token_renewal_is_transparent_to_requests() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &server_cancel).await;
        let before = channel.current_token_id();

        // The renew request is serviced inside receive; only the follow-up
        // application request surfaces here.
        let received = channel.receive(&server_cancel).await.unwrap();
        assert!(matches!(received.message, Message::FindServersRequest(_)));
        let after = channel.current_token_id();

        let fault = Message::ServiceFault(ServiceFault { status_code: 0 });
        channel
            .send_response(received.request_id, &fault)
            .await
            .unwrap();
        (before, after)
    });

    let mut client = open_client(&endpoint, TransportParams::default()).await;
    let issued = client.current_token_id();

    client.renew_token(&cancel).await.unwrap();
    let renewed = client.current_token_id();
    assert_ne!(issued, renewed);

    client.send_request(&find_servers("opc.tcp://x:4840")).await.unwrap();
    let received = client.receive(&cancel).await.unwrap();
    assert!(matches!(received.message, Message::ServiceFault(_)));

    let (before, after) = server.await.unwrap();
    assert_ne!(before, after);
    assert_eq!(after, renewed);
}

#[tokio::test]
async fn peer_close_surfaces_as_clean_shutdown() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &cancel).await;
        let err = channel.receive(&cancel).await.unwrap_err();
        assert!(matches!(err, UaError::ChannelClosed));
        assert!(err.is_clean_shutdown());
        assert_eq!(channel.state(), ChannelState::Closed);
    });

    let mut client = open_client(&endpoint, TransportParams::default()).await;
    client.close().await.unwrap();
    // Closing again is a no-op.
    client.close().await.unwrap();
    assert_eq!(client.state(), ChannelState::Closed);

    // Sends after close fail without touching the transport.
    let err = client
        .send_request(&find_servers("opc.tcp://x:4840"))
        .await
        .unwrap_err();
    assert!(matches!(err, UaError::ChannelClosed));

    server.await.unwrap();
}

#[tokio::test]
async fn aead_channel_accepts_old_token_inside_overlap_window() {
    const KEY: [u8; 32] = [0x42; 32];
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(async move {
        let conn = listener.accept(&cancel).await.unwrap();
        let mut channel = SecureChannel::accept(
            conn,
            1,
            TOKEN_LIFETIME,
            Arc::new(ChaCha20Poly1305Policy::new(KEY)),
            Arc::new(Metrics::new()),
            &cancel,
        )
        .await
        .unwrap();

        // The renew is serviced inside receive; the application message
        // that follows rides the superseded token and must still decrypt.
        let received = channel.receive(&cancel).await.unwrap();
        match received.message {
            Message::FindServersRequest(req) => {
                assert_eq!(req.endpoint_url, "opc.tcp://overlap:4840");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // A token id the channel never issued is fatal, correct key or not.
        let err = channel.receive(&cancel).await.unwrap_err();
        assert!(matches!(err, UaError::InvalidToken(0xDEAD)));
    });

    let policy = ChaCha20Poly1305Policy::new(KEY);
    let mut conn = dial(&endpoint, TransportParams::default()).await.unwrap();
    let client_cancel = CancellationToken::new();

    // Issue exchange. OPN bodies travel plaintext even under this policy.
    let open = Message::OpenChannelRequest(OpenChannelRequest {
        request_type: SecurityTokenRequestType::Issue,
        security_mode: SecurityMode::SignAndEncrypt,
        security_policy_uri: POLICY_URI_CHACHA20POLY1305.to_string(),
        client_nonce: vec![0u8; 32],
        requested_lifetime: 600_000,
    });
    conn.send_frame(Frame::secure(
        MessageKind::OpenChannel,
        ChunkFlag::Final,
        SecureHeader {
            channel_id: 0,
            token_id: 0,
            sequence_number: 1,
            request_id: 1,
        },
        &open.encode().unwrap(),
    ))
    .await
    .unwrap();
    let frame = conn.recv_frame(&client_cancel).await.unwrap();
    let (_, body) = frame.split_secure().unwrap();
    let (channel_id, first_token) = match Message::decode(body).unwrap() {
        Message::OpenChannelResponse(resp) => (resp.token.channel_id, resp.token.token_id),
        other => panic!("unexpected open response: {other:?}"),
    };

    // Renew, superseding the first token.
    let renew = Message::OpenChannelRequest(OpenChannelRequest {
        request_type: SecurityTokenRequestType::Renew,
        security_mode: SecurityMode::SignAndEncrypt,
        security_policy_uri: POLICY_URI_CHACHA20POLY1305.to_string(),
        client_nonce: vec![0u8; 32],
        requested_lifetime: 600_000,
    });
    conn.send_frame(Frame::secure(
        MessageKind::OpenChannel,
        ChunkFlag::Final,
        SecureHeader {
            channel_id,
            token_id: first_token,
            sequence_number: 2,
            request_id: 2,
        },
        &renew.encode().unwrap(),
    ))
    .await
    .unwrap();
    let frame = conn.recv_frame(&client_cancel).await.unwrap();
    let (_, body) = frame.split_secure().unwrap();
    let second_token = match Message::decode(body).unwrap() {
        Message::OpenChannelResponse(resp) => resp.token.token_id,
        other => panic!("unexpected renew response: {other:?}"),
    };
    assert_ne!(first_token, second_token);

    let old = SecurityToken::new(first_token, channel_id, TOKEN_LIFETIME);

    // An abort's empty body never sees the cipher, even mid-message.
    let partial = policy.protect(&old, &[0xAA; 32]).unwrap();
    conn.send_frame(Frame::secure(
        MessageKind::Message,
        ChunkFlag::Intermediate,
        SecureHeader {
            channel_id,
            token_id: first_token,
            sequence_number: 3,
            request_id: 7,
        },
        &partial,
    ))
    .await
    .unwrap();
    conn.send_frame(Frame::secure(
        MessageKind::Message,
        ChunkFlag::Abort,
        SecureHeader {
            channel_id,
            token_id: first_token,
            sequence_number: 4,
            request_id: 7,
        },
        &[],
    ))
    .await
    .unwrap();

    // The superseded token still decrypts inside its overlap window.
    let body = policy
        .protect(&old, &find_servers("opc.tcp://overlap:4840").encode().unwrap())
        .unwrap();
    conn.send_frame(Frame::secure(
        MessageKind::Message,
        ChunkFlag::Final,
        SecureHeader {
            channel_id,
            token_id: first_token,
            sequence_number: 5,
            request_id: 8,
        },
        &body,
    ))
    .await
    .unwrap();

    // A fabricated token id is rejected before decryption is attempted.
    let bogus = SecurityToken::new(0xDEAD, channel_id, TOKEN_LIFETIME);
    let body = policy
        .protect(&bogus, &find_servers("opc.tcp://x:4840").encode().unwrap())
        .unwrap();
    conn.send_frame(Frame::secure(
        MessageKind::Message,
        ChunkFlag::Final,
        SecureHeader {
            channel_id,
            token_id: 0xDEAD,
            sequence_number: 6,
            request_id: 9,
        },
        &body,
    ))
    .await
    .unwrap();

    match conn.recv_frame(&client_cancel).await {
        Err(UaError::PeerError { code, .. }) => {
            assert_eq!(code, status::BAD_SECURITY_CHECKS_FAILED);
        }
        other => panic!("expected ERR chunk, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn chunk_for_wrong_channel_id_is_fatal() {
    let (mut listener, endpoint) = bind(TransportParams::default()).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(async move {
        let mut channel = accept_channel(&mut listener, &cancel).await;
        channel.receive(&cancel).await
    });

    let mut raw = RawClient::open(&endpoint, TransportParams::default()).await;
    raw.channel_id = raw.channel_id.wrapping_add(100);
    let body = find_servers("opc.tcp://x:4840").encode().unwrap();
    raw.send_chunk(ChunkFlag::Final, 2, &body).await;

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, UaError::UnknownChannel(_)));
    assert_eq!(
        raw.expect_peer_error().await,
        status::BAD_SECURE_CHANNEL_ID_INVALID
    );
}
