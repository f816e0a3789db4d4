//! End-to-end sessions over real sockets against an in-process endpoint.

use std::sync::Arc;

use bytes::BytesMut;
use redirection_core::{
    AuthChallenge, AuthRequest, AuthStatus, AuthType, ConnectionParameters, EndpointId,
    HandshakeMessage, RedirectionKind, StartStatus,
};
use redirection_server::channel::ChannelError;
use redirection_server::{
    RedirectionError, RedirectionService, ServiceConfig, StaticDirectory, TcpConnector,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const BANNER: &[u8] = b"login: ";

async fn read_message(stream: &mut TcpStream, buf: &mut BytesMut) -> HandshakeMessage {
    loop {
        if let Some(message) = HandshakeMessage::decode(buf).expect("well-formed frame") {
            return message;
        }
        let read = stream.read_buf(buf).await.expect("endpoint read");
        assert!(read > 0, "client hung up mid-handshake");
    }
}

async fn write_message(stream: &mut TcpStream, message: HandshakeMessage, trailer: &[u8]) {
    let mut frame = message.encode().expect("encode reply").to_vec();
    frame.extend_from_slice(trailer);
    stream.write_all(&frame).await.expect("endpoint write");
}

/// Plays the management controller side: start, query challenge advertising
/// user-pass only, then accepts the user-pass login followed by a banner.
async fn accept_handshake(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let mut buf = BytesMut::new();

    let start = read_message(&mut stream, &mut buf).await;
    assert_eq!(
        start,
        HandshakeMessage::StartRedirectionSession {
            kind: RedirectionKind::Sol
        }
    );
    write_message(
        &mut stream,
        HandshakeMessage::start_reply(StartStatus::Success),
        &[],
    )
    .await;

    let query = read_message(&mut stream, &mut buf).await;
    assert_eq!(query, HandshakeMessage::AuthenticateSession(AuthRequest::Query));
    write_message(
        &mut stream,
        HandshakeMessage::AuthenticateSessionReply {
            status: AuthStatus::Success,
            auth_type: AuthType::Query,
            challenge: AuthChallenge::advertising([AuthType::UserPass]),
        },
        &[],
    )
    .await;

    match read_message(&mut stream, &mut buf).await {
        HandshakeMessage::AuthenticateSession(AuthRequest::UserPass { username, password }) => {
            assert_eq!(username, "admin");
            assert_eq!(password, "P@ssw0rd");
        }
        other => panic!("expected user-pass login, got {other:?}"),
    }
    write_message(
        &mut stream,
        HandshakeMessage::auth_reply(AuthStatus::Success, AuthType::UserPass),
        BANNER,
    )
    .await;
    stream
}

async fn bind() -> (TcpListener, RedirectionService) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let directory = StaticDirectory::from_entries([(
        "lab-1".into(),
        ConnectionParameters::new("127.0.0.1", "admin", "P@ssw0rd").with_port(port),
    )]);
    let service = RedirectionService::new(
        Arc::new(directory),
        Arc::new(TcpConnector),
        ServiceConfig::default(),
    );
    (listener, service)
}

async fn receive_exactly(service: &RedirectionService, id: &EndpointId, len: usize) -> Vec<u8> {
    let mut received = Vec::new();
    while received.len() < len {
        let chunk = service.receive(id).await.expect("receive");
        received.extend_from_slice(&chunk);
    }
    received
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn full_session_over_tcp() {
    let (listener, service) = bind().await;
    let endpoint = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut echoed = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = stream.read(&mut chunk).await.unwrap_or(0);
            if read == 0 {
                break;
            }
            echoed.extend_from_slice(&chunk[..read]);
            if stream.write_all(&chunk[..read]).await.is_err() {
                break;
            }
        }
        echoed
    });

    let lab: EndpointId = "lab-1".into();
    let handle = service.open(&lab).await.expect("open over tcp");
    assert_eq!(handle.auth_type, AuthType::UserPass);
    assert_eq!(handle.protocol_version.major, 1);

    assert_eq!(receive_exactly(&service, &lab, BANNER.len()).await, BANNER);
    service.send(&lab, &b"ping"[..]).await.expect("send");
    assert_eq!(receive_exactly(&service, &lab, 4).await, b"ping");

    service.close(&lab).await;
    assert!(service.lookup(&lab).is_none());
    assert_eq!(endpoint.await.expect("endpoint task"), b"ping");
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn peer_hangup_evicts_the_session() {
    let (listener, service) = bind().await;
    let endpoint = tokio::spawn(async move {
        let stream = accept_handshake(&listener).await;
        drop(stream);
    });

    let lab: EndpointId = "lab-1".into();
    service.open(&lab).await.expect("open over tcp");
    endpoint.await.expect("endpoint task");

    assert_eq!(receive_exactly(&service, &lab, BANNER.len()).await, BANNER);
    let err = service.receive(&lab).await.expect_err("peer is gone");
    assert!(matches!(
        err,
        RedirectionError::TransportFailed(ChannelError::Closed | ChannelError::Io(_))
    ));
    assert!(service.lookup(&lab).is_none());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn refused_connection_is_a_transport_failure() {
    let (listener, service) = bind().await;
    drop(listener);

    let lab: EndpointId = "lab-1".into();
    let err = service.open(&lab).await.expect_err("nothing is listening");
    assert!(matches!(
        err,
        RedirectionError::TransportFailed(ChannelError::Connect { .. })
    ));
    assert!(service.registry().is_empty());
}
