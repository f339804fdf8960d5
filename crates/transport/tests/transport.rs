use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result as EyreResult};
use libp2p_identity::{KeyType, Keypair, PeerId};
use multiaddr::Multiaddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use wssh_transport::addr::is_dialable;
use wssh_transport::error::HandshakeError;
use wssh_transport::{
    Connection, ConnectionGater, ConnectionState, Direction, Error, Listener, PreSharedKey,
    StreamAcceptor, StreamOpener, Transport, TransportConfig,
};

const LOOPBACK: &str = "/ip4/127.0.0.1/tcp/0/ws";
const PATIENCE: Duration = Duration::from_secs(5);

fn loopback() -> Multiaddr {
    LOOPBACK.parse().unwrap()
}

async fn connect(
    server: &Transport,
    client: &Transport,
) -> EyreResult<(Listener, Connection, Connection)> {
    let listener = server.listen(&loopback()).await?;
    let addr = listener.multiaddr().clone();

    let (dialed, accepted) = tokio::join!(
        client.dial(&addr, server.local_peer()),
        listener.accept()
    );

    Ok((listener, dialed?, accepted?))
}

async fn ed25519_pair() -> EyreResult<(Transport, Transport, Listener, Connection, Connection)> {
    let server = Transport::new(Keypair::generate_ed25519())?;
    let client = Transport::new(Keypair::generate_ed25519())?;
    let (listener, dialed, accepted) = connect(&server, &client).await?;

    Ok((server, client, listener, dialed, accepted))
}

/// Sends `payload` from `from` to `to` over a fresh stream and returns what arrived.
async fn transfer(from: &Connection, to: &Connection, payload: &[u8]) -> EyreResult<Vec<u8>> {
    let (outbound, inbound) = tokio::join!(from.open_stream(), to.accept_stream());
    let (mut outbound, mut inbound) = (outbound?, inbound?);

    let send = async {
        outbound.write_all(payload).await?;
        outbound.shutdown().await
    };
    let receive = async {
        let mut received = Vec::new();
        let _n = inbound.read_to_end(&mut received).await?;
        Ok::<_, std::io::Error>(received)
    };

    let (sent, received) = timeout(PATIENCE, async { tokio::join!(send, receive) }).await?;
    sent?;
    Ok(received?)
}

#[tokio::test]
async fn test_dial_and_listen_authenticate_both_sides() -> EyreResult<()> {
    let (server, client, listener, dialed, accepted) = ed25519_pair().await?;

    assert!(is_dialable(listener.multiaddr()));
    assert!(client.can_dial(listener.multiaddr()));

    assert_eq!(dialed.local_peer(), client.local_peer());
    assert_eq!(dialed.remote_peer(), server.local_peer());
    assert_eq!(accepted.local_peer(), server.local_peer());
    assert_eq!(accepted.remote_peer(), client.local_peer());
    assert_eq!(
        accepted.remote_public_key(),
        &client.keypair().public()
    );

    assert_eq!(dialed.remote_multiaddr(), listener.multiaddr());
    assert_eq!(dialed.local_multiaddr(), accepted.remote_multiaddr());
    assert_eq!(dialed.remote_multiaddr(), accepted.local_multiaddr());

    assert_eq!(dialed.state(), ConnectionState::Established);
    assert_eq!(dialed.algorithms(), accepted.algorithms());
    assert_eq!(dialed.remote_banner(), server.config().handshake.banner);
    assert!(dialed.connect_time() <= dialed.last_seen());

    dialed.close().await?;
    let _closed = accepted.close().await;
    listener.close().await;
    Ok(())
}

#[tokio::test]
async fn test_stream_payload_sizes() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    for size in [0, 1, 64 * 1024 + 1, 3 * 1024 * 1024] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let received = transfer(&dialed, &accepted, &payload).await?;
        assert_eq!(received.len(), size, "payload of {size} bytes");
        assert_eq!(received, payload);

        let received = transfer(&accepted, &dialed, &payload).await?;
        assert_eq!(received, payload);
    }

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_hello_world_echo_with_half_close() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    let echo = tokio::spawn(async move {
        let mut stream = accepted.accept_stream().await?;
        assert_eq!(stream.remote_peer(), accepted.remote_peer());

        let mut request = Vec::new();
        let _n = stream.read_to_end(&mut request).await?;

        stream.write_all(&request).await?;
        stream.close()?;
        Ok::<_, eyre::Report>(request)
    });

    let mut stream = dialed.open_stream().await?;
    assert_eq!(stream.remote_addr(), dialed.remote_multiaddr());

    stream.write_all(b"Hello world!").await?;
    stream.close_write()?;

    let mut reply = Vec::new();
    let _n = timeout(PATIENCE, stream.read_to_end(&mut reply)).await??;

    assert_eq!(reply, b"Hello world!");
    assert_eq!(echo.await??, b"Hello world!");

    // Writing after end-of-stream fails, reading keeps returning end-of-stream.
    assert!(stream.write_all(b"late").await.is_err());
    assert_eq!(stream.read(&mut [0; 8]).await?, 0);

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_releases_blocked_accept_once() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    let waiter = {
        let accepted = accepted.clone();
        tokio::spawn(async move { accepted.accept_stream().await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    timeout(PATIENCE, accepted.close()).await??;
    assert!(matches!(waiter.await?, Err(Error::ConnectionClosed)));

    // Double close neither fails nor panics.
    timeout(PATIENCE, accepted.close()).await??;
    assert_eq!(accepted.state(), ConnectionState::Closed);
    assert!(matches!(accepted.open_stream().await, Err(Error::ConnectionClosed)));
    assert!(matches!(accepted.accept_stream().await, Err(Error::ConnectionClosed)));

    // The remote notices and releases its own waiters.
    let remote = timeout(PATIENCE, dialed.accept_stream()).await?;
    assert!(matches!(remote, Err(Error::ConnectionClosed)));
    assert!(dialed.is_closed());

    let _closed = dialed.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_with_full_stream_queue() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;
    let queue = accepted.transport().config().mux.stream_queue;

    // The remote queues `queue` streams, confirms one more and then stalls.
    let mut streams = Vec::new();
    for _ in 0..=queue {
        streams.push(timeout(PATIENCE, dialed.open_stream()).await??);
    }

    let blocked = {
        let dialed = dialed.clone();
        tokio::spawn(async move { dialed.open_stream().await })
    };
    sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    timeout(PATIENCE, dialed.close()).await??;
    assert!(matches!(blocked.await?, Err(Error::ConnectionClosed)));

    let _closed = timeout(PATIENCE, accepted.close()).await?;
    assert_eq!(accepted.state(), ConnectionState::Closed);

    drop(streams);
    Ok(())
}

#[tokio::test]
async fn test_keepalive_is_monotonic_and_keeps_connection_open() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    let mut remote_seen = accepted.last_seen();
    let mut local_seen = dialed.last_seen();

    for _ in 0..5 {
        dialed.keepalive().await?;

        assert!(accepted.last_seen() > remote_seen);
        assert!(dialed.last_seen() > local_seen);
        remote_seen = accepted.last_seen();
        local_seen = dialed.last_seen();
    }

    assert_eq!(dialed.state(), ConnectionState::Established);
    assert_eq!(accepted.state(), ConnectionState::Established);

    let received = transfer(&dialed, &accepted, b"still alive").await?;
    assert_eq!(received, b"still alive");

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_requests_are_rejected() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    let rejected = dialed.send_request("tcpip-forward", true, b"0.0.0.0:22".to_vec()).await;
    assert!(matches!(rejected, Err(Error::RequestRejected(name)) if name == "tcpip-forward"));

    let unanswered = dialed.send_request("no-more-sessions@openssh.com", false, Vec::new()).await?;
    assert_eq!(unanswered, None);

    // Replies stay matched to their requests.
    let (a, b, c) = tokio::join!(
        accepted.keepalive(),
        accepted.send_request("env", true, Vec::new()),
        accepted.keepalive(),
    );
    a?;
    assert!(matches!(b, Err(Error::RequestRejected(_))));
    c?;

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_oversized_request_is_rejected_without_closing() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    for want_reply in [false, true] {
        let result = dialed.send_request("big", want_reply, vec![0; 70_000]).await;
        assert!(matches!(
            result,
            Err(Error::PayloadTooLarge { size, max }) if size > max
        ));
    }

    sleep(Duration::from_millis(50)).await;
    assert_eq!(dialed.state(), ConnectionState::Established);
    assert_eq!(accepted.state(), ConnectionState::Established);

    dialed.keepalive().await?;
    let received = transfer(&dialed, &accepted, b"after the big one").await?;
    assert_eq!(received, b"after the big one");

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_ecdsa_identities_end_to_end() -> EyreResult<()> {
    let server = Transport::new(Keypair::generate_ecdsa())?;
    let client = Transport::new(Keypair::generate_ecdsa())?;
    let (_listener, dialed, accepted) = connect(&server, &client).await?;

    assert_eq!(dialed.remote_public_key().key_type(), KeyType::Ecdsa);
    assert_eq!(accepted.remote_peer(), client.local_peer());

    let received = transfer(&accepted, &dialed, b"ecdsa").await?;
    assert_eq!(received, b"ecdsa");

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_mixed_key_types() -> EyreResult<()> {
    let server = Transport::new(Keypair::generate_ecdsa())?;
    let client = Transport::new(Keypair::generate_ed25519())?;
    let (_listener, dialed, accepted) = connect(&server, &client).await?;

    assert_eq!(dialed.remote_public_key().key_type(), KeyType::Ecdsa);
    assert_eq!(accepted.remote_public_key().key_type(), KeyType::Ed25519);

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_key_type() {
    let result = Transport::new(Keypair::generate_secp256k1());

    assert!(matches!(result, Err(Error::UnsupportedKeyType(KeyType::Secp256k1))));
}

#[tokio::test]
async fn test_dial_rejects_unexpected_peer() -> EyreResult<()> {
    let server = Transport::new(Keypair::generate_ed25519())?;
    let client = Transport::new(Keypair::generate_ed25519())?;
    let listener = server.listen(&loopback()).await?;
    let impostor = PeerId::random();

    let (dialed, accepted) = tokio::join!(
        client.dial(listener.multiaddr(), impostor),
        listener.accept()
    );

    match dialed {
        Err(Error::Handshake(HandshakeError::PeerMismatch { expected, actual })) => {
            assert_eq!(expected, impostor);
            assert_eq!(actual, server.local_peer());
        }
        other => bail!("expected a peer mismatch, got {other:?}"),
    }

    // The dialer hangs up right after authenticating.
    let accepted = accepted?;
    let next = timeout(PATIENCE, accepted.accept_stream()).await?;
    assert!(matches!(next, Err(Error::ConnectionClosed)));

    Ok(())
}

#[tokio::test]
async fn test_pre_shared_key_must_match() -> EyreResult<()> {
    let psk: PreSharedKey = "11".repeat(32).parse()?;
    let other: PreSharedKey = "22".repeat(32).parse()?;

    let server = Transport::builder(Keypair::generate_ed25519())
        .psk(psk)
        .build()?;
    let member = Transport::builder(Keypair::generate_ed25519())
        .psk(psk)
        .build()?;
    let outsider = Transport::builder(Keypair::generate_ed25519())
        .psk(other)
        .build()?;

    let (_listener, dialed, _accepted) = connect(&server, &member).await?;
    dialed.close().await?;

    let listener = server.listen(&loopback()).await?;
    let (dialed, accepted) = tokio::join!(
        outsider.dial(listener.multiaddr(), server.local_peer()),
        listener.accept()
    );
    assert!(matches!(dialed, Err(Error::Handshake(_))));
    assert!(matches!(accepted, Err(Error::Handshake(_))));

    Ok(())
}

#[tokio::test]
async fn test_listener_close_releases_accept() -> EyreResult<()> {
    let server = Transport::new(Keypair::generate_ed25519())?;
    let listener = Arc::new(server.listen(&loopback()).await?);

    let waiter = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await })
    };
    sleep(Duration::from_millis(50)).await;

    timeout(PATIENCE, listener.close()).await?;
    timeout(PATIENCE, listener.close()).await?;

    assert!(matches!(waiter.await?, Err(Error::ListenerClosed)));
    assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));

    // Nothing is served on the address any more.
    let client = Transport::new(Keypair::generate_ed25519())?;
    let dialed = client.dial(listener.multiaddr(), server.local_peer()).await;
    assert!(dialed.is_err());

    Ok(())
}

#[derive(Default)]
struct CountingGater {
    accepts: AtomicUsize,
    refuse_peer: Option<PeerId>,
}

impl ConnectionGater for CountingGater {
    fn intercept_peer_dial(&self, peer: &PeerId) -> bool {
        self.refuse_peer != Some(*peer)
    }

    fn intercept_accept(&self, _local: &Multiaddr, _remote: &Multiaddr) -> bool {
        // Refuse the first inbound connection only.
        self.accepts.fetch_add(1, Ordering::SeqCst) > 0
    }

    fn intercept_secured(
        &self,
        direction: Direction,
        peer: &PeerId,
        _local: &Multiaddr,
        _remote: &Multiaddr,
    ) -> bool {
        direction == Direction::Outbound || self.refuse_peer != Some(*peer)
    }
}

#[tokio::test]
async fn test_gater_is_consulted() -> EyreResult<()> {
    let server = Transport::builder(Keypair::generate_ed25519())
        .gater(Arc::new(CountingGater::default()))
        .build()?;
    let client = Transport::new(Keypair::generate_ed25519())?;
    let listener = server.listen(&loopback()).await?;

    // The first connection is gated before its handshake and silently skipped.
    let first = {
        let client = client.clone();
        let addr = listener.multiaddr().clone();
        let peer = server.local_peer();
        tokio::spawn(async move { client.dial(&addr, peer).await })
    };
    let second = {
        let client = client.clone();
        let addr = listener.multiaddr().clone();
        let peer = server.local_peer();
        async move {
            sleep(Duration::from_millis(100)).await;
            client.dial(&addr, peer).await
        }
    };

    let (dialed, accepted) = tokio::join!(second, listener.accept());
    let (dialed, accepted) = (dialed?, accepted?);
    assert_eq!(accepted.remote_peer(), client.local_peer());
    assert!(timeout(PATIENCE, first).await??.is_err());

    dialed.close().await?;

    let refusing = Transport::builder(Keypair::generate_ed25519())
        .gater(Arc::new(CountingGater {
            refuse_peer: Some(server.local_peer()),
            ..CountingGater::default()
        }))
        .build()?;
    let gated = refusing.dial(listener.multiaddr(), server.local_peer()).await;
    assert!(matches!(gated, Err(Error::Gated(_))));

    Ok(())
}

#[tokio::test]
async fn test_dial_rejects_malformed_addresses() -> EyreResult<()> {
    let client = Transport::new(Keypair::generate_ed25519())?;
    let peer = PeerId::random();

    for addr in ["/ip4/127.0.0.1/tcp/1", "/ip4/127.0.0.1/udp/1/quic-v1", "/ip4/127.0.0.1/tcp/1/wss"] {
        let result = client.dial(&addr.parse()?, peer).await;
        assert!(
            matches!(result, Err(Error::AddressFormat(_))),
            "{addr} should be rejected"
        );
    }

    assert_eq!(client.protocols(), [477]);
    assert!(!client.proxy());
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = TransportConfig::default();
    config.handshake.ciphers.clear();

    let result = Transport::builder(Keypair::generate_ed25519())
        .config(config)
        .build();

    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_stream_read_deadline() -> EyreResult<()> {
    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    let (outbound, inbound) = tokio::join!(dialed.open_stream(), accepted.accept_stream());
    let (mut outbound, mut inbound) = (outbound?, inbound?);

    inbound.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
    let err = timeout(PATIENCE, inbound.read(&mut [0; 8])).await?.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    inbound.set_read_deadline(None);
    outbound.write_all(b"late").await?;
    let mut buf = [0; 4];
    inbound.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"late");

    dialed.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_capability_traits() -> EyreResult<()> {
    async fn roundtrip(
        opener: &dyn StreamOpener,
        acceptor: &dyn StreamAcceptor,
    ) -> EyreResult<Vec<u8>> {
        let (outbound, inbound) = tokio::join!(opener.open_stream(), acceptor.accept_stream());
        let (mut outbound, mut inbound) = (outbound?, inbound?);

        outbound.write_all(b"via traits").await?;
        outbound.close_write()?;

        let mut received = Vec::new();
        let _n = inbound.read_to_end(&mut received).await?;
        Ok(received)
    }

    let (_server, _client, _listener, dialed, accepted) = ed25519_pair().await?;

    assert_eq!(roundtrip(&dialed, &accepted).await?, b"via traits");

    dialed.close().await?;
    Ok(())
}
