//! Stream routing over the in-memory transport

use qtun_client::{ClientSession, ListenerConfig, ListenerSet};
use qtun_proto::{encode_frame, Framing, RouteDescriptor, UpstreamEndpoint};
use qtun_relay::{ChannelDevice, TunnelConfig};
use qtun_server::{serve_session, StreamRouter};
use qtun_session::{SessionConfig, TunnelSession};
use qtun_transport::memory::{connection_pair, MemoryConnection};
use qtun_upstream::{ConnectionPool, HealthConfig, HealthPolicy, UpstreamRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const SECRET: &str = "shared-secret";

struct Upstream {
    endpoint: UpstreamEndpoint,
    accepted: Arc<AtomicUsize>,
    received: Arc<AtomicUsize>,
}

/// Answers every read with "PONG" and counts what it sees
async fn pong_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
    let accepted = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(AtomicUsize::new(0));

    tokio::spawn({
        let accepted = accepted.clone();
        let received = received.clone();
        async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let received = received.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        received.fetch_add(n, Ordering::SeqCst);
                        if socket.write_all(b"PONG").await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    });

    Upstream {
        endpoint,
        accepted,
        received,
    }
}

fn session_config() -> SessionConfig {
    SessionConfig::default().with_grace_period(Duration::from_millis(200))
}

struct Harness {
    client: ClientSession<MemoryConnection>,
    server: TunnelSession<MemoryConnection>,
}

async fn start(router: StreamRouter, health: HealthConfig) -> Harness {
    let (client_conn, server_conn) = connection_pair();
    let server = TunnelSession::new(server_conn, session_config());
    tokio::spawn(serve_session(server.clone(), Arc::new(router), health));

    let client = ClientSession::establish(
        TunnelSession::new(client_conn, session_config()),
        SECRET.to_string(),
        TunnelConfig::default(),
    )
    .await
    .unwrap();

    Harness { client, server }
}

fn router_for(endpoints: Vec<UpstreamEndpoint>) -> StreamRouter {
    StreamRouter::new(
        SECRET,
        Arc::new(UpstreamRegistry::new(endpoints)),
        Arc::new(ConnectionPool::default()),
        TunnelConfig::default(),
    )
}

async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("reply expected")
        .unwrap();
    buf.to_vec()
}

#[tokio::test]
async fn test_discovery_lists_configured_upstreams() {
    let upstream = pong_upstream().await;
    let harness = start(router_for(vec![upstream.endpoint.clone()]), HealthConfig::default()).await;

    assert_eq!(harness.client.upstreams(), &[upstream.endpoint.clone()]);
}

#[tokio::test]
async fn test_raw_forward_through_local_listener() {
    let upstream = pong_upstream().await;
    let harness = start(router_for(vec![upstream.endpoint.clone()]), HealthConfig::default()).await;

    let listeners = ListenerSet::bind(
        harness.client.upstreams(),
        &ListenerConfig::default().with_remap(upstream.endpoint.port, 0),
    )
    .await
    .unwrap();
    let (_, local) = listeners.local_addrs()[0].clone();
    assert_ne!(local.port(), upstream.endpoint.port);

    let client = Arc::new(harness.client);
    tokio::spawn({
        let client = client.clone();
        async move { client.forward(listeners).await }
    });

    let mut app = TcpStream::connect(local).await.unwrap();
    app.write_all(b"PING").await.unwrap();
    assert_eq!(read_reply(&mut app).await, b"PONG");
    assert_eq!(upstream.received.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_chunked_forward_uses_pool() {
    let upstream = pong_upstream().await;
    let harness = start(router_for(vec![upstream.endpoint.clone()]), HealthConfig::default()).await;

    let listeners = ListenerSet::bind(
        harness.client.upstreams(),
        &ListenerConfig::default()
            .with_remap(upstream.endpoint.port, 0)
            .with_framing(Framing::Chunked),
    )
    .await
    .unwrap();
    let (_, local) = listeners.local_addrs()[0].clone();

    let client = Arc::new(harness.client);
    tokio::spawn({
        let client = client.clone();
        async move { client.forward(listeners).await }
    });

    for _ in 0..2 {
        let mut app = TcpStream::connect(local).await.unwrap();
        app.write_all(b"PING").await.unwrap();
        assert_eq!(read_reply(&mut app).await, b"PONG");
    }

    // Both connections shared one pooled upstream connection
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_chunked_forward_redials_after_upstream_hangs_up() {
    // One reply per connection, then the upstream closes it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = accepted.clone();
        async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 64];
                if matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {
                    let _ = socket.write_all(b"PONG").await;
                }
            }
        }
    });

    let harness = start(router_for(vec![endpoint.clone()]), HealthConfig::default()).await;
    let listeners = ListenerSet::bind(
        harness.client.upstreams(),
        &ListenerConfig::default()
            .with_remap(endpoint.port, 0)
            .with_framing(Framing::Chunked),
    )
    .await
    .unwrap();
    let (_, local) = listeners.local_addrs()[0].clone();

    let client = Arc::new(harness.client);
    tokio::spawn({
        let client = client.clone();
        async move { client.forward(listeners).await }
    });

    for _ in 0..2 {
        let mut app = TcpStream::connect(local).await.unwrap();
        app.write_all(b"PING").await.unwrap();
        assert_eq!(read_reply(&mut app).await, b"PONG");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(accepted.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_token_mismatch_forwards_nothing() {
    let upstream = pong_upstream().await;
    let harness = start(router_for(vec![upstream.endpoint.clone()]), HealthConfig::default()).await;

    let mut stream = harness.client.session().open_stream().await.unwrap();
    let route = RouteDescriptor::new("wrong-secret", &upstream.endpoint);
    stream
        .write_all(&encode_frame(&route, b"PING").unwrap())
        .await
        .unwrap();

    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("stream should be closed");
    assert!(read.is_err() || buf.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 0);
    assert_eq!(upstream.received.load(Ordering::SeqCst), 0);

    // The session survives a rejected stream
    assert!(harness.server.is_established());
    let mut stream = harness.client.session().open_stream().await.unwrap();
    let route = RouteDescriptor::new(SECRET, &upstream.endpoint);
    stream
        .write_all(&encode_frame(&route, b"PING").unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"PONG");
}

#[tokio::test]
async fn test_unknown_remote_host_is_rejected() {
    let upstream = pong_upstream().await;
    let harness = start(router_for(vec![upstream.endpoint.clone()]), HealthConfig::default()).await;

    let mut stream = harness.client.session().open_stream().await.unwrap();
    let route = RouteDescriptor::new(SECRET, &UpstreamEndpoint::tcp("10.255.255.1", 1));
    stream
        .write_all(&encode_frame(&route, b"PING").unwrap())
        .await
        .unwrap();

    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("stream should be closed");
    assert!(read.is_err() || buf.is_empty());
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_full_tunnel_packets() {
    let (server_device, mut server_side) = ChannelDevice::pair(8);
    let router = router_for(Vec::new()).with_device(Arc::new(server_device));
    let harness = start(router, HealthConfig::default()).await;

    let (client_device, client_side) = ChannelDevice::pair(8);
    let client = Arc::new(harness.client);
    tokio::spawn({
        let client = client.clone();
        async move { client.run_full_tunnel(Arc::new(client_device)).await }
    });

    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    client_side.inject(packet.clone()).await.unwrap();

    let delivered = timeout(Duration::from_secs(2), server_side.next_written())
        .await
        .expect("packet should cross the tunnel")
        .unwrap();
    assert_eq!(&delivered[..], &packet[..]);
}

#[tokio::test]
async fn test_unhealthy_upstream_tears_down_session() {
    // Accepts and immediately hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let health = HealthConfig {
        probe_timeout: Duration::from_millis(500),
        interval: Duration::from_millis(100),
        policy: HealthPolicy::TearDownSession,
    };
    let harness = start(router_for(vec![endpoint]), health).await;

    timeout(Duration::from_secs(5), harness.client.wait_closed())
        .await
        .expect("client should see the session end");
    assert!(!harness.server.is_established());
}
