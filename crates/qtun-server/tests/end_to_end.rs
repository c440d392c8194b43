//! Server and client over real QUIC with mutual TLS

use qtun_cert::{CertificateAuthority, TlsMaterial};
use qtun_client::{
    ClientConfig, ClientError, ClientSession, ListenerConfig, ListenerSet, TunnelClient,
};
use qtun_proto::UpstreamEndpoint;
use qtun_server::{ServerConfig, ServerError, TunnelServer};
use qtun_session::{SessionConfig, SessionError};
use qtun_transport_quic::{QuicConfig, QuicConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "e2e-secret";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("qtun_server=debug,qtun_client=debug,qtun_session=debug")
        .with_test_writer()
        .try_init();
}

struct Pki {
    server: TlsMaterial,
    client: TlsMaterial,
}

fn pki() -> Pki {
    init_tracing();
    let ca = CertificateAuthority::generate("e2e ca").unwrap();
    Pki {
        server: ca.issue_material("server", &["localhost"]).unwrap(),
        client: ca.issue_material("client", &["client"]).unwrap(),
    }
}

async fn pong_upstream() -> UpstreamEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(b"PONG").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    endpoint
}

fn fast_session() -> SessionConfig {
    SessionConfig::default()
        .with_keep_alive(Duration::from_millis(200))
        .with_idle_timeout(Duration::from_millis(500))
        .with_grace_period(Duration::from_millis(200))
}

async fn start_server(
    upstream: &UpstreamEndpoint,
    tls: TlsMaterial,
) -> (std::net::SocketAddr, CancellationToken) {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), vec![upstream.clone()], SECRET)
        .with_session(fast_session());
    let server = TunnelServer::bind(config, QuicConfig::new(tls)).await.unwrap();
    let addr = server.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.run(shutdown).await }
    });
    (addr, shutdown)
}

fn client_for(addr: std::net::SocketAddr, quic: QuicConfig) -> TunnelClient {
    let config = ClientConfig::new(addr.to_string(), "localhost", SECRET).with_session(fast_session());
    TunnelClient::new(config, quic).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pong_through_tunnel() {
    let pki = pki();
    let upstream = pong_upstream().await;
    let (addr, _shutdown) = start_server(&upstream, pki.server).await;

    let client = client_for(addr, QuicConfig::new(pki.client));
    let session = timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect timed out")
        .unwrap();
    assert_eq!(session.upstreams(), &[upstream.clone()]);
    assert!(session.session().peer_identity().is_authenticated());

    ping_through(session, &upstream).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_outlives_idle_timeout_with_heartbeats() {
    let pki = pki();
    let upstream = pong_upstream().await;
    let (addr, _shutdown) = start_server(&upstream, pki.server).await;

    let client = client_for(addr, QuicConfig::new(pki.client));
    let session = client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(session.session().is_established());

    let stream = session.session().open_stream().await;
    assert!(stream.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_shutdown_closes_client_session() {
    let pki = pki();
    let upstream = pong_upstream().await;
    let (addr, shutdown) = start_server(&upstream, pki.server).await;

    let client = client_for(addr, QuicConfig::new(pki.client));
    let session = client.connect().await.unwrap();

    shutdown.cancel();
    timeout(Duration::from_secs(5), session.wait_closed())
        .await
        .expect("client should observe the server going away");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_alpn_mismatch_is_rejected() {
    let pki = pki();
    let upstream = pong_upstream().await;
    let (addr, _shutdown) = start_server(&upstream, pki.server).await;

    let quic = QuicConfig::new(pki.client).with_alpn_protocols(vec!["not-a-tunnel".to_string()]);
    let client = client_for(addr, quic);

    let result = timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect should fail promptly");
    assert!(matches!(
        result,
        Err(ClientError::Session(SessionError::ConnectFailed(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_fails_with_unhealthy_upstream() {
    let pki = pki();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);

    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), vec![endpoint.clone()], SECRET);
    let result = TunnelServer::bind(config, QuicConfig::new(pki.server)).await;
    match result {
        Err(ServerError::UnhealthyUpstreams(unhealthy)) => assert_eq!(unhealthy, vec![endpoint.key()]),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("bind should fail"),
    }
}

/// Expose `upstream` locally through `session` and check one PING/PONG
async fn ping_through(session: ClientSession<QuicConnection>, upstream: &UpstreamEndpoint) {
    let listeners = ListenerSet::bind(
        session.upstreams(),
        &ListenerConfig::default().with_remap(upstream.port, 0),
    )
    .await
    .unwrap();
    let (_, local) = listeners.local_addrs()[0].clone();

    let session = Arc::new(session);
    tokio::spawn({
        let session = session.clone();
        async move { session.forward(listeners).await }
    });

    let mut app = TcpStream::connect(local).await.unwrap();
    app.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), app.read_exact(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    assert_eq!(&buf, b"PONG");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_handshakes_do_not_stop_accepting() {
    let pki = pki();
    let upstream = pong_upstream().await;
    let trusted_roots = pki.server.roots.clone();
    let (addr, _shutdown) = start_server(&upstream, pki.server).await;

    // Wrong ALPN
    let quic = QuicConfig::new(pki.client.clone())
        .with_alpn_protocols(vec!["not-a-tunnel".to_string()]);
    let result = timeout(Duration::from_secs(5), client_for(addr, quic).connect())
        .await
        .expect("connect should fail promptly");
    assert!(result.is_err());

    // Certificate from a CA the server does not trust
    let rogue = CertificateAuthority::generate("rogue ca").unwrap();
    let mut untrusted = rogue.issue_material("client", &["client"]).unwrap();
    untrusted.roots = trusted_roots;
    let result = timeout(
        Duration::from_secs(5),
        client_for(addr, QuicConfig::new(untrusted)).connect(),
    )
    .await
    .expect("connect should fail promptly");
    assert!(result.is_err());

    let session = timeout(
        Duration::from_secs(5),
        client_for(addr, QuicConfig::new(pki.client)).connect(),
    )
    .await
    .expect("connect timed out")
    .unwrap();
    ping_through(session, &upstream).await;
}
