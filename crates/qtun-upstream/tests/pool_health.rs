//! Pool and health supervision against real local TCP listeners

use qtun_proto::UpstreamEndpoint;
use qtun_upstream::{
    ConnectionPool, HealthConfig, HealthPolicy, HealthState, HealthSupervisor, PoolConfig,
    SupervisorExit, UpstreamError, UpstreamRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn endpoint_for(listener: &TcpListener) -> UpstreamEndpoint {
    UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port())
}

/// Accepts connections and holds them open without writing
async fn silent_upstream() -> (UpstreamEndpoint, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    let handle = tokio::spawn(async move {
        let mut held: Vec<TcpStream> = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (endpoint, handle)
}

/// Answers every read with "PONG"
async fn pong_upstream() -> UpstreamEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
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

fn fast_health(policy: HealthPolicy) -> HealthConfig {
    HealthConfig {
        probe_timeout: Duration::from_millis(200),
        interval: Duration::from_millis(100),
        policy,
    }
}

fn supervisor(
    endpoints: Vec<UpstreamEndpoint>,
    policy: HealthPolicy,
) -> (HealthSupervisor, Arc<UpstreamRegistry>, Arc<ConnectionPool>) {
    let registry = Arc::new(UpstreamRegistry::new(endpoints));
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let supervisor = HealthSupervisor::new(registry.clone(), pool.clone(), fast_health(policy));
    (supervisor, registry, pool)
}

#[tokio::test]
async fn test_pool_reuses_connection() {
    let (endpoint, _upstream) = silent_upstream().await;
    let pool = ConnectionPool::default();

    let first = pool.get_or_connect(&endpoint).await.unwrap();
    let second = pool.get_or_connect(&endpoint).await.unwrap();

    assert!(first.same_connection(&second));
    assert_eq!(first.id(), second.id());
    assert_eq!(pool.len().await, 1);
}

#[tokio::test]
async fn test_dial_refused_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    drop(listener);

    let pool = ConnectionPool::default();
    let result = pool.get_or_connect(&endpoint).await;
    assert!(matches!(result, Err(UpstreamError::Unreachable { .. })));
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn test_silent_upstream_is_healthy() {
    let (endpoint, _upstream) = silent_upstream().await;
    let (supervisor, registry, pool) = supervisor(vec![endpoint.clone()], HealthPolicy::default());

    assert!(supervisor.health_check_all().await);
    assert_eq!(registry.health(&endpoint.key()).await, HealthState::Healthy);
    assert!(pool.connection_id(&endpoint.key()).await.is_some());
}

#[tokio::test]
async fn test_closed_upstream_is_unhealthy_and_evicted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
        let _ = closed_tx.send(());
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (supervisor, registry, pool) = supervisor(vec![endpoint.clone()], HealthPolicy::default());
    let pooled = pool.get_or_connect(&endpoint).await.unwrap();
    closed_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = supervisor.check_all().await;
    assert_eq!(report.unhealthy, vec![endpoint.key()]);
    assert_eq!(registry.health(&endpoint.key()).await, HealthState::Unhealthy);
    assert_ne!(pool.connection_id(&endpoint.key()).await, Some(pooled.id()));
}

#[tokio::test]
async fn test_health_deadline_covers_busy_connection() {
    let (endpoint, _upstream) = silent_upstream().await;
    let (supervisor, registry, pool) = supervisor(vec![endpoint.clone()], HealthPolicy::default());

    // A silent upstream keeps this exchange holding the socket for its whole reply timeout
    let pending = tokio::spawn({
        let pool = pool.clone();
        let endpoint = endpoint.clone();
        async move { pool.exchange(&endpoint, b"PING").await }
    });
    timeout(Duration::from_secs(2), async {
        while pool.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("exchange should pool a connection");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    assert!(supervisor.health_check_all().await);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(registry.health(&endpoint.key()).await, HealthState::Healthy);

    pending.abort();
}

#[tokio::test]
async fn test_exchange_round_trip() {
    let endpoint = pong_upstream().await;
    let pool = ConnectionPool::default();

    let reply = pool.exchange(&endpoint, b"PING").await.unwrap();
    assert_eq!(&reply[..], b"PONG");

    let id = pool.connection_id(&endpoint.key()).await;
    let reply = pool.exchange(&endpoint, b"PING").await.unwrap();
    assert_eq!(&reply[..], b"PONG");
    assert_eq!(pool.connection_id(&endpoint.key()).await, id);
}

#[tokio::test]
async fn test_exchange_failure_evicts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    tokio::spawn(async move {
        // Read the request, then hang up without answering
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let _ = socket.read(&mut buf).await;
    });

    let pool = ConnectionPool::default();
    let result = pool.exchange(&endpoint, b"PING").await;
    assert!(matches!(result, Err(UpstreamError::Io { .. })));
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn test_supervisor_tears_down_on_unhealthy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    drop(listener);

    let (supervisor, _registry, _pool) = supervisor(vec![endpoint.clone()], HealthPolicy::TearDownSession);
    let exit = timeout(Duration::from_secs(5), supervisor.run(CancellationToken::new()))
        .await
        .expect("supervisor should exit");

    match exit {
        SupervisorExit::Unhealthy(report) => assert_eq!(report.unhealthy, vec![endpoint.key()]),
        other => panic!("unexpected exit: {:?}", other),
    }
}

#[tokio::test]
async fn test_supervisor_isolates_and_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    let port = endpoint.port;
    drop(listener);

    let (supervisor, registry, _pool) = supervisor(vec![endpoint.clone()], HealthPolicy::IsolateEndpoint);
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        async move { supervisor.run(cancel).await }
    });

    // Wait for a pass to mark it down
    timeout(Duration::from_secs(5), async {
        while registry.is_routable(&endpoint.key()).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("endpoint should be isolated");
    assert!(!run.is_finished());

    // Bring the upstream back on the same port
    let revived = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = revived.accept().await {
            held.push(socket);
        }
    });

    timeout(Duration::from_secs(5), async {
        while registry.health(&endpoint.key()).await != HealthState::Healthy {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("endpoint should recover");

    cancel.cancel();
    assert_eq!(run.await.unwrap(), SupervisorExit::Cancelled);
}
