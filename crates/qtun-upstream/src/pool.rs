//! Persistent upstream connections

use bytes::Bytes;
use qtun_proto::UpstreamEndpoint;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{UpstreamError, UpstreamResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on establishing a TCP connection
    pub dial_timeout: Duration,

    /// TCP keep-alive idle time on upstream sockets
    pub tcp_keepalive: Duration,

    /// How long a chunk exchange waits for the upstream's reply
    pub response_timeout: Duration,

    /// Largest reply read in one exchange
    pub response_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            tcp_keepalive: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            response_buffer: 64 * 1024,
        }
    }
}

/// Dial a fresh connection to `endpoint`
pub async fn dial(endpoint: &UpstreamEndpoint, config: &PoolConfig) -> UpstreamResult<TcpStream> {
    let key = endpoint.key();

    let stream = match timeout(
        config.dial_timeout,
        TcpStream::connect((endpoint.address.as_str(), endpoint.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(UpstreamError::Unreachable {
                endpoint: key,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(UpstreamError::Unreachable {
                endpoint: key,
                reason: format!("dial timed out after {:?}", config.dial_timeout),
            })
        }
    };

    let keepalive = TcpKeepalive::new().with_time(config.tcp_keepalive);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        warn!("Failed to enable TCP keep-alive for {}: {}", key, e);
    }
    let _ = stream.set_nodelay(true);

    debug!("Dialed upstream {}", key);
    Ok(stream)
}

/// A shared handle to one pooled upstream connection
///
/// Clones refer to the same socket; use [`PooledConnection::lock`] for exclusive use.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    id: u64,
    key: String,
    stream: Arc<Mutex<TcpStream>>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn lock(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }

    pub fn same_connection(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }

    /// Non-blocking check that the upstream has not closed or reset the socket
    ///
    /// A connection held by an exchange counts as alive.
    fn is_alive(&self) -> bool {
        let Ok(stream) = self.stream.try_lock() else {
            return true;
        };

        let mut byte = [MaybeUninit::<u8>::uninit(); 1];
        match SockRef::from(&*stream).peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        }
    }
}

/// Connection pool keyed by `address:port`
///
/// All access goes through one lock, including the dial on a miss, so two
/// callers racing for the same key end up sharing one connection.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    connections: Mutex<HashMap<String, PooledConnection>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the live pooled connection for `endpoint`, dialing one if needed
    ///
    /// A pooled connection the upstream has closed is dropped and replaced.
    pub async fn get_or_connect(
        &self,
        endpoint: &UpstreamEndpoint,
    ) -> UpstreamResult<PooledConnection> {
        let key = endpoint.key();
        let mut connections = self.connections.lock().await;

        match connections.get(&key) {
            Some(existing) if existing.is_alive() => return Ok(existing.clone()),
            Some(stale) => {
                info!("Pooled connection {} to {} is closed, redialing", stale.id, key);
                connections.remove(&key);
            }
            None => {}
        }

        let stream = dial(endpoint, &self.config).await?;
        let conn = PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            stream: Arc::new(Mutex::new(stream)),
        };

        info!("Pooled new connection {} to {}", conn.id, key);
        connections.insert(key, conn.clone());

        Ok(conn)
    }

    /// Drop `conn` from the pool unless it was already replaced
    pub async fn evict(&self, conn: &PooledConnection) -> bool {
        let mut connections = self.connections.lock().await;
        match connections.get(&conn.key) {
            Some(current) if current.same_connection(conn) => {
                connections.remove(&conn.key);
                info!("Evicted pooled connection {} to {}", conn.id, conn.key);
                true
            }
            _ => false,
        }
    }

    /// The pooled connection for `key` as it stands, without a liveness check
    pub async fn get(&self, key: &str) -> Option<PooledConnection> {
        self.connections.lock().await.get(key).cloned()
    }

    /// Id of the pooled connection for `key`, if any
    pub async fn connection_id(&self, key: &str) -> Option<u64> {
        self.connections.lock().await.get(key).map(|c| c.id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Drop every pooled connection
    pub async fn clear(&self) {
        self.connections.lock().await.clear();
    }

    /// Write `request` on the pooled connection and read one reply
    ///
    /// Any I/O failure evicts the connection so the next exchange redials.
    pub async fn exchange(
        &self,
        endpoint: &UpstreamEndpoint,
        request: &[u8],
    ) -> UpstreamResult<Bytes> {
        let conn = self.get_or_connect(endpoint).await?;

        let result = async {
            let mut stream = conn.lock().await;
            stream.write_all(request).await?;

            let mut buf = vec![0u8; self.config.response_buffer];
            let n = timeout(self.config.response_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply from upstream"))??;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed the connection",
                ));
            }

            buf.truncate(n);
            Ok::<_, io::Error>(Bytes::from(buf))
        }
        .await;

        match result {
            Ok(reply) => Ok(reply),
            Err(source) => {
                warn!("Exchange with {} failed: {}", conn.key, source);
                self.evict(&conn).await;
                Err(UpstreamError::Io {
                    endpoint: conn.key.clone(),
                    source,
                })
            }
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, UpstreamEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = UpstreamEndpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
        (listener, endpoint)
    }

    #[tokio::test]
    async fn test_closed_connection_is_redialed() {
        let (listener, endpoint) = listener().await;
        let pool = ConnectionPool::default();

        let first = pool.get_or_connect(&endpoint).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        drop(accepted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = pool.get_or_connect(&endpoint).await.unwrap();
        assert!(!first.same_connection(&second));
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.connection_id(&endpoint.key()).await, Some(second.id()));
    }

    #[tokio::test]
    async fn test_exchange_survives_idle_close() {
        let (listener, endpoint) = listener().await;
        // One reply per connection, then hang up
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                if matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {
                    let _ = socket.write_all(b"PONG").await;
                }
            }
        });

        let pool = ConnectionPool::default();
        for _ in 0..2 {
            let reply = pool.exchange(&endpoint, b"PING").await.unwrap();
            assert_eq!(&reply[..], b"PONG");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_busy_connection_is_reused() {
        let (listener, endpoint) = listener().await;
        let pool = ConnectionPool::default();

        let first = pool.get_or_connect(&endpoint).await.unwrap();
        let (_accepted, _) = listener.accept().await.unwrap();
        let _held = first.lock().await;

        let second = pool.get_or_connect(&endpoint).await.unwrap();
        assert!(first.same_connection(&second));
    }
}
