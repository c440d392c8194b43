//! In-memory transport
//!
//! [`connection_pair`] returns two connected endpoints whose streams are
//! backed by `tokio::io::duplex`. Closing either side closes both and fails
//! pending reads on every stream, like a QUIC connection close.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::{
    ConnectionStats, PeerIdentity, TransportConnection, TransportError, TransportResult,
    TransportStream,
};

const STREAM_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Shared {
    closed: CancellationToken,
    reason: StdMutex<Option<String>>,
}

/// One end of an in-memory connection
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    side: u64,
    remote: SocketAddr,
    identity: PeerIdentity,
    outgoing: mpsc::Sender<MemoryStream>,
    incoming: Mutex<mpsc::Receiver<MemoryStream>>,
    next_stream: AtomicU64,
    shared: Arc<Shared>,
    created_at: Instant,
}

/// Create a connected client/server pair
pub fn connection_pair() -> (MemoryConnection, MemoryConnection) {
    let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::new(Shared {
        closed: CancellationToken::new(),
        reason: StdMutex::new(None),
    });
    let (to_server, server_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let (to_client, client_rx) = mpsc::channel(ACCEPT_BACKLOG);

    let client = MemoryConnection {
        id,
        side: 0,
        remote: SocketAddr::from(([127, 0, 0, 1], 4433)),
        identity: PeerIdentity::default(),
        outgoing: to_server,
        incoming: Mutex::new(client_rx),
        next_stream: AtomicU64::new(0),
        shared: shared.clone(),
        created_at: Instant::now(),
    };
    let server = MemoryConnection {
        id,
        side: 1,
        remote: SocketAddr::from(([127, 0, 0, 1], 50000)),
        identity: PeerIdentity::default(),
        outgoing: to_client,
        incoming: Mutex::new(server_rx),
        next_stream: AtomicU64::new(0),
        shared,
        created_at: Instant::now(),
    };

    (client, server)
}

impl MemoryConnection {
    /// Pretend the peer presented this certificate chain
    pub fn with_peer_identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = identity;
        self
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionError(
                "connection closed".to_string(),
            ));
        }

        // Same numbering scheme as QUIC bidirectional streams
        let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let stream_id = n * 4 + self.side;

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        self.outgoing
            .send(MemoryStream::new(stream_id, remote, &self.shared.closed))
            .await
            .map_err(|_| TransportError::ConnectionError("peer is gone".to_string()))?;

        Ok(MemoryStream::new(stream_id, local, &self.shared.closed))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shared.closed.cancelled() => Ok(None),
            stream = incoming.recv() => Ok(stream),
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        if let Ok(mut slot) = self.shared.reason.lock() {
            slot.get_or_insert_with(|| format!("{} (code: {})", reason, error_code));
        }
        self.shared.closed.cancel();
        debug!("memory connection {} closed: {}", self.id, reason);
    }

    async fn closed(&self) -> String {
        self.shared.closed.cancelled().await;
        self.shared
            .reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "closed".to_string())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn peer_identity(&self) -> PeerIdentity {
        self.identity.clone()
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            uptime_secs: self.created_at.elapsed().as_secs(),
            ..Default::default()
        }
    }

    fn connection_id(&self) -> String {
        format!("memory-{}", self.id)
    }
}

/// A stream on a [`MemoryConnection`]
pub struct MemoryStream {
    stream_id: u64,
    inner: DuplexStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    token: CancellationToken,
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl MemoryStream {
    fn new(stream_id: u64, inner: DuplexStream, token: &CancellationToken) -> Self {
        Self {
            stream_id,
            inner,
            closed: Box::pin(token.clone().cancelled_owned()),
            token: token.clone(),
        }
    }

    fn connection_lost() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(Self::connection_lost()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(Self::connection_lost()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for MemoryStream {
    type ReadHalf = tokio::io::ReadHalf<MemoryStream>;
    type WriteHalf = tokio::io::WriteHalf<MemoryStream>;

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn reset(self, error_code: u32) {
        debug!("memory stream {} reset (code: {})", self.stream_id, error_code);
        drop(self);
    }

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf) {
        tokio::io::split(self)
    }
}
