//! One authenticated connection and the work hanging off it

use qtun_proto::{ResetCode, HEARTBEAT};
use qtun_transport::{
    ConnectionStats, PeerIdentity, TransportConnection, TransportConnector, TransportListener,
};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::flows::FlowTracker;
use crate::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Established,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Established => write!(f, "established"),
            SessionState::Draining => write!(f, "draining"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

struct Inner<C: TransportConnection> {
    conn: Arc<C>,
    peer: PeerIdentity,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    /// Fires when the session stops taking new work
    shutdown: CancellationToken,
    /// Fires when in-flight flows must stop
    flows_cancel: CancellationToken,
    flows: FlowTracker,
}

/// A tunnel session over any transport connection
///
/// Cheap to clone; all clones share one connection and one lifecycle.
pub struct TunnelSession<C: TransportConnection> {
    inner: Arc<Inner<C>>,
}

impl<C: TransportConnection> Clone for TunnelSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: TransportConnection> fmt::Debug for TunnelSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("connection", &self.inner.conn.connection_id())
            .field("state", &self.state())
            .finish()
    }
}

impl<C: TransportConnection> TunnelSession<C> {
    /// Wrap an established connection
    ///
    /// Spawns a watcher that closes the session when the peer goes away.
    pub fn new(conn: C, config: SessionConfig) -> Self {
        let peer = conn.peer_identity();
        let (state, _) = watch::channel(SessionState::Connecting);

        let session = Self {
            inner: Arc::new(Inner {
                conn: Arc::new(conn),
                peer,
                config,
                state,
                shutdown: CancellationToken::new(),
                flows_cancel: CancellationToken::new(),
                flows: FlowTracker::new(),
            }),
        };

        session.advance(SessionState::Established);
        info!(
            "Session {} established with {}",
            session.connection_id(),
            session.remote_address()
        );

        let watcher = session.clone();
        tokio::spawn(async move { watcher.watch_connection().await });

        session
    }

    async fn watch_connection(&self) {
        let conn = self.inner.conn.clone();
        tokio::select! {
            reason = conn.closed() => {
                let draining = self.state() >= SessionState::Draining;
                if self.advance(SessionState::Closed) && !draining {
                    info!("Session {} closed by peer: {}", self.connection_id(), reason);
                }
                self.inner.shutdown.cancel();
                self.inner.flows_cancel.cancel();
            }
            _ = self.wait_closed() => {}
        }
    }

    /// Move forward to `next`; `false` if the session is already there or past it
    fn advance(&self, next: SessionState) -> bool {
        self.inner.state.send_if_modified(|current| {
            if *current < next {
                debug!("Session {}: {} -> {}", self.inner.conn.connection_id(), current, next);
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    pub fn connection(&self) -> &C {
        &self.inner.conn
    }

    pub fn connection_id(&self) -> String {
        self.inner.conn.connection_id()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.inner.conn.remote_address()
    }

    pub fn peer_identity(&self) -> &PeerIdentity {
        &self.inner.peer
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.conn.stats()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Cancelled once the session stops accepting new work
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancelled when in-flight flows must stop
    pub fn flow_token(&self) -> CancellationToken {
        self.inner.flows_cancel.clone()
    }

    pub fn flows(&self) -> &FlowTracker {
        &self.inner.flows
    }

    /// Open a new bidirectional stream
    pub async fn open_stream(&self) -> SessionResult<C::Stream> {
        let state = self.state();
        if state != SessionState::Established {
            return Err(SessionError::StreamOpenFailed(format!("session is {}", state)));
        }

        self.inner
            .conn
            .open_stream()
            .await
            .map_err(|e| SessionError::StreamOpenFailed(e.to_string()))
    }

    /// Next stream opened by the peer, `None` once the session winds down
    pub async fn accept_stream(&self) -> SessionResult<Option<C::Stream>> {
        if self.state() != SessionState::Established {
            return Ok(None);
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Ok(None),
            stream = self.inner.conn.accept_stream() => {
                stream.map_err(|e| SessionError::StreamAcceptFailed(e.to_string()))
            }
        }
    }

    /// Run `flow` as part of this session
    pub fn spawn_flow<F>(&self, name: impl Into<String>, flow: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.flows.spawn(name, flow)
    }

    /// Write a heartbeat to `writer` every keep-alive interval
    ///
    /// A failed or stalled write closes the session.
    pub fn spawn_keepalive<W>(&self, mut writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = self.clone();
        let interval = self.inner.config.keep_alive_interval;
        let shutdown = self.shutdown_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let write = async {
                    writer.write_all(HEARTBEAT.as_bytes()).await?;
                    writer.flush().await
                };

                match timeout(interval, write).await {
                    Ok(Ok(())) => debug!("Heartbeat sent on {}", session.connection_id()),
                    Ok(Err(e)) => {
                        warn!("Heartbeat failed on {}: {}", session.connection_id(), e);
                        session.shutdown(ResetCode::Normal, "heartbeat failed").await;
                        return;
                    }
                    Err(_) => {
                        warn!("Heartbeat stalled on {}", session.connection_id());
                        session.shutdown(ResetCode::Normal, "heartbeat timed out").await;
                        return;
                    }
                }
            }
        });
    }

    /// Drain and close the session
    ///
    /// New streams are refused immediately. Running flows get the grace
    /// period to finish, then are cancelled and aborted, then the connection
    /// is closed with `code`. Concurrent callers all return once closed.
    pub async fn shutdown(&self, code: ResetCode, reason: &str) {
        if !self.advance(SessionState::Draining) {
            self.wait_closed().await;
            return;
        }

        info!("Session {} draining: {}", self.connection_id(), reason);
        self.inner.shutdown.cancel();

        let grace = self.inner.config.grace_period;
        if !self.inner.flows.wait_idle(grace).await {
            self.inner.flows_cancel.cancel();
            let aborted = self.inner.flows.abort_all();
            warn!(
                "Session {}: aborted {} flows after {:?} grace period",
                self.connection_id(),
                aborted,
                grace
            );
        }
        self.inner.flows_cancel.cancel();

        self.inner.conn.close(code.as_u32(), reason).await;
        self.advance(SessionState::Closed);
        info!("Session {} closed", self.connection_id());
    }

    /// Resolve once the session reaches [`SessionState::Closed`]
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }
}

/// Dial `addr` and wrap the connection in a session
pub async fn connect<T>(
    connector: &T,
    addr: SocketAddr,
    server_name: &str,
    config: SessionConfig,
) -> SessionResult<TunnelSession<T::Connection>>
where
    T: TransportConnector,
{
    config.validate()?;
    debug!("Connecting to {} ({})", addr, server_name);

    let conn = timeout(config.connect_timeout, connector.connect(addr, server_name))
        .await
        .map_err(|_| {
            SessionError::ConnectFailed(format!(
                "timed out after {:?} connecting to {}",
                config.connect_timeout, addr
            ))
        })?
        .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

    Ok(TunnelSession::new(conn, config))
}

/// Accepts connections and wraps each in a session
#[derive(Debug)]
pub struct SessionListener<L: TransportListener> {
    listener: L,
    config: SessionConfig,
}

impl<L: TransportListener> SessionListener<L> {
    pub fn new(listener: L, config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> SessionResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| SessionError::AcceptFailed(e.to_string()))
    }

    pub async fn accept(&self) -> SessionResult<TunnelSession<L::Connection>> {
        let (conn, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| SessionError::AcceptFailed(e.to_string()))?;
        debug!("Accepted connection from {}", addr);
        Ok(TunnelSession::new(conn, self.config.clone()))
    }

    pub async fn close(&self) {
        self.listener.close().await;
    }
}
