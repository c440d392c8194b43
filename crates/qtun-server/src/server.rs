//! Session accept loop

use qtun_proto::ResetCode;
use qtun_relay::PacketDevice;
use qtun_session::{control_reader, serve_control, ControlExit, SessionListener, TunnelSession};
use qtun_transport::{TransportConnection, TransportStream};
use qtun_transport_quic::{QuicConfig, QuicListener};
use qtun_upstream::{ConnectionPool, HealthConfig, HealthSupervisor, SupervisorExit, UpstreamRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::router::StreamRouter;
use crate::{ServerError, ServerResult};

pub struct TunnelServer {
    listener: SessionListener<QuicListener>,
    router: Arc<StreamRouter>,
    health: HealthConfig,
}

impl TunnelServer {
    /// Probe every upstream, then bind the QUIC endpoint
    ///
    /// Fails if any configured upstream is unhealthy.
    pub async fn bind(config: ServerConfig, quic: QuicConfig) -> ServerResult<Self> {
        Self::bind_with_device(config, quic, None).await
    }

    pub async fn bind_with_device(
        config: ServerConfig,
        quic: QuicConfig,
        device: Option<Arc<dyn PacketDevice>>,
    ) -> ServerResult<Self> {
        config.validate()?;

        let registry = Arc::new(UpstreamRegistry::new(config.upstreams.clone()));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));

        let supervisor = HealthSupervisor::new(registry.clone(), pool.clone(), config.health.clone());
        let report = supervisor.check_all().await;
        if !report.all_healthy() {
            return Err(ServerError::UnhealthyUpstreams(report.unhealthy));
        }
        info!("All {} upstream(s) healthy", report.healthy.len());

        let quic = quic
            .with_keep_alive(config.session.keep_alive_interval)
            .with_idle_timeout(config.session.idle_timeout);
        let listener = QuicListener::new(config.listen, Arc::new(quic))?;
        let listener = SessionListener::new(listener, config.session.clone())?;

        let mut router = StreamRouter::new(config.secret.clone(), registry, pool, config.tunnel.clone());
        if let Some(device) = device {
            router = router.with_device(device);
        }

        Ok(Self {
            listener,
            router: Arc::new(router),
            health: config.health,
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> &Arc<StreamRouter> {
        &self.router
    }

    /// Accept sessions until `shutdown` fires, then drain them
    pub async fn run(&self, shutdown: CancellationToken) -> ServerResult<()> {
        info!("Tunnel server listening on {}", self.local_addr()?);
        let mut sessions = tokio::task::JoinSet::new();

        loop {
            let session = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => continue,
                accepted = self.listener.accept() => accepted,
            };

            match session {
                Ok(session) => {
                    let router = self.router.clone();
                    let health = self.health.clone();
                    let shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        let drain = {
                            let session = session.clone();
                            async move {
                                shutdown.cancelled().await;
                                session.shutdown(ResetCode::Shutdown, "server shutting down").await;
                            }
                        };
                        tokio::select! {
                            result = serve_session(session.clone(), router, health) => {
                                if let Err(e) = result {
                                    warn!("Session {} ended with error: {}", session.connection_id(), e);
                                }
                            }
                            _ = drain => {}
                        }
                    });
                }
                // Handshake failures are skipped inside the listener; an error
                // here means the endpoint itself is gone
                Err(e) => {
                    error!("Failed to accept session: {}", e);
                    break;
                }
            }
        }

        info!("Draining {} session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
        self.listener.close().await;
        Ok(())
    }
}

/// Serve one session until it closes
///
/// The first stream the peer opens is the control stream. Every later stream
/// is routed by its header. A health supervisor runs alongside and, under the
/// tear-down policy, ends the session when an upstream goes down.
pub async fn serve_session<C: TransportConnection>(
    session: TunnelSession<C>,
    router: Arc<StreamRouter>,
    health: HealthConfig,
) -> ServerResult<()> {
    let control_timeout = session.config().control_timeout;
    let control = match timeout(control_timeout, session.accept_stream()).await {
        Ok(Ok(Some(stream))) => stream,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            session.shutdown(ResetCode::Normal, "no control stream").await;
            return Err(e.into());
        }
        Err(_) => {
            warn!("Session {}: no control stream within {:?}", session.connection_id(), control_timeout);
            session.shutdown(ResetCode::Normal, "no control stream").await;
            return Ok(());
        }
    };

    debug!("Session {}: control stream {}", session.connection_id(), control.stream_id());
    spawn_control(session.clone(), control, router.clone());
    spawn_supervisor(session.clone(), router.clone(), health);

    let result = loop {
        match session.accept_stream().await {
            Ok(Some(stream)) => {
                let router = router.clone();
                let cancel = session.flow_token();
                let name = format!("stream {}", stream.stream_id());
                session.spawn_flow(name, async move {
                    router.handle_stream(stream, cancel).await;
                });
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(ServerError::from(e)),
        }
    };

    session.shutdown(ResetCode::Normal, "session ended").await;
    result
}

fn spawn_control<C: TransportConnection>(
    session: TunnelSession<C>,
    control: C::Stream,
    router: Arc<StreamRouter>,
) {
    tokio::spawn(async move {
        let (read, mut write) = control.into_split();
        let mut reader = control_reader(read);
        let cancel = session.shutdown_token();
        let endpoints = router.registry().endpoints().to_vec();

        match serve_control(&mut reader, &mut write, &endpoints, &cancel).await {
            Ok(ControlExit::Cancelled) => {}
            Ok(ControlExit::PeerClosed) => {
                info!("Session {}: control stream closed", session.connection_id());
                session.shutdown(ResetCode::Normal, "control stream closed").await;
            }
            Err(e) => {
                warn!("Session {}: {}", session.connection_id(), e);
                session.shutdown(ResetCode::MalformedFrame, "control stream error").await;
            }
        }
    });
}

fn spawn_supervisor<C: TransportConnection>(
    session: TunnelSession<C>,
    router: Arc<StreamRouter>,
    health: HealthConfig,
) {
    let supervisor = HealthSupervisor::new(router.registry().clone(), router.pool().clone(), health);
    tokio::spawn(async move {
        if let SupervisorExit::Unhealthy(report) = supervisor.run(session.shutdown_token()).await {
            error!(
                "Session {}: upstreams {:?} unhealthy",
                session.connection_id(),
                report.unhealthy
            );
            session.shutdown(ResetCode::UpstreamUnhealthy, "upstream unhealthy").await;
        }
    });
}
