//! Client session setup

use bytes::Bytes;
use qtun_proto::{encode_frame, ResetCode, RouteDescriptor, UpstreamEndpoint};
use qtun_relay::{PacketDevice, RelayError, TunnelConfig, TunnelRelay};
use qtun_session::{
    control_reader, next_control_line, request_discovery, ControlReader, SessionConfig,
    TunnelSession,
};
use qtun_transport::{TransportConnection, TransportStream};
use qtun_transport_quic::{QuicConfig, QuicConnection, QuicConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::listener::ListenerSet;
use crate::{ClientError, ClientResult};

/// Reusable QUIC client; each [`TunnelClient::connect`] yields a fresh session
#[derive(Debug)]
pub struct TunnelClient {
    config: ClientConfig,
    connector: QuicConnector,
}

impl TunnelClient {
    pub fn new(config: ClientConfig, quic: QuicConfig) -> ClientResult<Self> {
        config.validate()?;
        let quic = quic
            .with_keep_alive(config.session.keep_alive_interval)
            .with_idle_timeout(config.session.idle_timeout);
        let connector = QuicConnector::new(Arc::new(quic))?;
        Ok(Self { config, connector })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn resolve(&self) -> ClientResult<SocketAddr> {
        tokio::net::lookup_host(&self.config.server)
            .await
            .map_err(|e| ClientError::Resolve(format!("{}: {}", self.config.server, e)))?
            .next()
            .ok_or_else(|| ClientError::Resolve(self.config.server.clone()))
    }

    /// Connect, run discovery and start heartbeats
    pub async fn connect(&self) -> ClientResult<ClientSession<QuicConnection>> {
        let addr = self.resolve().await?;
        info!("Connecting to {} ({})", addr, self.config.server_name);

        let session = qtun_session::connect(
            &self.connector,
            addr,
            &self.config.server_name,
            self.config.session.clone(),
        )
        .await?;

        ClientSession::establish(session, self.config.secret.clone(), self.config.tunnel.clone())
            .await
    }
}

/// An established client session and the upstreams it discovered
pub struct ClientSession<C: TransportConnection> {
    session: TunnelSession<C>,
    upstreams: Vec<UpstreamEndpoint>,
    secret: String,
    tunnel: TunnelConfig,
}

impl<C: TransportConnection> ClientSession<C> {
    /// Open the control stream on `session`, discover upstreams and start heartbeats
    pub async fn establish(
        session: TunnelSession<C>,
        secret: String,
        tunnel: TunnelConfig,
    ) -> ClientResult<Self> {
        let control = session.open_stream().await?;
        debug!("Control stream {} opened", control.stream_id());

        let (read, mut write) = control.into_split();
        let mut reader = control_reader(read);
        let deadline = session.config().control_timeout;

        let upstreams = match request_discovery(&mut reader, &mut write, deadline).await {
            Ok(upstreams) => upstreams,
            Err(e) => {
                session.shutdown(ResetCode::Normal, "discovery failed").await;
                return Err(e.into());
            }
        };

        session.spawn_keepalive(write);
        watch_control(session.clone(), reader);

        Ok(Self {
            session,
            upstreams,
            secret,
            tunnel,
        })
    }

    pub fn upstreams(&self) -> &[UpstreamEndpoint] {
        &self.upstreams
    }

    pub fn session(&self) -> &TunnelSession<C> {
        &self.session
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn session_config(&self) -> &SessionConfig {
        self.session.config()
    }

    /// Relay connections accepted by `listeners` until the session ends
    pub async fn forward(&self, listeners: ListenerSet) -> ClientResult<()> {
        listeners.run(self.session.clone(), self.secret.clone()).await
    }

    /// Carry packets between `device` and one packet stream until either ends
    pub async fn run_full_tunnel(&self, device: Arc<dyn PacketDevice>) -> ClientResult<()> {
        let mut stream = self.session.open_stream().await?;
        let route = RouteDescriptor::packet(self.secret.clone()).with_stream_id(stream.stream_id());
        let header = encode_frame(&route, &[]).map_err(RelayError::from)?;
        stream.write_all(&header).await.map_err(RelayError::from)?;

        info!("Full tunnel running on stream {}", stream.stream_id());
        let (reader, writer) = stream.into_split();
        TunnelRelay::new(self.tunnel.clone())
            .run(device, reader, writer, Bytes::new(), self.session.flow_token())
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.session
            .shutdown(ResetCode::Shutdown, "client shutting down")
            .await;
    }

    pub async fn wait_closed(&self) {
        self.session.wait_closed().await;
    }
}

/// Close the session once the server ends the control stream
fn watch_control<C, R>(session: TunnelSession<C>, mut reader: ControlReader<R>)
where
    C: TransportConnection,
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let cancel = session.shutdown_token();
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = next_control_line(&mut reader) => read,
            };
            match read {
                Ok(None) => break,
                Ok(Some(line)) => debug!("Ignoring control line: {:?}", line),
                Err(e) => {
                    debug!("Control stream read failed: {}", e);
                    break;
                }
            }
        }
        warn!("Server closed the control stream");
        session
            .shutdown(ResetCode::Normal, "control stream closed by server")
            .await;
    });
}
