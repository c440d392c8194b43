//! Local TCP listeners, one per discovered upstream

use qtun_proto::{Framing, RouteDescriptor, UpstreamEndpoint};
use qtun_relay::{forward_chunked, forward_raw};
use qtun_session::TunnelSession;
use qtun_transport::{TransportConnection, TransportStream};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::{ClientError, ClientResult};

struct BoundListener {
    endpoint: UpstreamEndpoint,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Every local listener for one session
pub struct ListenerSet {
    listeners: Vec<BoundListener>,
    framing: Framing,
}

impl ListenerSet {
    /// Bind one listener per endpoint on `config.bind_host`
    ///
    /// Fails on the first port that cannot be bound; listeners bound before
    /// it are closed.
    pub async fn bind(endpoints: &[UpstreamEndpoint], config: &ListenerConfig) -> ClientResult<Self> {
        let mut listeners = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let addr = SocketAddr::new(config.bind_host, config.local_port(endpoint.port));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| ClientError::listen_failed(addr, e))?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| ClientError::listen_failed(addr, e))?;

            info!("Forwarding {} -> {}", local_addr, endpoint);
            listeners.push(BoundListener {
                endpoint: endpoint.clone(),
                listener,
                local_addr,
            });
        }

        Ok(Self {
            listeners,
            framing: config.framing,
        })
    }

    /// Bound address for each upstream
    pub fn local_addrs(&self) -> Vec<(UpstreamEndpoint, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.endpoint.clone(), l.local_addr))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Accept on every listener until the session stops taking work
    pub async fn run<C: TransportConnection>(
        self,
        session: TunnelSession<C>,
        secret: String,
    ) -> ClientResult<()> {
        let mut loops = JoinSet::new();
        for bound in self.listeners {
            loops.spawn(accept_loop(bound, session.clone(), secret.clone(), self.framing));
        }

        while loops.join_next().await.is_some() {}
        Ok(())
    }
}

/// Pause before retrying a failed accept, doubling while failures repeat
///
/// Errors such as EMFILE persist until something else frees a descriptor.
#[derive(Debug)]
struct AcceptBackoff {
    current: Duration,
}

impl AcceptBackoff {
    const MIN: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { current: Self::MIN }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = Self::MIN;
    }
}

async fn accept_loop<C: TransportConnection>(
    bound: BoundListener,
    session: TunnelSession<C>,
    secret: String,
    framing: Framing,
) {
    let shutdown = session.shutdown_token();
    let mut backoff = AcceptBackoff::new();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = bound.listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(accepted) => {
                backoff.reset();
                accepted
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Accept on {} failed: {}, retrying in {:?}", bound.local_addr, e, delay);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };
        let _ = socket.set_nodelay(true);

        let stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                if !session.is_established() {
                    break;
                }
                continue;
            }
        };

        let stream_id = stream.stream_id();
        let route = RouteDescriptor::new(secret.clone(), &bound.endpoint)
            .with_client_host(bound.local_addr.to_string())
            .with_stream_id(stream_id);
        let cancel = session.flow_token();

        debug!(
            stream_id = stream_id,
            peer = %peer,
            upstream = %bound.endpoint,
            "Forwarding local connection"
        );
        session.spawn_flow(format!("forward {}", stream_id), async move {
            let result = match framing {
                Framing::Chunked => forward_chunked(socket, stream, &route, &cancel).await,
                _ => forward_raw(socket, stream, &route, &cancel).await,
            };
            if let Err(e) = result {
                warn!("Stream {} failed: {}", stream_id, e);
            }
        });
    }

    debug!("Listener {} closed", bound.local_addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_backoff_grows_and_resets() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));

        for _ in 0..16 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), AcceptBackoff::MAX);

        backoff.reset();
        assert_eq!(backoff.next_delay(), AcceptBackoff::MIN);
    }
}
