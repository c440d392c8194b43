//! Per-stream authentication and dispatch

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use qtun_proto::{
    read_route_header, ChunkCodec, ChunkFrame, FrameError, Framing, ResetCode, RouteDescriptor,
    UpstreamEndpoint,
};
use qtun_relay::{splice, PacketDevice, TunnelConfig, TunnelRelay};
use qtun_transport::TransportStream;
use qtun_upstream::{dial, ConnectionPool, UpstreamRegistry};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ServerError, ServerResult};

const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Where an authorized stream goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Raw(UpstreamEndpoint),
    Chunked(UpstreamEndpoint),
    Packet,
}

/// Shared by every session of one server
pub struct StreamRouter {
    secret: String,
    registry: Arc<UpstreamRegistry>,
    pool: Arc<ConnectionPool>,
    device: Option<Arc<dyn PacketDevice>>,
    /// One packet stream owns the device at a time
    device_slot: Semaphore,
    tunnel: TunnelConfig,
}

impl StreamRouter {
    pub fn new(
        secret: impl Into<String>,
        registry: Arc<UpstreamRegistry>,
        pool: Arc<ConnectionPool>,
        tunnel: TunnelConfig,
    ) -> Self {
        Self {
            secret: secret.into(),
            registry,
            pool,
            device: None,
            device_slot: Semaphore::new(1),
            tunnel,
        }
    }

    /// Serve packet streams from `device`
    pub fn with_device(mut self, device: Arc<dyn PacketDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn token_matches(&self, token: &str) -> bool {
        token.as_bytes().ct_eq(self.secret.as_bytes()).into()
    }

    /// Check the token and resolve the route's target
    pub async fn authorize(&self, route: &RouteDescriptor) -> ServerResult<RouteTarget> {
        if !self.token_matches(&route.token) {
            return Err(ServerError::AuthMismatch);
        }

        if route.framing == Framing::Packet {
            return match self.device {
                Some(_) => Ok(RouteTarget::Packet),
                None => Err(ServerError::NoRoute("packet device".to_string())),
            };
        }

        let endpoint = self.registry.resolve(&route.remote_host).await?;

        Ok(match route.framing {
            Framing::Chunked => RouteTarget::Chunked(endpoint),
            _ => RouteTarget::Raw(endpoint),
        })
    }

    /// Read the route header from `stream` and serve it until either side ends
    ///
    /// Rejected streams are reset with the matching [`ResetCode`]; nothing
    /// from them ever reaches an upstream.
    pub async fn handle_stream<S: TransportStream>(&self, stream: S, cancel: CancellationToken) {
        let stream_id = stream.stream_id();
        let mut reader = BufReader::new(stream);

        let route = match timeout(HEADER_TIMEOUT, read_route_header(&mut reader)).await {
            Ok(Ok(route)) => route,
            Ok(Err(FrameError::UnexpectedEof)) => {
                debug!("Stream {} closed before a route header", stream_id);
                return;
            }
            Ok(Err(e)) => {
                warn!("Stream {}: {}", stream_id, e);
                reader.into_inner().reset(ResetCode::MalformedFrame.as_u32());
                return;
            }
            Err(_) => {
                warn!("Stream {}: no route header within {:?}", stream_id, HEADER_TIMEOUT);
                reader.into_inner().reset(ResetCode::MalformedFrame.as_u32());
                return;
            }
        };

        let target = match self.authorize(&route).await {
            Ok(target) => target,
            Err(ServerError::AuthMismatch) => {
                warn!(
                    stream_id = stream_id,
                    remote_host = %route.remote_host,
                    client_host = %route.client_host,
                    "Route token mismatch"
                );
                reader.into_inner().reset(ResetCode::AuthMismatch.as_u32());
                return;
            }
            Err(e) => {
                warn!("Stream {}: {}", stream_id, e);
                reader.into_inner().reset(ResetCode::NoRoute.as_u32());
                return;
            }
        };

        debug!("Stream {}: {:?}", stream_id, route.redacted());

        let leftover = reader.buffer().to_vec();
        let stream = reader.into_inner();

        match target {
            RouteTarget::Raw(endpoint) => {
                self.serve_raw(stream, &endpoint, &leftover, &cancel).await
            }
            RouteTarget::Chunked(endpoint) => {
                self.serve_chunked(stream, &endpoint, &leftover, &cancel).await
            }
            RouteTarget::Packet => self.serve_packets(stream, &leftover, cancel).await,
        }
    }

    async fn serve_raw<S: TransportStream>(
        &self,
        stream: S,
        endpoint: &UpstreamEndpoint,
        leftover: &[u8],
        cancel: &CancellationToken,
    ) {
        let stream_id = stream.stream_id();
        let mut upstream = match dial(endpoint, self.pool.config()).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Stream {}: {}", stream_id, e);
                stream.reset(ResetCode::UpstreamUnreachable.as_u32());
                return;
            }
        };

        if !leftover.is_empty() {
            if let Err(e) = upstream.write_all(leftover).await {
                warn!("Stream {}: write to {} failed: {}", stream_id, endpoint, e);
                stream.reset(ResetCode::UpstreamUnreachable.as_u32());
                return;
            }
        }

        let (stream_read, stream_write) = stream.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let stats = splice(stream_read, stream_write, upstream_read, upstream_write, cancel).await;

        info!(
            stream_id = stream_id,
            upstream = %endpoint,
            bytes_up = stats.a_to_b + leftover.len() as u64,
            bytes_down = stats.b_to_a,
            "Raw stream closed"
        );
    }

    async fn serve_chunked<S: TransportStream>(
        &self,
        stream: S,
        endpoint: &UpstreamEndpoint,
        leftover: &[u8],
        cancel: &CancellationToken,
    ) {
        let stream_id = stream.stream_id();
        let mut parts = FramedParts::new::<ChunkFrame>(stream, ChunkCodec::new());
        parts.read_buf = BytesMut::from(leftover);
        let mut framed = Framed::from_parts(parts);

        let code = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break ResetCode::Shutdown,
                frame = framed.next() => frame,
            };

            let frame = match frame {
                None => break ResetCode::Normal,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Stream {}: {}", stream_id, e);
                    break ResetCode::MalformedFrame;
                }
            };

            if !self.token_matches(&frame.route.token) {
                warn!("Stream {}: chunk with mismatched token", stream_id);
                break ResetCode::AuthMismatch;
            }

            let reply = match self.pool.exchange(endpoint, &frame.payload).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Stream {}: {}", stream_id, e);
                    break ResetCode::UpstreamUnreachable;
                }
            };

            if let Err(e) = framed.send(ChunkFrame::new(frame.route.redacted(), reply)).await {
                debug!("Stream {}: reply failed: {}", stream_id, e);
                break ResetCode::Normal;
            }
        };

        let mut stream = framed.into_inner();
        if code == ResetCode::Normal {
            let _ = stream.shutdown().await;
        } else {
            stream.reset(code.as_u32());
        }
        debug!("Chunked stream {} to {} ended", stream_id, endpoint);
    }

    async fn serve_packets<S: TransportStream>(
        &self,
        stream: S,
        leftover: &[u8],
        cancel: CancellationToken,
    ) {
        let stream_id = stream.stream_id();
        let Some(device) = self.device.clone() else {
            stream.reset(ResetCode::NoRoute.as_u32());
            return;
        };

        let _slot = match self.device_slot.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Stream {}: packet device already in use", stream_id);
                stream.reset(ResetCode::NoRoute.as_u32());
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let relay = TunnelRelay::new(self.tunnel.clone());
        if let Err(e) = relay
            .run(device, reader, writer, leftover.to_vec().into(), cancel)
            .await
        {
            warn!("Packet stream {} ended: {}", stream_id, e);
        }
    }
}
