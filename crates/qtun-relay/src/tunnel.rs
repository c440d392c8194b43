//! Full-tunnel packet relay
//!
//! ```text
//!  device ──read──▶ PacketQueue ──u16 frames──▶ stream
//!  device ◀──write── u16 frames ◀─────────────── stream
//! ```
//!
//! The three loops run until one of them ends or the token fires. Each packet
//! read from the device is forwarded whole; a read longer than
//! [`TunnelConfig::max_packet`] is dropped and logged.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use qtun_proto::packet_codec;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::device::PacketDevice;
use crate::queue::{packet_queue, PacketReceiver, PacketSender};
use crate::{RelayError, RelayResult};

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Largest packet accepted from the device
    pub max_packet: usize,

    /// Packets held between the device reader and the stream writer
    pub queue_capacity: usize,

    /// Log a one-line summary of every packet
    pub debug: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_packet: 1500,
            queue_capacity: 256,
            debug: false,
        }
    }
}

/// Counters for one relay run
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub to_tunnel: AtomicU64,
    pub from_tunnel: AtomicU64,
    pub dropped: AtomicU64,
}

impl TunnelStats {
    pub fn to_tunnel(&self) -> u64 {
        self.to_tunnel.load(Ordering::Relaxed)
    }

    pub fn from_tunnel(&self) -> u64 {
        self.from_tunnel.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// IP version, length and addresses of a packet
pub fn packet_summary(packet: &[u8]) -> String {
    let Some(first) = packet.first() else {
        return "empty packet".to_string();
    };

    match first >> 4 {
        4 if packet.len() >= 20 => {
            let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
            let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
            format!("IPv4 {} -> {} proto {} len {}", src, dst, packet[9], packet.len())
        }
        6 if packet.len() >= 40 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&packet[8..24]);
            dst.copy_from_slice(&packet[24..40]);
            format!(
                "IPv6 {} -> {} next {} len {}",
                Ipv6Addr::from(src),
                Ipv6Addr::from(dst),
                packet[6],
                packet.len()
            )
        }
        version => format!("IPv{} len {}", version, packet.len()),
    }
}

pub struct TunnelRelay {
    config: TunnelConfig,
    stats: Arc<TunnelStats>,
}

impl TunnelRelay {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            stats: Arc::new(TunnelStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    /// Relay packets between `device` and one tunnel stream
    ///
    /// `leftover` holds bytes already read from the stream (after the route
    /// header) and is decoded before anything new.
    pub async fn run<R, W>(
        &self,
        device: Arc<dyn PacketDevice>,
        reader: R,
        writer: W,
        leftover: Bytes,
        cancel: CancellationToken,
    ) -> RelayResult<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let (tx, rx) = packet_queue(self.config.queue_capacity);
        let max_packet = self.config.max_packet;
        let verbose = self.config.debug;
        let stats = self.stats.clone();

        info!("Packet relay started on {}", device.name());

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            r = device_to_queue(device.clone(), tx, max_packet, verbose, stats.clone()) => r,
            r = queue_to_stream(rx, writer, stats.clone()) => r,
            r = stream_to_device(reader, leftover, device.clone(), verbose, stats.clone()) => r,
        };

        info!(
            "Packet relay on {} stopped: {} out, {} in, {} dropped",
            device.name(),
            stats.to_tunnel(),
            stats.from_tunnel(),
            stats.dropped()
        );

        result
    }
}

async fn device_to_queue(
    device: Arc<dyn PacketDevice>,
    queue: PacketSender,
    max_packet: usize,
    verbose: bool,
    stats: Arc<TunnelStats>,
) -> RelayResult<()> {
    let mut buf = vec![0u8; max_packet + 1];
    loop {
        let n = device
            .read_packet(&mut buf)
            .await
            .map_err(RelayError::Device)?;
        if n == 0 {
            continue;
        }
        if n > max_packet {
            error!("Dropping packet larger than {} bytes", max_packet);
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if verbose {
            debug!("device -> tunnel: {}", packet_summary(&buf[..n]));
        }
        queue.send(Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

async fn queue_to_stream<W>(
    mut queue: PacketReceiver,
    writer: W,
    stats: Arc<TunnelStats>,
) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, packet_codec());
    while let Some(packet) = queue.recv().await {
        sink.send(packet).await?;
        stats.to_tunnel.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

async fn stream_to_device<R>(
    reader: R,
    leftover: Bytes,
    device: Arc<dyn PacketDevice>,
    verbose: bool,
    stats: Arc<TunnelStats>,
) -> RelayResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, packet_codec());
    frames.read_buffer_mut().extend_from_slice(&leftover);
    while let Some(frame) = frames.next().await {
        let packet = frame?;
        if verbose {
            debug!("tunnel -> device: {}", packet_summary(&packet));
        }
        device
            .write_packet(&packet)
            .await
            .map_err(RelayError::Device)?;
        stats.from_tunnel.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Tunnel stream closed");
    Ok(())
}
