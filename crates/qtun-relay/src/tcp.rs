//! Client side of a port-forward stream
//!
//! The route header goes out first, then the local connection is relayed
//! either as raw bytes or as [`ChunkFrame`]s carrying the route on every chunk.

use futures::{SinkExt, StreamExt};
use qtun_proto::{encode_frame, ChunkCodec, ChunkFrame, Framing, RouteDescriptor};
use qtun_transport::TransportStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::splice::{splice, SpliceStats};
use crate::{RelayError, RelayResult};

const CHUNK_READ_SIZE: usize = 16 * 1024;

/// Send the route header, then splice `local` with `stream`
pub async fn forward_raw<L, S>(
    local: L,
    mut stream: S,
    route: &RouteDescriptor,
    cancel: &CancellationToken,
) -> RelayResult<SpliceStats>
where
    L: AsyncRead + AsyncWrite + Unpin,
    S: TransportStream,
{
    let route = route.clone().with_framing(Framing::Raw);
    let header = encode_frame(&route, &[])?;
    stream.write_all(&header).await?;

    let (local_read, local_write) = tokio::io::split(local);
    let (stream_read, stream_write) = stream.into_split();

    let stats = splice(local_read, local_write, stream_read, stream_write, cancel).await;
    debug!(
        "Stream to {} closed: {} bytes up, {} bytes down",
        route.remote_host, stats.a_to_b, stats.b_to_a
    );
    Ok(stats)
}

/// Send the route header, then relay `local` as chunk frames
///
/// Every read from `local` becomes one frame; every frame from the stream
/// has its payload written back to `local`.
pub async fn forward_chunked<L, S>(
    local: L,
    mut stream: S,
    route: &RouteDescriptor,
    cancel: &CancellationToken,
) -> RelayResult<SpliceStats>
where
    L: AsyncRead + AsyncWrite + Unpin,
    S: TransportStream,
{
    let route = route.clone().with_framing(Framing::Chunked);
    let header = encode_frame(&route, &[])?;
    stream.write_all(&header).await?;

    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (stream_read, stream_write) = stream.into_split();
    let mut frames_out = FramedWrite::new(stream_write, ChunkCodec::new());
    let mut frames_in = FramedRead::new(stream_read, ChunkCodec::new());

    let mut sent = 0u64;
    let mut received = 0u64;
    let mut cancelled = false;
    let result: RelayResult<()> = {
        let up = async {
            let mut buf = vec![0u8; CHUNK_READ_SIZE];
            loop {
                let n = local_read.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<(), RelayError>(());
                }
                frames_out
                    .send(ChunkFrame::new(route.clone(), buf[..n].to_vec()))
                    .await?;
                sent += n as u64;
            }
        };
        let down = async {
            while let Some(frame) = frames_in.next().await {
                let frame = frame?;
                local_write.write_all(&frame.payload).await?;
                received += frame.payload.len() as u64;
            }
            Ok::<(), RelayError>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                Ok(())
            }
            r = up => r,
            r = down => r,
        }
    };

    let _ = frames_out.close().await;
    let _ = local_write.shutdown().await;

    if let Err(e) = result {
        debug!("Chunked stream to {} ended: {}", route.remote_host, e);
    }
    Ok(SpliceStats {
        a_to_b: sent,
        b_to_a: received,
        cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use qtun_proto::{read_route_header, UpstreamEndpoint};
    use qtun_transport::memory::connection_pair;
    use qtun_transport::TransportConnection;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::time::timeout;
    use tokio_util::codec::Decoder;

    fn route() -> RouteDescriptor {
        RouteDescriptor::new("secret", &UpstreamEndpoint::tcp("127.0.0.1", 9000))
    }

    #[tokio::test]
    async fn test_forward_raw_writes_header_then_bytes() {
        let (client, server) = connection_pair();
        let (local, mut app) = tokio::io::duplex(1024);

        let forward = tokio::spawn(async move {
            let stream = client.open_stream().await.unwrap();
            forward_raw(local, stream, &route(), &CancellationToken::new()).await
        });

        let stream = server.accept_stream().await.unwrap().unwrap();
        let mut reader = BufReader::new(stream);
        let header = read_route_header(&mut reader).await.unwrap();
        assert_eq!(header.remote_host, "127.0.0.1:9000");
        assert_eq!(header.framing, Framing::Raw);

        app.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        reader.get_mut().write_all(b"PONG").await.unwrap();
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        drop(app);
        let stats = timeout(Duration::from_secs(2), forward)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, 4);
        assert_eq!(stats.b_to_a, 4);
    }

    #[tokio::test]
    async fn test_forward_chunked_frames_each_read() {
        let (client, server) = connection_pair();
        let (local, mut app) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let forward = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let stream = client.open_stream().await.unwrap();
                forward_chunked(local, stream, &route(), &cancel).await
            }
        });

        let stream = server.accept_stream().await.unwrap().unwrap();
        let mut reader = BufReader::new(stream);
        let header = read_route_header(&mut reader).await.unwrap();
        assert_eq!(header.framing, Framing::Chunked);

        app.write_all(b"hello").await.unwrap();

        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::from(reader.buffer());
        let frame = loop {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                break frame;
            }
            let mut chunk = [0u8; 256];
            let n = reader.get_mut().read(&mut chunk).await.unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
        };
        assert_eq!(&frame.payload[..], b"hello");
        assert_eq!(frame.route.token, "secret");

        cancel.cancel();
        let stats = timeout(Duration::from_secs(2), forward)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.b_to_a, 0);
    }
}
