//! QUIC stream implementation

use quinn::{RecvStream, SendStream, VarInt};
use qtun_transport::TransportStream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// QUIC bidirectional stream
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

impl TransportStream for QuicStream {
    type ReadHalf = RecvStream;
    type WriteHalf = SendStream;

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn reset(mut self, error_code: u32) {
        let code = VarInt::from_u32(error_code);
        // Either side may already be closed by the peer
        let _ = self.send.reset(code);
        let _ = self.recv.stop(code);
        trace!("Reset stream {} (code: {})", self.stream_id, error_code);
    }

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf) {
        (self.recv, self.send)
    }
}
