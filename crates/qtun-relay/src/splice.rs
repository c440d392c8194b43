//! Bidirectional byte copy

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction by [`splice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// The token fired before either side finished
    pub cancelled: bool,
}

impl SpliceStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *counter += n as u64;
    }
}

/// Copy `a` to `b` and `b` to `a` until either direction ends
///
/// When one direction reaches EOF or fails, both write halves are shut down
/// so the peers observe the close. Bytes already written are counted even if
/// the other direction was still in flight.
pub async fn splice<AR, AW, BR, BW>(
    mut a_read: AR,
    mut a_write: AW,
    mut b_read: BR,
    mut b_write: BW,
    cancel: &CancellationToken,
) -> SpliceStats
where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let mut stats = SpliceStats::default();

    {
        let a_to_b = pump(&mut a_read, &mut b_write, &mut stats.a_to_b);
        let b_to_a = pump(&mut b_read, &mut a_write, &mut stats.b_to_a);
        tokio::pin!(a_to_b, b_to_a);

        tokio::select! {
            _ = cancel.cancelled() => {
                stats.cancelled = true;
            }
            result = &mut a_to_b => {
                if let Err(e) = result {
                    debug!("Splice a->b ended: {}", e);
                }
            }
            result = &mut b_to_a => {
                if let Err(e) = result {
                    debug!("Splice b->a ended: {}", e);
                }
            }
        }
    }

    let _ = b_write.shutdown().await;
    let _ = a_write.shutdown().await;

    stats
}
