//! Byte and packet relays between the tunnel and the outside world
//!
//! - [`splice`]: bidirectional copy between two byte streams
//! - [`tcp`]: client side of a port-forward stream
//! - [`queue`]: the bounded packet FIFO between a device and the tunnel
//! - [`tunnel`]: full-tunnel relay between a [`PacketDevice`] and a stream

pub mod device;
pub mod queue;
pub mod splice;
pub mod tcp;
pub mod tunnel;

pub use device::{ChannelDevice, DeviceHandle, FileDevice, IoDevice, PacketDevice};
pub use queue::{packet_queue, PacketReceiver, PacketSender, QueueClosed};
pub use splice::{splice, SpliceStats};
pub use tcp::{forward_chunked, forward_raw};
pub use tunnel::{packet_summary, TunnelConfig, TunnelRelay, TunnelStats};

use qtun_proto::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {0}")]
    Device(#[source] std::io::Error),

    #[error("Packet queue closed")]
    QueueClosed,
}

pub type RelayResult<T> = Result<T, RelayError>;

impl From<QueueClosed> for RelayError {
    fn from(_: QueueClosed) -> Self {
        RelayError::QueueClosed
    }
}
