//! Packet devices
//!
//! A [`PacketDevice`] yields and accepts whole IP packets. Creating and
//! configuring an OS TUN interface is left to the platform; anything that
//! hands over one packet per read (a TUN file descriptor opened elsewhere, a
//! character device, a channel in tests) fits.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait PacketDevice: Send + Sync + 'static {
    /// Read one packet into `buf`, returning its length
    ///
    /// A packet longer than `buf` is truncated to `buf.len()`.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole packet
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    fn name(&self) -> &str {
        "device"
    }
}

/// In-process device backed by channels
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
}

/// The outside of a [`ChannelDevice`]
pub struct DeviceHandle {
    inject: mpsc::Sender<Bytes>,
    written: mpsc::Receiver<Bytes>,
}

impl ChannelDevice {
    pub fn pair(capacity: usize) -> (ChannelDevice, DeviceHandle) {
        let (inject, inbound) = mpsc::channel(capacity.max(1));
        let (outbound, written) = mpsc::channel(capacity.max(1));
        (
            ChannelDevice {
                inbound: Mutex::new(inbound),
                outbound,
            },
            DeviceHandle { inject, written },
        )
    }
}

impl DeviceHandle {
    /// Make `packet` readable from the device
    pub async fn inject(&self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.inject
            .send(packet.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
    }

    /// Next packet written to the device
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }
}

#[async_trait]
impl PacketDevice for ChannelDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "device closed"))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Device over any async reader/writer that preserves packet boundaries
pub struct IoDevice<T> {
    name: String,
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
}

impl<T> IoDevice<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(name: impl Into<String>, io: T) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            name: name.into(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

/// A device node opened as a file, such as a pre-configured TUN interface
pub type FileDevice = IoDevice<tokio::fs::File>;

impl FileDevice {
    /// Open an already configured device node read-write
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        Ok(Self::new(path.display().to_string(), file))
    }
}

#[async_trait]
impl<T> PacketDevice for IoDevice<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device closed"));
        }
        Ok(n)
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await?;
        writer.flush().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_device_truncates_long_packet() {
        let (device, handle) = ChannelDevice::pair(4);
        handle.inject(vec![7u8; 10]).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(device.read_packet(&mut buf).await.unwrap(), 4);
        assert_eq!(buf, [7u8; 4]);
    }

    #[tokio::test]
    async fn test_io_device_over_duplex() {
        let (near, mut far) = tokio::io::duplex(1024);
        let device = IoDevice::new("duplex", near);

        device.write_packet(b"\x45abc").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x45abc");

        far.write_all(b"\x60xyz").await.unwrap();
        let mut buf = [0u8; 64];
        let n = device.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x60xyz");
        assert_eq!(device.name(), "duplex");
    }
}
