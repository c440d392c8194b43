//! Bounded FIFO of packets between a device reader and the tunnel writer
//!
//! A full queue makes [`PacketSender::send`] wait, which in turn stops the
//! device reader. Packets are never dropped for lack of space.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// The receiving half is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet queue closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Create a queue holding at most `capacity` packets
pub fn packet_queue(capacity: usize) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PacketSender { tx }, PacketReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<Bytes>,
}

impl PacketSender {
    /// Enqueue a packet, waiting while the queue is full
    pub async fn send(&self, packet: Bytes) -> Result<(), QueueClosed> {
        self.tx.send(packet).await.map_err(|_| QueueClosed)
    }

    /// Enqueue without waiting; hands the packet back if the queue is full
    pub fn try_send(&self, packet: Bytes) -> Result<(), Bytes> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
        })
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

#[derive(Debug)]
pub struct PacketReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl PacketReceiver {
    /// Next packet in enqueue order, `None` once every sender is gone and the queue is drained
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
