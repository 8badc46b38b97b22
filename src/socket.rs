//! Write handle for a connected client socket.
//!
//! The bridge never touches the underlying transport directly. It writes
//! serialized envelopes through a [`ClientSocket`], a cloneable handle over
//! a bounded byte channel whose receiving half is owned by the transport
//! adapter.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Identifier assigned to a client socket, unique for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cloneable handle used by the bridge to queue frames for one client.
///
/// Each clone shares the same underlying channel and [`SocketId`]. The
/// transport adapter drains the receiver returned by [`ClientSocket::channel`]
/// and flushes its bytes onto the duplex connection.
#[derive(Clone, Debug)]
pub struct ClientSocket {
    id: SocketId,
    tx: mpsc::Sender<Bytes>,
}

impl ClientSocket {
    /// Create a socket handle together with the transport-side receiver.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: SocketId::next(),
                tx,
            },
            rx,
        )
    }

    /// Identifier for this socket.
    #[must_use]
    pub fn id(&self) -> SocketId { self.id }

    /// Queue bytes for delivery to the client.
    ///
    /// Writes after the transport has gone away are dropped; teardown is
    /// driven by the transport's close event, not by write failures.
    pub async fn write(&self, data: Bytes) {
        if self.tx.send(data).await.is_err() {
            log::debug!("write to closed socket {:?} dropped", self.id);
        }
    }
}
