//! Subject-addressed event-bus seam.
//!
//! The bridge talks to the bus exclusively through [`EventBus`], keeping
//! the transport-facing code independent of any particular bus. The crate
//! ships [`LocalBus`], an in-memory implementation used by the tests and
//! the demo binary; production deployments substitute their own.

use std::any::Any;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;

pub use local::LocalBus;

/// A message delivered by the bus.
#[derive(Clone, Debug)]
pub struct BusMessage {
    /// Address the message was delivered on.
    pub address: String,
    /// Message body.
    pub body: Value,
    /// Address a reply should be sent to, when the sender expects one.
    pub reply_address: Option<String>,
}

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// A point-to-point message had no handler to go to.
    #[error("no handler registered on {0}")]
    NoHandler(String),

    /// A request saw no reply within the bus reply timeout.
    #[error("request on {0} timed out")]
    Timeout(String),

    /// The delivery channel was closed underneath the operation.
    #[error("bus channel closed")]
    Closed,
}

/// A live handler registration on a bus address.
///
/// Dropping the subscription unregisters the handler.
pub struct BusSubscription {
    receiver: mpsc::Receiver<BusMessage>,
    _guard: Box<dyn Any + Send>,
}

impl BusSubscription {
    /// Pair a delivery receiver with an unregister-on-drop guard.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<BusMessage>, guard: Box<dyn Any + Send>) -> Self {
        Self {
            receiver,
            _guard: guard,
        }
    }

    /// Receive the next delivered message.
    ///
    /// Returns `None` once the bus side of the channel is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> { self.receiver.recv().await }
}

/// A subject-addressed publish/subscribe message bus.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Deliver `body` to one handler registered on `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoHandler`] when nothing is listening.
    async fn send(&self, address: &str, body: Value) -> Result<(), BusError>;

    /// Deliver `body` to one handler on `address` and await its reply.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoHandler`] when nothing is listening and
    /// [`BusError::Timeout`] when no reply arrives within the bus reply
    /// timeout. Replies arriving after the timeout are dropped silently.
    async fn request(&self, address: &str, body: Value) -> Result<BusMessage, BusError>;

    /// Deliver `body` to every handler registered on `address`.
    ///
    /// # Errors
    ///
    /// Implementations may surface transport failures; publishing to an
    /// address with no handlers is not an error.
    async fn publish(&self, address: &str, body: Value) -> Result<(), BusError>;

    /// Register a handler on `address`.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] when the handler cannot be installed.
    async fn subscribe(&self, address: &str) -> Result<BusSubscription, BusError>;
}
