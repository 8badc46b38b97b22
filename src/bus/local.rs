//! In-memory event bus.
//!
//! `LocalBus` routes point-to-point sends round-robin across the handlers
//! registered on an address, fans publishes out to all of them, and routes
//! reply legs through one-shot slots keyed by generated reply addresses.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::{BusError, BusMessage, BusSubscription, EventBus};

/// Default time a request waits for its reply.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of each handler's delivery channel.
const DELIVERY_CAPACITY: usize = 64;

/// Prefix of generated reply addresses, chosen to stay clear of
/// application address space.
const REPLY_ADDRESS_PREFIX: &str = "__bus.reply.";

#[derive(Default)]
struct AddressEntry {
    senders: Vec<(u64, mpsc::Sender<BusMessage>)>,
    cursor: usize,
}

/// In-memory [`EventBus`] implementation.
pub struct LocalBus {
    handlers: Arc<DashMap<String, AddressEntry>>,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<BusMessage>>>,
    next_handler_id: AtomicU64,
    next_reply_id: AtomicU64,
    request_timeout: Duration,
}

impl Default for LocalBus {
    fn default() -> Self { Self::new() }
}

impl LocalBus {
    /// Create a bus with the default request timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
            next_reply_id: AtomicU64::new(0),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override how long a request waits for its reply.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Number of handlers currently registered on `address`.
    #[must_use]
    pub fn handler_count(&self, address: &str) -> usize {
        self.handlers
            .get(address)
            .map_or(0, |entry| entry.senders.len())
    }

    /// Pick the next handler for a point-to-point delivery.
    fn next_sender(&self, address: &str) -> Option<mpsc::Sender<BusMessage>> {
        let mut entry = self.handlers.get_mut(address)?;
        if entry.senders.is_empty() {
            return None;
        }
        let index = entry.cursor % entry.senders.len();
        entry.cursor = entry.cursor.wrapping_add(1);
        Some(entry.senders[index].1.clone())
    }

    /// Claim the one-shot reply slot for `address`, if a requester is
    /// waiting on it.
    fn take_pending(&self, address: &str) -> Option<oneshot::Sender<BusMessage>> {
        self.pending_replies
            .lock()
            .expect("lock poisoned")
            .remove(address)
    }

    fn drop_pending(&self, reply_address: &str) {
        self.pending_replies
            .lock()
            .expect("lock poisoned")
            .remove(reply_address);
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn send(&self, address: &str, body: Value) -> Result<(), BusError> {
        // Reply legs route to their waiting requester ahead of any handler.
        if let Some(slot) = self.take_pending(address) {
            let message = BusMessage {
                address: address.to_owned(),
                body,
                reply_address: None,
            };
            if slot.send(message).is_err() {
                log::debug!("reply to {address} arrived after the requester gave up");
            }
            return Ok(());
        }

        let Some(sender) = self.next_sender(address) else {
            return Err(BusError::NoHandler(address.to_owned()));
        };
        let message = BusMessage {
            address: address.to_owned(),
            body,
            reply_address: None,
        };
        sender.send(message).await.map_err(|_| BusError::Closed)
    }

    async fn request(&self, address: &str, body: Value) -> Result<BusMessage, BusError> {
        let reply_address = format!(
            "{REPLY_ADDRESS_PREFIX}{}",
            self.next_reply_id.fetch_add(1, Ordering::Relaxed)
        );
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_replies
            .lock()
            .expect("lock poisoned")
            .insert(reply_address.clone(), reply_tx);

        let message = BusMessage {
            address: address.to_owned(),
            body,
            reply_address: Some(reply_address.clone()),
        };

        // A request aimed at a reply address continues an existing
        // request/reply chain.
        let delivered = if let Some(slot) = self.take_pending(address) {
            slot.send(message).is_ok()
        } else if let Some(sender) = self.next_sender(address) {
            sender.send(message).await.is_ok()
        } else {
            false
        };
        if !delivered {
            self.drop_pending(&reply_address);
            return Err(BusError::NoHandler(address.to_owned()));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                // A reply landing after this point finds no slot and is
                // dropped silently.
                self.drop_pending(&reply_address);
                Err(BusError::Timeout(address.to_owned()))
            }
        }
    }

    async fn publish(&self, address: &str, body: Value) -> Result<(), BusError> {
        let senders: Vec<mpsc::Sender<BusMessage>> = self
            .handlers
            .get(address)
            .map(|entry| entry.senders.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        if senders.is_empty() {
            log::debug!("publish to {address} had no listeners");
            return Ok(());
        }
        for sender in senders {
            let message = BusMessage {
                address: address.to_owned(),
                body: body.clone(),
                reply_address: None,
            };
            if sender.send(message).await.is_err() {
                log::debug!("publish to {address} hit a departed handler");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> Result<BusSubscription, BusError> {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        self.handlers
            .entry(address.to_owned())
            .or_default()
            .senders
            .push((id, tx));
        let guard = HandlerGuard {
            handlers: Arc::clone(&self.handlers),
            address: address.to_owned(),
            id,
        };
        Ok(BusSubscription::new(rx, Box::new(guard)))
    }
}

/// Removes its handler from the registry when dropped.
struct HandlerGuard {
    handlers: Arc<DashMap<String, AddressEntry>>,
    address: String,
    id: u64,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.handlers.get_mut(&self.address) {
            entry.senders.retain(|(id, _)| *id != self.id);
            let empty = entry.senders.is_empty();
            drop(entry);
            if empty {
                self.handlers
                    .remove_if(&self.address, |_, entry| entry.senders.is_empty());
            }
        }
    }
}
