//! Shared utilities for bridge integration tests.
//!
//! Provides a harness pairing a [`LocalBus`] with a [`Bridge`], helpers to
//! connect test clients, and an approving auth authority fixture. These
//! helpers reduce duplication across test modules.
#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use crosswire::{
    Bridge, BridgeBuilder, BridgeSession, BusMessage, BusSubscription, ClientSocket, EventBus,
    LocalBus, PermittedRule, SocketId,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Bus address of the default authorisation authority.
pub const AUTH_ADDRESS: &str = "vertx.basicauthmanager.authorise";

/// A connected test client.
pub struct TestClient {
    pub session: BridgeSession,
    pub writes: mpsc::Receiver<Bytes>,
    pub socket_id: SocketId,
}

impl TestClient {
    /// Next envelope written to this client, or `None` within the grace
    /// period.
    pub async fn next_envelope(&mut self) -> Option<Value> {
        let bytes = tokio::time::timeout(Duration::from_millis(200), self.writes.recv())
            .await
            .ok()
            .flatten()?;
        Some(serde_json::from_slice(&bytes).expect("envelope is JSON"))
    }

    /// Assert nothing has been written to this client.
    pub fn assert_no_write(&mut self) {
        assert!(
            self.writes.try_recv().is_err(),
            "unexpected envelope written to client"
        );
    }
}

/// A local bus with a bridge over it.
pub struct Harness {
    pub bus: Arc<LocalBus>,
    pub bridge: Bridge,
}

impl Harness {
    /// Build a harness, letting the caller finish the bridge configuration.
    pub fn new(configure: impl FnOnce(BridgeBuilder) -> BridgeBuilder) -> Self {
        let bus = Arc::new(LocalBus::new());
        let builder = Bridge::builder(Arc::clone(&bus) as Arc<dyn EventBus>);
        let bridge = configure(builder).build();
        Self { bus, bridge }
    }

    /// Connect a client socket to the bridge.
    pub fn connect(&self) -> TestClient {
        let (socket, writes) = ClientSocket::channel(16);
        let socket_id = socket.id();
        TestClient {
            session: self.bridge.attach(socket),
            writes,
            socket_id,
        }
    }

    /// Install an authority on the default auth address that approves
    /// every request, counting how many it saw.
    pub async fn approving_authority(&self) -> TestResult<Arc<AtomicUsize>> {
        let mut subscription = self.bus.subscribe(AUTH_ADDRESS).await?;
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(reply_to) = message.reply_address {
                    let _ = bus.send(&reply_to, json!({"status": "ok"})).await;
                }
            }
        });
        Ok(requests)
    }

    /// Install an authority that denies every request.
    pub async fn denying_authority(&self) -> TestResult<()> {
        let mut subscription = self.bus.subscribe(AUTH_ADDRESS).await?;
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if let Some(reply_to) = message.reply_address {
                    let _ = bus.send(&reply_to, json!({"status": "denied"})).await;
                }
            }
        });
        Ok(())
    }
}

/// Deserialize a permission rule from its JSON form.
pub fn rule(value: Value) -> PermittedRule {
    serde_json::from_value(value).expect("rule deserializes")
}

/// Next bus delivery on `subscription`, or `None` within the grace period.
pub async fn recv_delivery(subscription: &mut BusSubscription) -> Option<BusMessage> {
    tokio::time::timeout(Duration::from_millis(200), subscription.recv())
        .await
        .ok()
        .flatten()
}

/// Yield repeatedly so spawned bridge tasks settle.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
