//! Bridge construction and bridge-wide state.
//!
//! A [`Bridge`] owns everything shared across client sessions: the
//! permission rules, the reply-address whitelist, the authorisation cache,
//! the policy hook, and the bus handle. Bridges are independent; two
//! bridges over the same bus share nothing.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::Value;

use crate::{
    auth::{DEFAULT_AUTH_ADDRESS, DEFAULT_AUTH_TIMEOUT, SessionAuth},
    bus::EventBus,
    hooks::{BridgeHook, DefaultHook},
    permissions::{PermittedRule, RuleSet},
    replies::{DEFAULT_REPLY_TIMEOUT, ReplyRegistry},
    session::BridgeSession,
    socket::{ClientSocket, SocketId},
};

/// State shared by every session of one bridge.
pub(crate) struct BridgeShared {
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) rules: RuleSet,
    pub(crate) replies: Arc<ReplyRegistry>,
    pub(crate) auth: SessionAuth,
    pub(crate) hook: Arc<dyn BridgeHook>,
}

/// Bridge options as loaded from configuration.
///
/// The permitted lists use the same JSON shape as the wire rules, so a
/// configuration file can be deserialized straight into this type.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Client-to-bus permission rules.
    pub inbound_permitted: Vec<PermittedRule>,
    /// Bus-to-client permission rules.
    pub outbound_permitted: Vec<PermittedRule>,
    /// TTL of cached authorisations, in milliseconds.
    pub auth_timeout_ms: Option<u64>,
    /// Bus address of the authorisation authority.
    pub auth_address: Option<String>,
}

/// Builder for a [`Bridge`].
///
/// Both permitted lists default to empty, which rejects all traffic in
/// that direction.
pub struct BridgeBuilder {
    bus: Arc<dyn EventBus>,
    inbound: Vec<PermittedRule>,
    outbound: Vec<PermittedRule>,
    auth_timeout: Duration,
    auth_address: String,
    hook: Arc<dyn BridgeHook>,
}

impl BridgeBuilder {
    fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            inbound: Vec::new(),
            outbound: Vec::new(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            auth_address: DEFAULT_AUTH_ADDRESS.to_owned(),
            hook: Arc::new(DefaultHook),
        }
    }

    /// Rules for client-to-bus traffic.
    #[must_use]
    pub fn inbound_permitted(mut self, rules: Vec<PermittedRule>) -> Self {
        self.inbound = rules;
        self
    }

    /// Rules for bus-to-client traffic.
    #[must_use]
    pub fn outbound_permitted(mut self, rules: Vec<PermittedRule>) -> Self {
        self.outbound = rules;
        self
    }

    /// TTL of cached authorisations. Zero is allowed and evicts an entry
    /// on the tick after it is cached.
    #[must_use]
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Bus address of the authorisation authority.
    #[must_use]
    pub fn auth_address(mut self, address: impl Into<String>) -> Self {
        self.auth_address = address.into();
        self
    }

    /// Policy hook consulted around every decision point.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn BridgeHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Apply configuration-file options over the current settings.
    #[must_use]
    pub fn options(mut self, options: BridgeOptions) -> Self {
        self.inbound = options.inbound_permitted;
        self.outbound = options.outbound_permitted;
        if let Some(millis) = options.auth_timeout_ms {
            self.auth_timeout = Duration::from_millis(millis);
        }
        if let Some(address) = options.auth_address {
            self.auth_address = address;
        }
        self
    }

    /// Build the bridge.
    #[must_use]
    pub fn build(self) -> Bridge {
        let shared = Arc::new(BridgeShared {
            rules: RuleSet::new(self.inbound, self.outbound),
            replies: ReplyRegistry::new(DEFAULT_REPLY_TIMEOUT),
            auth: SessionAuth::new(
                Arc::clone(&self.bus),
                Arc::clone(&self.hook),
                self.auth_timeout,
                self.auth_address,
            ),
            hook: self.hook,
            bus: self.bus,
        });
        Bridge { shared }
    }
}

/// Bridges a subject-addressed event bus to untrusted clients.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<BridgeShared>,
}

impl Bridge {
    /// Start configuring a bridge over `bus`.
    #[must_use]
    pub fn builder(bus: Arc<dyn EventBus>) -> BridgeBuilder { BridgeBuilder::new(bus) }

    /// Create the session for a newly connected socket.
    #[must_use]
    pub fn attach(&self, socket: ClientSocket) -> BridgeSession {
        BridgeSession::new(Arc::clone(&self.shared), socket)
    }

    /// Metadata cached for `session_id`, if the session is authorised.
    ///
    /// Introspection for diagnostics and tests; the bridge consults the
    /// cache internally on its own paths.
    #[must_use]
    pub fn auth_metadata(&self, session_id: &str) -> Option<Value> {
        self.shared.auth.metadata(session_id)
    }

    /// Session identifiers currently authorised through `socket`.
    #[must_use]
    pub fn authorised_sessions(&self, socket: SocketId) -> Vec<String> {
        self.shared.auth.socket_sessions(socket)
    }
}
