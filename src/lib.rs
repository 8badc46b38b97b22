#![doc(html_root_url = "https://docs.rs/crosswire/latest")]
//! Public API for the `crosswire` library.
//!
//! This crate bridges a subject-addressed publish/subscribe event bus to
//! untrusted browser-style clients speaking JSON frames over a duplex
//! socket. The bridge enforces independently configured inbound and
//! outbound permission rules, delegates session authorisation to an
//! authority living on the bus, caches authorisations with a TTL, and
//! transparently trusts the reply legs of messages it has approved.
//!
//! A [`Bridge`] is built over any [`bus::EventBus`] implementation; the
//! crate ships [`bus::LocalBus`] for in-process use. Each connected client
//! socket gets a [`session::BridgeSession`] driven by its transport
//! adapter.

pub mod bridge;
pub mod bus;
pub mod frame;
pub mod hooks;
pub mod permissions;
pub mod session;
pub mod socket;

mod auth;
mod replies;
mod timer;

pub use bridge::{Bridge, BridgeBuilder, BridgeOptions};
pub use bus::{BusError, BusMessage, BusSubscription, EventBus, LocalBus};
pub use frame::{ClientFrame, Envelope, ProtocolError, SendFrame};
pub use hooks::BridgeHook;
pub use permissions::{Direction, Match, PermittedRule, RuleSet};
pub use session::{BridgeSession, SocketEvent};
pub use socket::{ClientSocket, SocketId};
