//! Policy hooks consulted around every bridge decision point.
//!
//! A [`BridgeHook`] lets embedding applications veto or observe traffic
//! beyond what the declarative permission rules express. Every method has
//! a permissive default, so implementors override only the decisions they
//! care about.

use serde_json::Value;

use crate::{bus::BusMessage, socket::SocketId};

/// User-supplied policy callbacks.
///
/// Boolean methods gate the corresponding action; returning `false`
/// suppresses it even when the permission rules and authorisation would
/// allow it. Void methods are notifications.
pub trait BridgeHook: Send + Sync {
    /// The socket has been closed.
    fn socket_closed(&self, _socket: SocketId) {}

    /// A client frame is about to be sent or published to the bus.
    ///
    /// `send` is true for point-to-point sends, false for publishes. The
    /// frame is the raw JSON object as received from the client.
    fn allow_send_or_publish(
        &self,
        _socket: SocketId,
        _send: bool,
        _frame: &Value,
        _address: &str,
    ) -> bool {
        true
    }

    /// A client is about to register a handler on `address`.
    fn allow_register(&self, _socket: SocketId, _address: &str) -> bool { true }

    /// A client has registered a handler on `address`.
    fn registered(&self, _socket: SocketId, _address: &str) {}

    /// A client is about to unregister its handler on `address`.
    ///
    /// The return value is ignored during socket teardown, where every
    /// handler is removed unconditionally.
    fn allow_unregister(&self, _socket: SocketId, _address: &str) -> bool { true }

    /// A bus message is about to be written to the client.
    ///
    /// `auth_metadata` holds the metadata of every authorisation currently
    /// cached for the socket, and is empty for unauthenticated sockets.
    fn allow_delivery(
        &self,
        _auth_metadata: &[Value],
        _address: &str,
        _message: &BusMessage,
    ) -> bool {
        true
    }

    /// An authorised client send is about to be admitted.
    ///
    /// Consulted on every send that required authorisation, including ones
    /// satisfied from the cache. `metadata` is the authority's reply body
    /// augmented with the session identifier.
    fn allow_authorised_send(&self, _frame: &Value, _metadata: &Value) -> bool { true }
}

/// Hook used when the application supplies none: every decision passes.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DefaultHook;

impl BridgeHook for DefaultHook {}
