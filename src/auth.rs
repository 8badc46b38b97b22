//! Session authorisation against the bus-resident auth authority.
//!
//! Authorisations are cached per session identifier with an expiry timer
//! each, and indexed the other way round by socket so a closing socket can
//! cancel everything it holds. The coordinator consults the cache first
//! and otherwise forwards the client's frame verbatim to the authority
//! address, caching the authority's metadata on success.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;

use crate::{
    bus::{BusError, EventBus},
    hooks::BridgeHook,
    socket::SocketId,
    timer::{self, TimerHandle},
};

/// Default TTL for cached authorisations.
pub(crate) const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bus address of the authorisation authority.
pub(crate) const DEFAULT_AUTH_ADDRESS: &str = "vertx.basicauthmanager.authorise";

/// One cached authorisation.
#[derive(Debug)]
struct Authorisation {
    socket: SocketId,
    metadata: Value,
    timer: TimerHandle,
}

/// The coupled session and socket indexes.
///
/// An entry in `by_session` for a socket exists exactly when that session
/// identifier is in the socket's `by_socket` set; both are mutated under
/// the one lock.
#[derive(Debug, Default)]
struct AuthTable {
    by_session: HashMap<String, Authorisation>,
    by_socket: HashMap<SocketId, HashSet<String>>,
}

/// Cache of authorised sessions with per-entry expiry.
#[derive(Debug)]
pub(crate) struct AuthCache {
    table: Mutex<AuthTable>,
    timeout: Duration,
}

impl AuthCache {
    pub(crate) fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(AuthTable::default()),
            timeout,
        })
    }

    /// Cache `metadata` for `session_id`, arming its expiry timer.
    ///
    /// A re-authorisation replaces the previous entry and cancels its
    /// timer, so the fresh entry lives a full TTL.
    pub(crate) fn put(self: &Arc<Self>, session_id: &str, socket: SocketId, metadata: Value) {
        let timer = {
            let cache = Arc::clone(self);
            let session_id = session_id.to_owned();
            timer::schedule(self.timeout, move || cache.evict(&session_id))
        };

        let mut table = self.table.lock().expect("lock poisoned");
        if let Some(previous) = table.by_session.insert(
            session_id.to_owned(),
            Authorisation {
                socket,
                metadata,
                timer,
            },
        ) {
            previous.timer.cancel();
            if previous.socket != socket {
                remove_socket_entry(&mut table, previous.socket, session_id);
            }
        }
        table
            .by_socket
            .entry(socket)
            .or_default()
            .insert(session_id.to_owned());
    }

    /// Metadata cached for `session_id`, if still valid.
    pub(crate) fn metadata(&self, session_id: &str) -> Option<Value> {
        self.table
            .lock()
            .expect("lock poisoned")
            .by_session
            .get(session_id)
            .map(|auth| auth.metadata.clone())
    }

    /// Whether `socket` holds any authorisation.
    pub(crate) fn is_authorised(&self, socket: SocketId) -> bool {
        self.table
            .lock()
            .expect("lock poisoned")
            .by_socket
            .contains_key(&socket)
    }

    /// Metadata of every authorisation held by `socket`.
    pub(crate) fn socket_metadata(&self, socket: SocketId) -> Vec<Value> {
        let table = self.table.lock().expect("lock poisoned");
        let Some(sessions) = table.by_socket.get(&socket) else {
            return Vec::new();
        };
        sessions
            .iter()
            .filter_map(|sid| table.by_session.get(sid))
            .map(|auth| auth.metadata.clone())
            .collect()
    }

    /// Session identifiers currently authorised through `socket`.
    pub(crate) fn socket_sessions(&self, socket: SocketId) -> Vec<String> {
        self.table
            .lock()
            .expect("lock poisoned")
            .by_socket
            .get(&socket)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop one entry, typically from its expiry timer.
    pub(crate) fn evict(&self, session_id: &str) {
        let mut table = self.table.lock().expect("lock poisoned");
        let Some(auth) = table.by_session.remove(session_id) else {
            return;
        };
        remove_socket_entry(&mut table, auth.socket, session_id);
        log::debug!("authorisation for session {session_id} expired");
    }

    /// Cancel and drop every authorisation held by `socket`.
    pub(crate) fn cancel_all_for(&self, socket: SocketId) {
        let mut table = self.table.lock().expect("lock poisoned");
        let Some(sessions) = table.by_socket.remove(&socket) else {
            return;
        };
        for session_id in sessions {
            if let Some(auth) = table.by_session.remove(&session_id) {
                auth.timer.cancel();
            }
        }
    }
}

fn remove_socket_entry(table: &mut AuthTable, socket: SocketId, session_id: &str) {
    if let Some(sessions) = table.by_socket.get_mut(&socket) {
        sessions.remove(session_id);
        if sessions.is_empty() {
            table.by_socket.remove(&socket);
        }
    }
}

/// Cache plus the delegation path to the auth authority.
pub(crate) struct SessionAuth {
    cache: Arc<AuthCache>,
    bus: Arc<dyn EventBus>,
    hook: Arc<dyn BridgeHook>,
    authority: String,
}

impl SessionAuth {
    pub(crate) fn new(
        bus: Arc<dyn EventBus>,
        hook: Arc<dyn BridgeHook>,
        timeout: Duration,
        authority: String,
    ) -> Self {
        Self {
            cache: AuthCache::new(timeout),
            bus,
            hook,
            authority,
        }
    }

    /// Decide whether `frame` may proceed under `session_id`.
    ///
    /// A cached session passes subject to the hook; otherwise the raw
    /// frame goes to the authority and its reply decides. Successful
    /// authorisations are cached against `socket`.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`BusError`] when the authority round trip
    /// fails; callers treat that as a denial.
    pub(crate) async fn authorise(
        &self,
        frame: &Value,
        session_id: &str,
        socket: SocketId,
    ) -> Result<bool, BusError> {
        if let Some(metadata) = self.cache.metadata(session_id) {
            return Ok(self.hook.allow_authorised_send(frame, &metadata));
        }

        let reply = self.bus.request(&self.authority, frame.clone()).await?;
        let mut metadata = reply.body;
        if let Some(object) = metadata.as_object_mut() {
            object.insert(
                "sessionID".to_owned(),
                Value::String(session_id.to_owned()),
            );
        }

        let status_ok = metadata.get("status").and_then(Value::as_str) == Some("ok");
        let authed = status_ok && self.hook.allow_authorised_send(frame, &metadata);
        if authed {
            self.cache.put(session_id, socket, metadata);
        }
        Ok(authed)
    }

    pub(crate) fn metadata(&self, session_id: &str) -> Option<Value> {
        self.cache.metadata(session_id)
    }

    pub(crate) fn is_authorised(&self, socket: SocketId) -> bool {
        self.cache.is_authorised(socket)
    }

    pub(crate) fn socket_metadata(&self, socket: SocketId) -> Vec<Value> {
        self.cache.socket_metadata(socket)
    }

    pub(crate) fn socket_sessions(&self, socket: SocketId) -> Vec<String> {
        self.cache.socket_sessions(socket)
    }

    pub(crate) fn cancel_all_for(&self, socket: SocketId) {
        self.cache.cancel_all_for(socket);
    }
}
