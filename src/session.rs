//! Per-socket bridge sessions.
//!
//! A session owns the socket's map of bus subscriptions, dispatches parsed
//! client frames, runs the permission and authorisation pipeline in both
//! directions, and tears everything down when the socket's end event
//! fires. One session exists per connected client socket.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    bridge::BridgeShared,
    bus::{BusSubscription, EventBus},
    frame::{ClientFrame, Envelope, ProtocolError, SendFrame},
    permissions::{Direction, Match},
    socket::ClientSocket,
};

/// Address denial envelopes are delivered on.
const REJECT_AUTH_ADDRESS: &str = "client.auth";

/// Events a transport adapter feeds into [`BridgeSession::run`].
#[derive(Debug)]
pub enum SocketEvent {
    /// Raw bytes of one client frame.
    Data(Bytes),
    /// The socket's end event.
    Closed,
}

/// The bridge-side state of one client socket.
///
/// Created by [`crate::Bridge::attach`]. Transports either feed events
/// through [`BridgeSession::run`] or call [`BridgeSession::handle_data`]
/// and [`BridgeSession::close`] directly; concurrent `handle_data` calls
/// are permitted, so a transport may also process frames in parallel
/// while an authorisation round trip is outstanding.
pub struct BridgeSession {
    shared: Arc<BridgeShared>,
    socket: ClientSocket,
    handlers: Mutex<HashMap<String, SubscriptionHandle>>,
}

/// Forwarding task for one registered address.
struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop forwarding and wait for the task to drop its subscription,
    /// which unregisters the bus handler.
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

impl BridgeSession {
    pub(crate) fn new(shared: Arc<BridgeShared>, socket: ClientSocket) -> Self {
        Self {
            shared,
            socket,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// The socket this session serves.
    #[must_use]
    pub fn socket(&self) -> &ClientSocket { &self.socket }

    /// Process one raw frame from the client.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the frame is malformed. The error
    /// is fatal to the frame only; the session remains usable and the
    /// transport decides whether to disconnect.
    pub async fn handle_data(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let (frame, raw) = ClientFrame::parse(data)?;
        match frame {
            ClientFrame::Send(fields) => self.handle_send_or_publish(true, fields, &raw).await,
            ClientFrame::Publish(fields) => self.handle_send_or_publish(false, fields, &raw).await,
            ClientFrame::Register { address } => {
                self.register(&address).await;
                Ok(())
            }
            ClientFrame::Unregister { address } => {
                self.unregister(&address).await;
                Ok(())
            }
        }
    }

    /// Drive the session from a transport event stream.
    ///
    /// Protocol errors are logged and the stream continues; the loop ends
    /// on [`SocketEvent::Closed`] or when the sender side is dropped, and
    /// tears the session down either way.
    pub async fn run(self, mut events: mpsc::Receiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Data(data) => {
                    if let Err(err) = self.handle_data(&data).await {
                        log::error!("client protocol error: {err}");
                    }
                }
                SocketEvent::Closed => break,
            }
        }
        self.close().await;
    }

    /// Tear the session down after the socket's end event.
    ///
    /// Every registered bus handler is removed, every authorisation held
    /// by the socket is cancelled, and the `socket_closed` hook fires.
    pub async fn close(&self) {
        let drained: Vec<(String, SubscriptionHandle)> = {
            let mut handlers = self.handlers.lock().expect("lock poisoned");
            handlers.drain().collect()
        };
        for (address, handle) in drained {
            // The hook is notified but cannot keep a handler alive during
            // teardown.
            let _ = self
                .shared
                .hook
                .allow_unregister(self.socket.id(), &address);
            handle.stop().await;
        }
        self.shared.auth.cancel_all_for(self.socket.id());
        self.shared.hook.socket_closed(self.socket.id());
    }

    async fn handle_send_or_publish(
        &self,
        send: bool,
        fields: SendFrame,
        raw: &Value,
    ) -> Result<(), ProtocolError> {
        let socket_id = self.socket.id();
        if !self
            .shared
            .hook
            .allow_send_or_publish(socket_id, send, raw, &fields.address)
        {
            return Ok(());
        }
        let body = fields.body.ok_or(ProtocolError::MissingField("body"))?;

        if log::log_enabled!(log::Level::Debug) {
            let rendered = body.to_string();
            // Keep credentials out of the logs.
            if !rendered.contains("password") {
                log::debug!("inbound frame for {}: {rendered}", fields.address);
            }
        }

        let outcome = self.check_inbound(&fields.address, &body);
        if !outcome.does_match {
            log::debug!(
                "inbound message for {} rejected: no matching rule",
                fields.address
            );
            return Ok(());
        }

        if outcome.requires_auth {
            let Some(session_id) = fields.session_id.as_deref() else {
                log::debug!(
                    "inbound message for {} rejected: auth required but sessionID missing",
                    fields.address
                );
                self.deny().await;
                return Ok(());
            };
            match self.shared.auth.authorise(raw, session_id, socket_id).await {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!(
                        "inbound message for {} rejected: session {session_id} not authorised",
                        fields.address
                    );
                    self.deny().await;
                    return Ok(());
                }
                Err(err) => {
                    log::error!("error performing authorisation: {err}");
                    self.deny().await;
                    return Ok(());
                }
            }
        }

        self.dispatch(send, &fields.address, body, fields.reply_address)
            .await;
        Ok(())
    }

    /// Inbound match check with the reply fast path.
    ///
    /// Replies to messages the bridge already approved bypass the rules
    /// and never require auth; each whitelisted address is good once.
    fn check_inbound(&self, address: &str, body: &Value) -> Match {
        if self.shared.replies.consume(address) {
            return Match::REPLY;
        }
        self.shared.rules.check(Direction::Inbound, address, body)
    }

    /// Forward an approved message to the bus.
    async fn dispatch(&self, send: bool, address: &str, body: Value, reply_address: Option<String>) {
        log::debug!("forwarding message to address {address} on the bus");
        match (send, reply_address) {
            (true, Some(reply_to)) => {
                // Trust the reply leg up front so the bus can route it
                // back without re-matching the rules.
                self.shared.replies.add(&reply_to);
                let shared = Arc::clone(&self.shared);
                let socket = self.socket.clone();
                let address = address.to_owned();
                tokio::spawn(async move {
                    match shared.bus.request(&address, body).await {
                        Ok(reply) => {
                            if let Some(next) = reply.reply_address.as_deref() {
                                shared.replies.add(next);
                            }
                            deliver(&socket, &reply_to, &reply.body, reply.reply_address.as_deref())
                                .await;
                        }
                        Err(err) => {
                            log::debug!("no reply forwarded for {address}: {err}");
                        }
                    }
                });
            }
            (true, None) => {
                if let Err(err) = self.shared.bus.send(address, body).await {
                    log::debug!("send to {address} went nowhere: {err}");
                }
            }
            (false, _) => {
                if let Err(err) = self.shared.bus.publish(address, body).await {
                    log::debug!("publish to {address} failed: {err}");
                }
            }
        }
    }

    /// Install the outbound filter for `address`.
    ///
    /// Registering over an existing subscription replaces it; the
    /// superseded bus handler is unregistered rather than leaked.
    async fn register(&self, address: &str) {
        let socket_id = self.socket.id();
        if !self.shared.hook.allow_register(socket_id, address) {
            return;
        }
        // The previous handler must be fully off the bus before the
        // replacement goes on, or a publish in between reaches both.
        let previous = self
            .handlers
            .lock()
            .expect("lock poisoned")
            .remove(address);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        let subscription = match self.shared.bus.subscribe(address).await {
            Ok(subscription) => subscription,
            Err(err) => {
                log::error!("failed to install bus handler for {address}: {err}");
                return;
            }
        };
        let task = tokio::spawn(outbound_filter(
            Arc::clone(&self.shared),
            self.socket.clone(),
            address.to_owned(),
            subscription,
        ));
        self.handlers
            .lock()
            .expect("lock poisoned")
            .insert(address.to_owned(), SubscriptionHandle { task });
        self.shared.hook.registered(socket_id, address);
    }

    async fn unregister(&self, address: &str) {
        if !self.shared.hook.allow_unregister(self.socket.id(), address) {
            return;
        }
        let removed = self
            .handlers
            .lock()
            .expect("lock poisoned")
            .remove(address);
        if let Some(handle) = removed {
            handle.stop().await;
        }
    }

    /// Tell the client its message was rejected by authorisation.
    async fn deny(&self) {
        deliver(
            &self.socket,
            REJECT_AUTH_ADDRESS,
            &json!({"status": "denied"}),
            None,
        )
        .await;
    }
}

/// Bus-to-client filter installed by a register frame.
///
/// Runs until the subscription closes or the session stops it; dropping
/// the subscription unregisters the bus handler.
async fn outbound_filter(
    shared: Arc<BridgeShared>,
    socket: ClientSocket,
    address: String,
    mut subscription: BusSubscription,
) {
    while let Some(message) = subscription.recv().await {
        let outcome = shared.rules.check(Direction::Outbound, &address, &message.body);
        if !outcome.does_match {
            log::debug!("outbound message for {address} rejected: no matching rule");
            continue;
        }
        if outcome.requires_auth && !shared.auth.is_authorised(socket.id()) {
            log::debug!(
                "outbound message for {address} rejected: auth required and socket is not authed"
            );
            continue;
        }
        let metadata = shared.auth.socket_metadata(socket.id());
        if !shared.hook.allow_delivery(&metadata, &address, &message) {
            log::debug!("outbound message for {address} rejected by delivery hook");
            continue;
        }
        if let Some(reply_to) = message.reply_address.as_deref() {
            // The client's reply to this delivery is accepted implicitly.
            shared.replies.add(reply_to);
        }
        deliver(&socket, &address, &message.body, message.reply_address.as_deref()).await;
    }
}

/// Serialize an envelope and write it to the socket.
async fn deliver(socket: &ClientSocket, address: &str, body: &Value, reply_address: Option<&str>) {
    let envelope = Envelope {
        address,
        body,
        reply_address,
    };
    match envelope.to_bytes() {
        Ok(bytes) => socket.write(bytes).await,
        Err(err) => log::error!("failed to serialize envelope for {address}: {err}"),
    }
}
