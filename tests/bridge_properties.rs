//! Behavioural properties of the bridge: default rejection, reply
//! whitelisting and expiry, authorisation TTL, handler replacement, and
//! hook vetoes.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crosswire::{BridgeHook, BusMessage, EventBus, SocketId};
use serde_json::{Value, json};
use tokio::time::{self, Duration};

mod common;
use common::{Harness, TestResult, recv_delivery, rule, settle};

/// With no rules configured, nothing crosses the bridge in either
/// direction.
#[tokio::test]
async fn default_configuration_rejects_everything() -> TestResult {
    let harness = Harness::new(|b| b);
    let mut foo = harness.bus.subscribe("foo").await?;
    let mut client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"send","address":"foo","body":1}"#)
        .await?;
    client
        .session
        .handle_data(br#"{"type":"publish","address":"foo","body":1}"#)
        .await?;
    assert!(recv_delivery(&mut foo).await.is_none());

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;
    harness.bus.publish("bar", json!(1)).await?;
    settle().await;
    client.assert_no_write();
    Ok(())
}

/// The reply address of an approved send is accepted once without a rule,
/// then subject to normal matching again.
#[tokio::test]
async fn reply_address_is_fast_pathed_exactly_once() -> TestResult {
    let harness = Harness::new(|b| b.inbound_permitted(vec![rule(json!({"address": "ask"}))]));
    let mut target = harness.bus.subscribe("ask").await?;
    let mut reply_sink = harness.bus.subscribe("client.reply.1").await?;
    let client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"send","address":"ask","body":{},"replyAddress":"client.reply.1"}"#)
        .await?;
    settle().await;
    assert!(recv_delivery(&mut target).await.is_some());

    // First frame to the reply address rides the whitelist.
    client
        .session
        .handle_data(br#"{"type":"send","address":"client.reply.1","body":"first"}"#)
        .await?;
    assert_eq!(
        recv_delivery(&mut reply_sink).await.ok_or("reply leg dropped")?.body,
        json!("first")
    );

    // Second frame faces the rules, which know nothing of the address.
    client
        .session
        .handle_data(br#"{"type":"send","address":"client.reply.1","body":"second"}"#)
        .await?;
    assert!(recv_delivery(&mut reply_sink).await.is_none());
    Ok(())
}

/// A whitelisted reply address lapses once the reply timeout passes.
#[tokio::test(start_paused = true)]
async fn reply_address_expires_after_timeout() -> TestResult {
    let harness = Harness::new(|b| b.inbound_permitted(vec![rule(json!({"address": "ask"}))]));
    let mut target = harness.bus.subscribe("ask").await?;
    let mut reply_sink = harness.bus.subscribe("client.reply.9").await?;
    let client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"send","address":"ask","body":{},"replyAddress":"client.reply.9"}"#)
        .await?;
    settle().await;
    assert!(recv_delivery(&mut target).await.is_some());

    time::advance(Duration::from_secs(31)).await;
    settle().await;

    client
        .session
        .handle_data(br#"{"type":"send","address":"client.reply.9","body":"late"}"#)
        .await?;
    assert!(recv_delivery(&mut reply_sink).await.is_none());
    Ok(())
}

/// A cached authorisation serves sends until its TTL, then the authority
/// is consulted again.
#[tokio::test(start_paused = true)]
async fn cached_auth_expires_and_reauthorises() -> TestResult {
    let harness = Harness::new(|b| {
        b.inbound_permitted(vec![rule(json!({"address": "foo", "requires_auth": true}))])
            .auth_timeout(Duration::from_secs(10))
    });
    let requests = harness.approving_authority().await?;
    let mut foo = harness.bus.subscribe("foo").await?;
    let client = harness.connect();
    let frame: &[u8] = br#"{"type":"send","address":"foo","body":{},"sessionID":"S"}"#;

    client.session.handle_data(frame).await?;
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert!(recv_delivery(&mut foo).await.is_some());

    time::advance(Duration::from_secs(5)).await;
    settle().await;
    client.session.handle_data(frame).await?;
    assert_eq!(requests.load(Ordering::SeqCst), 1, "cache hit expected");
    assert!(recv_delivery(&mut foo).await.is_some());

    time::advance(Duration::from_secs(6)).await;
    settle().await;
    client.session.handle_data(frame).await?;
    assert_eq!(requests.load(Ordering::SeqCst), 2, "re-authorisation expected");
    assert!(recv_delivery(&mut foo).await.is_some());
    Ok(())
}

/// Registering the same address twice leaves exactly one bus handler.
#[tokio::test]
async fn second_register_replaces_the_first_handler() -> TestResult {
    let harness = Harness::new(|b| b.outbound_permitted(vec![rule(json!({"address": "bar"}))]));
    let mut client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;
    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;

    assert_eq!(harness.bus.handler_count("bar"), 1);
    harness.bus.publish("bar", json!("once")).await?;
    assert!(client.next_envelope().await.is_some());
    settle().await;
    client.assert_no_write();
    Ok(())
}

/// Policy hook with per-decision vetoes and notification counters.
#[derive(Default)]
struct RecordingHook {
    veto_send: bool,
    veto_register: bool,
    veto_unregister: bool,
    veto_delivery: bool,
    veto_authorised: bool,
    closed: AtomicUsize,
    registered: AtomicUsize,
}

impl BridgeHook for RecordingHook {
    fn socket_closed(&self, _socket: SocketId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_send_or_publish(
        &self,
        _socket: SocketId,
        _send: bool,
        _frame: &Value,
        _address: &str,
    ) -> bool {
        !self.veto_send
    }

    fn allow_register(&self, _socket: SocketId, _address: &str) -> bool { !self.veto_register }

    fn registered(&self, _socket: SocketId, _address: &str) {
        self.registered.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_unregister(&self, _socket: SocketId, _address: &str) -> bool { !self.veto_unregister }

    fn allow_delivery(&self, _metadata: &[Value], _address: &str, _message: &BusMessage) -> bool {
        !self.veto_delivery
    }

    fn allow_authorised_send(&self, _frame: &Value, _metadata: &Value) -> bool {
        !self.veto_authorised
    }
}

/// A send/publish veto stops traffic the rules would admit.
#[tokio::test]
async fn send_veto_dominates_the_rules() -> TestResult {
    let hook = Arc::new(RecordingHook {
        veto_send: true,
        ..RecordingHook::default()
    });
    let harness = Harness::new(|b| {
        b.inbound_permitted(vec![rule(json!({"address": "foo"}))])
            .hook(Arc::clone(&hook) as Arc<dyn BridgeHook>)
    });
    let mut foo = harness.bus.subscribe("foo").await?;
    let client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"send","address":"foo","body":1}"#)
        .await?;
    assert!(recv_delivery(&mut foo).await.is_none());
    Ok(())
}

/// A register veto leaves no bus handler behind.
#[tokio::test]
async fn register_veto_installs_nothing() -> TestResult {
    let hook = Arc::new(RecordingHook {
        veto_register: true,
        ..RecordingHook::default()
    });
    let harness = Harness::new(|b| {
        b.outbound_permitted(vec![rule(json!({"address": "bar"}))])
            .hook(Arc::clone(&hook) as Arc<dyn BridgeHook>)
    });
    let client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;

    assert_eq!(harness.bus.handler_count("bar"), 0);
    assert_eq!(hook.registered.load(Ordering::SeqCst), 0);
    Ok(())
}

/// An unregister veto keeps the handler, but teardown still removes it.
#[tokio::test]
async fn unregister_veto_keeps_the_handler_until_close() -> TestResult {
    let hook = Arc::new(RecordingHook {
        veto_unregister: true,
        ..RecordingHook::default()
    });
    let harness = Harness::new(|b| {
        b.outbound_permitted(vec![rule(json!({"address": "bar"}))])
            .hook(Arc::clone(&hook) as Arc<dyn BridgeHook>)
    });
    let client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;
    client
        .session
        .handle_data(br#"{"type":"unregister","address":"bar"}"#)
        .await?;
    settle().await;
    assert_eq!(harness.bus.handler_count("bar"), 1);

    client.session.close().await;
    settle().await;
    assert_eq!(harness.bus.handler_count("bar"), 0);
    assert_eq!(hook.closed.load(Ordering::SeqCst), 1);
    Ok(())
}

/// A delivery veto stops outbound traffic the rules would admit.
#[tokio::test]
async fn delivery_veto_dominates_the_rules() -> TestResult {
    let hook = Arc::new(RecordingHook {
        veto_delivery: true,
        ..RecordingHook::default()
    });
    let harness = Harness::new(|b| {
        b.outbound_permitted(vec![rule(json!({"address": "bar"}))])
            .hook(Arc::clone(&hook) as Arc<dyn BridgeHook>)
    });
    let mut client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;
    harness.bus.publish("bar", json!(1)).await?;
    settle().await;

    client.assert_no_write();
    Ok(())
}

/// An authorised-send veto turns an authority approval into a denial.
#[tokio::test]
async fn authorised_send_veto_denies_despite_authority_approval() -> TestResult {
    let hook = Arc::new(RecordingHook {
        veto_authorised: true,
        ..RecordingHook::default()
    });
    let harness = Harness::new(|b| {
        b.inbound_permitted(vec![rule(json!({"address": "foo", "requires_auth": true}))])
            .hook(Arc::clone(&hook) as Arc<dyn BridgeHook>)
    });
    harness.approving_authority().await?;
    let mut foo = harness.bus.subscribe("foo").await?;
    let mut client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"send","address":"foo","body":{},"sessionID":"S"}"#)
        .await?;

    let denial = client.next_envelope().await.ok_or("no denial written")?;
    assert_eq!(denial["address"], "client.auth");
    assert!(recv_delivery(&mut foo).await.is_none());
    assert!(harness.bridge.auth_metadata("S").is_none());
    Ok(())
}

/// Outbound messages on auth-requiring rules are dropped for sockets with
/// no cached authorisation.
#[tokio::test]
async fn outbound_auth_rule_drops_unauthenticated_sockets() -> TestResult {
    let harness = Harness::new(|b| {
        b.outbound_permitted(vec![rule(json!({"address": "bar", "requires_auth": true}))])
    });
    let mut client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;
    harness.bus.publish("bar", json!(1)).await?;
    settle().await;

    client.assert_no_write();
    Ok(())
}

/// A delivery carrying a reply address arms the whitelist for the
/// client's answer.
#[tokio::test]
async fn delivered_reply_address_admits_the_clients_answer() -> TestResult {
    let harness = Harness::new(|b| b.outbound_permitted(vec![rule(json!({"address": "bar"}))]));
    let mut client = harness.connect();

    client
        .session
        .handle_data(br#"{"type":"register","address":"bar"}"#)
        .await?;
    settle().await;

    // A server-side request through the bus carries a generated reply
    // address to the client.
    let bus = Arc::clone(&harness.bus);
    let server = tokio::spawn(async move { bus.request("bar", json!("question")).await });

    let envelope = client.next_envelope().await.ok_or("no envelope")?;
    assert_eq!(envelope["body"], json!("question"));
    let reply_to = envelope["replyAddress"].as_str().ok_or("no reply address")?;

    // The client answers on the delivered reply address with no matching
    // inbound rule.
    let answer = format!(r#"{{"type":"send","address":"{reply_to}","body":"answer"}}"#);
    client.session.handle_data(answer.as_bytes()).await?;

    let reply = server.await??;
    assert_eq!(reply.body, json!("answer"));
    Ok(())
}
