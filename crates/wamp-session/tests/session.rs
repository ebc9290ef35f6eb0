//! Session behavior end to end over an in-memory transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};
use tracing::Level;

use wamp_core::logging::capture_logs;
use wamp_core::{CallError, Message, PROTOCOL_VERSION, PrefixError, SessionError, SessionId};
use wamp_session::{Diagnostic, SessionConfig, SessionState, WampSession};
use wamp_transport::{MemoryPeer, MemoryTransport};

const URL: &str = "memory://test";

fn welcome(session_id: &str) -> Message {
    Message::Welcome {
        session_id: SessionId::from(session_id),
        protocol_version: 1,
        server_ident: "srv/1.0".into(),
    }
}

fn session_with(config: SessionConfig) -> (WampSession, MemoryPeer) {
    let (transport, inbound, peer) = MemoryTransport::pair();
    let session = WampSession::new(Arc::new(transport), inbound, config);
    (session, peer)
}

/// Session whose transport greets during `connect`, already connected.
async fn connected() -> (WampSession, MemoryPeer) {
    let (transport, inbound, peer) = MemoryTransport::pair();
    let transport = transport.with_welcome(&welcome("sess-1"));
    let session = WampSession::new(Arc::new(transport), inbound, SessionConfig::default());
    let _ = session.connect(URL).await.unwrap();
    (session, peer)
}

/// Outbound CALL's id, asserting the rest of its shape.
fn call_id_of(message: &Value, procedure: &str, args: &[Value]) -> String {
    let items = message.as_array().expect("CALL is an array");
    assert_eq!(items[0], json!(2));
    assert_eq!(items[2], json!(procedure));
    assert_eq!(&items[3..], args);
    items[1].as_str().expect("call id is a string").to_owned()
}

/// Round-trip a call so every message delivered before it has been processed.
async fn sync(session: &WampSession, peer: &mut MemoryPeer) {
    let pending = session.call::<Value>("sync", vec![]);
    let outbound = peer.next_outbound().await.unwrap();
    let id = call_id_of(&outbound, "sync", &[]);
    peer.deliver(json!([3, id, null]));
    let _ = pending.await.unwrap();
}

// ─── Connect ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_completes_with_session_id() {
    let (session, peer) = connected().await;
    assert_eq!(session.session_id().map(SessionId::as_str), Some("sess-1"));
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(peer.connected_url().as_deref(), Some(URL));

    let welcome = session.welcome().unwrap();
    assert_eq!(welcome.protocol_version, 1);
    assert_eq!(welcome.server_ident, "srv/1.0");
}

#[tokio::test]
async fn connect_waits_for_welcome() {
    let (session, peer) = session_with(SessionConfig::default());
    let mut connect = Box::pin(session.connect(URL));
    assert!(futures::poll!(&mut connect).is_pending());
    assert!(futures::poll!(&mut connect).is_pending());

    peer.deliver(json!([0, "sess-1", 1, "srv/1.0"]));
    let welcome = connect.await.unwrap();
    assert_eq!(welcome.session_id.as_str(), "sess-1");
}

#[tokio::test]
async fn repeated_welcome_completes_connect_once() {
    let (session, mut peer) = session_with(SessionConfig::default());
    let mut diagnostics = session.diagnostics();
    peer.deliver(json!([0, "sess-1", 1, "srv/1.0"]));
    peer.deliver(json!([0, "sess-2", 1, "srv/1.0"]));

    let welcome = session.connect(URL).await.unwrap();
    assert_eq!(welcome.session_id.as_str(), "sess-1");

    peer.deliver(json!([0, "sess-3", 1, "srv/1.0"]));
    sync(&session, &mut peer).await;

    assert_eq!(session.session_id().map(SessionId::as_str), Some("sess-1"));
    assert_eq!(session.state(), SessionState::Active);
    assert_matches!(
        diagnostics.try_recv(),
        Ok(Diagnostic::DuplicateWelcome { session_id }) if session_id.as_str() == "sess-2"
    );
    assert_matches!(
        diagnostics.try_recv(),
        Ok(Diagnostic::DuplicateWelcome { session_id }) if session_id.as_str() == "sess-3"
    );
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let (session, _peer) = connected().await;
    assert_matches!(session.connect(URL).await, Err(SessionError::AlreadyConnected));
}

#[tokio::test]
async fn close_before_welcome_fails_connect() {
    let (session, peer) = session_with(SessionConfig::default());
    let mut connect = Box::pin(session.connect(URL));
    assert!(futures::poll!(&mut connect).is_pending());

    peer.close();
    assert_matches!(connect.await, Err(SessionError::ClosedBeforeWelcome));
    assert_eq!(session.state(), SessionState::Closed);
    assert_matches!(session.connect(URL).await, Err(SessionError::ClosedBeforeWelcome));
}

#[tokio::test]
async fn terse_welcome_completes_connect() {
    let (session, peer) = session_with(SessionConfig::default());
    peer.deliver(json!([0, "sess-1"]));

    let welcome = session.connect(URL).await.unwrap();
    assert_eq!(welcome.session_id.as_str(), "sess-1");
    assert_eq!(welcome.protocol_version, PROTOCOL_VERSION);
    assert!(welcome.server_ident.is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_applies_when_configured() {
    let config = SessionConfig::default().with_connect_timeout(Duration::from_secs(1));
    let (session, _peer) = session_with(config);
    assert_matches!(
        session.connect(URL).await,
        Err(SessionError::ConnectTimeout { timeout_ms: 1000 })
    );
    assert_eq!(session.state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn connect_can_be_retried_after_a_timeout() {
    let config = SessionConfig::default().with_connect_timeout(Duration::from_millis(100));
    let (session, peer) = session_with(config);
    assert_matches!(
        session.connect(URL).await,
        Err(SessionError::ConnectTimeout { timeout_ms: 100 })
    );

    peer.deliver(json!([0, "sess-late", 1, "srv/1.0"]));
    let welcome = session.connect(URL).await.unwrap();
    assert_eq!(welcome.session_id.as_str(), "sess-late");
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(peer.connected_url().as_deref(), Some(URL));
    assert_matches!(session.connect(URL).await, Err(SessionError::AlreadyConnected));
}

// ─── Calls ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn call_resolves_with_result() {
    let (session, mut peer) = connected().await;
    let pending = session.call::<i64>("math/add", vec![json!(2), json!(3)]);

    let outbound = peer.try_next_outbound().expect("CALL sent before awaiting");
    let id = call_id_of(&outbound, "math/add", &[json!(2), json!(3)]);
    assert_eq!(id.len(), 20);
    assert_eq!(pending.call_id().as_str(), id);

    peer.deliver(json!([3, id, 5]));
    assert_eq!(pending.await.unwrap(), 5);
    assert_eq!(session.pending_calls(), 0);
}

#[tokio::test]
async fn call_error_carries_peer_detail() {
    let (session, mut peer) = connected().await;
    let pending = session.call::<i64>("math/add", vec![json!(2), json!(3)]);
    let id = call_id_of(&peer.next_outbound().await.unwrap(), "math/add", &[json!(2), json!(3)]);

    peer.deliver(json!([4, id, "bad args"]));
    let error = pending.await.unwrap_err();
    assert!(error.is_remote());
    assert_matches!(
        error,
        CallError::Remote { error, details } if error == json!("bad args") && details.is_empty()
    );
}

#[tokio::test]
async fn call_error_keeps_trailing_details() {
    let (session, mut peer) = connected().await;
    let pending = session.call::<Value>("math/div", vec![json!(1), json!(0)]);
    let id = call_id_of(&peer.next_outbound().await.unwrap(), "math/div", &[json!(1), json!(0)]);

    peer.deliver(json!([4, id, "http://example.com/error#div", "division by zero", {"arg": 1}]));
    assert_matches!(
        pending.await,
        Err(CallError::Remote { error, details })
            if error == json!("http://example.com/error#div")
                && details == vec![json!("division by zero"), json!({"arg": 1})]
    );
}

#[tokio::test]
async fn result_of_wrong_type_is_a_call_failure() {
    let (session, mut peer) = connected().await;
    let pending = session.call::<i64>("echo", vec![json!("five")]);
    let id = call_id_of(&peer.next_outbound().await.unwrap(), "echo", &[json!("five")]);

    peer.deliver(json!([3, id, "five"]));
    assert_matches!(pending.await, Err(CallError::Decode(_)));
}

#[tokio::test]
async fn concurrent_calls_use_distinct_ids_and_resolve_independently() {
    let (session, mut peer) = connected().await;
    let calls: Vec<_> = (0..100)
        .map(|i| session.call::<i64>("math/id", vec![json!(i)]))
        .collect();

    let outbound = peer.drain();
    assert_eq!(outbound.len(), 100);
    let ids: Vec<String> = outbound
        .iter()
        .enumerate()
        .map(|(i, m)| call_id_of(m, "math/id", &[json!(i)]))
        .collect();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);

    for (i, id) in ids.iter().enumerate().rev() {
        peer.deliver(json!([3, id, i]));
    }
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), i64::try_from(i).unwrap());
    }
}

#[tokio::test]
async fn unknown_and_duplicate_results_are_ignored() {
    let (session, mut peer) = connected().await;
    let pending = session.call::<i64>("math/add", vec![json!(1), json!(1)]);
    let id = call_id_of(&peer.next_outbound().await.unwrap(), "math/add", &[json!(1), json!(1)]);

    peer.deliver(json!([3, "not-a-call", 1]));
    peer.deliver(json!([3, id, 2]));
    peer.deliver(json!([3, id, 3]));
    peer.deliver(json!([4, id, "late"]));
    assert_eq!(pending.await.unwrap(), 2);

    sync(&session, &mut peer).await;
    assert_eq!(session.stats().unmatched_results, 3);
}

#[tokio::test(start_paused = true)]
async fn call_timeout_unregisters_and_ignores_late_result() {
    let config = SessionConfig::default().with_call_timeout(Duration::from_millis(500));
    let (transport, inbound, mut peer) = MemoryTransport::pair();
    let transport = transport.with_welcome(&welcome("sess-1"));
    let session = WampSession::new(Arc::new(transport), inbound, config);
    let _ = session.connect(URL).await.unwrap();

    let pending = session.call::<i64>("slow", vec![]);
    let id = call_id_of(&peer.next_outbound().await.unwrap(), "slow", &[]);
    assert_matches!(pending.await, Err(CallError::Timeout { timeout_ms: 500 }));
    assert_eq!(session.pending_calls(), 0);

    peer.deliver(json!([3, id, 1]));
    let quick = session.call_with_timeout::<i64>("quick", vec![], Duration::from_secs(5));
    let quick_id = call_id_of(&peer.next_outbound().await.unwrap(), "quick", &[]);
    peer.deliver(json!([3, quick_id, 7]));
    assert_eq!(quick.await.unwrap(), 7);
    assert_eq!(session.stats().unmatched_results, 1);
}

#[tokio::test]
async fn dropping_a_call_unregisters_it() {
    let (session, _peer) = connected().await;
    let pending = session.call::<Value>("math/add", vec![]);
    assert_eq!(session.pending_calls(), 1);
    drop(pending);
    assert_eq!(session.pending_calls(), 0);
}

#[tokio::test]
async fn close_rejects_pending_calls() {
    let (session, peer) = connected().await;
    let first = session.call::<Value>("a", vec![]);
    let second = session.call::<Value>("b", vec![]);

    peer.close();
    assert_matches!(first.await, Err(CallError::SessionClosed));
    assert_matches!(second.await, Err(CallError::SessionClosed));
    assert_eq!(session.state(), SessionState::Closed);
    assert_matches!(
        session.call::<Value>("c", vec![]).await,
        Err(CallError::SessionClosed)
    );
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

#[tokio::test]
async fn event_reaches_subscriber_until_unsubscribed() {
    let (session, mut peer) = connected().await;
    let mut subscriber = session.subscribe::<Value>("chat/room1").unwrap();
    assert_eq!(subscriber.topic(), "chat/room1");
    assert_eq!(peer.next_outbound().await.unwrap(), json!([5, "chat/room1"]));

    peer.deliver(json!([8, "chat/room1", {"msg": "hi"}]));
    assert_eq!(subscriber.recv().await.unwrap().unwrap(), json!({"msg": "hi"}));

    assert!(session.unsubscribe("chat/room1").unwrap());
    assert_eq!(peer.next_outbound().await.unwrap(), json!([6, "chat/room1"]));

    peer.deliver(json!([8, "chat/room1", {"msg": "hi"}]));
    sync(&session, &mut peer).await;
    assert!(subscriber.recv().await.is_none());
    assert_eq!(session.stats().unmatched_events, 1);
}

#[tokio::test]
async fn duplicate_subscribe_sends_one_subscribe() {
    let (session, mut peer) = connected().await;
    let mut first = session.subscribe::<Value>("chat/room1").unwrap();
    let mut second = session.subscribe::<Value>("chat/room1").unwrap();

    assert_eq!(peer.drain(), vec![json!([5, "chat/room1"])]);
    assert_eq!(session.subscriptions(), vec!["chat/room1".to_owned()]);

    peer.deliver(json!([8, "chat/room1", 1]));
    assert_eq!(first.recv().await.unwrap().unwrap(), json!(1));
    assert_eq!(second.recv().await.unwrap().unwrap(), json!(1));
}

#[tokio::test]
async fn unsubscribe_without_subscription_is_noop() {
    let (session, mut peer) = connected().await;
    assert!(!session.unsubscribe("chat/nobody").unwrap());
    assert_eq!(peer.try_next_outbound(), None);
}

#[tokio::test]
async fn subscribe_then_unsubscribe_leaves_no_subscriptions() {
    let (session, _peer) = connected().await;
    let _subscriber = session.subscribe::<Value>("test").unwrap();
    assert_eq!(session.subscriptions(), vec!["test".to_owned()]);
    assert!(session.unsubscribe("test").unwrap());
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn dropping_last_subscriber_unsubscribes() {
    let (session, mut peer) = connected().await;
    let first = session.subscribe::<Value>("chat/room1").unwrap();
    let second = session.subscribe::<Value>("chat/room1").unwrap();
    let _ = peer.drain();

    drop(first);
    assert_eq!(peer.try_next_outbound(), None);
    assert_eq!(session.subscriptions(), vec!["chat/room1".to_owned()]);

    drop(second);
    assert_eq!(peer.try_next_outbound(), Some(json!([6, "chat/room1"])));
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn subscriber_dropped_after_unsubscribe_sends_nothing() {
    let (session, mut peer) = connected().await;
    let subscriber = session.subscribe::<Value>("t").unwrap();
    assert!(session.unsubscribe("t").unwrap());
    let _ = peer.drain();

    let _again = session.subscribe::<Value>("t").unwrap();
    assert_eq!(peer.drain(), vec![json!([5, "t"])]);

    drop(subscriber);
    assert_eq!(peer.try_next_outbound(), None);
    assert_eq!(session.subscriptions(), vec!["t".to_owned()]);
}

#[tokio::test]
async fn typed_subscriber_reports_undecodable_events() {
    let (session, peer) = connected().await;
    let mut subscriber = session.subscribe::<u32>("counter").unwrap();

    peer.deliver(json!([8, "counter", 7]));
    peer.deliver(json!([8, "counter", "eight"]));
    assert_eq!(subscriber.recv().await.unwrap().unwrap(), 7);
    assert!(subscriber.recv().await.unwrap().is_err());
}

#[tokio::test]
async fn close_ends_subscriptions() {
    let (session, peer) = connected().await;
    let mut subscriber = session.subscribe::<Value>("t").unwrap();
    peer.close();
    assert!(subscriber.recv().await.is_none());
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn publish_uses_publish_tag() {
    let (session, mut peer) = connected().await;
    session.publish("chat/room1", json!({"msg": "hi"})).unwrap();
    assert_eq!(
        peer.next_outbound().await.unwrap(),
        json!([7, "chat/room1", {"msg": "hi"}])
    );
}

// ─── Prefixes ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn prefix_is_announced_before_the_call_that_uses_it() {
    let (session, mut peer) = connected().await;
    session.define_prefix("m", "math/").unwrap();
    let _short = session.call::<Value>("m:add", vec![json!(2), json!(3)]);
    let _full = session.call::<Value>("math/add", vec![json!(2), json!(3)]);

    let outbound = peer.drain();
    assert_eq!(outbound[0], json!([1, "m", "math/"]));
    let _ = call_id_of(&outbound[1], "m:add", &[json!(2), json!(3)]);
    let _ = call_id_of(&outbound[2], "m:add", &[json!(2), json!(3)]);
}

#[tokio::test]
async fn prefixed_topics_travel_shrunk_and_events_expand() {
    let (session, mut peer) = connected().await;
    session.define_prefix("c", "chat/").unwrap();
    let mut subscriber = session.subscribe::<Value>("chat/room1").unwrap();
    session.publish("chat/room1", json!("hello")).unwrap();

    assert_eq!(
        peer.drain(),
        vec![
            json!([1, "c", "chat/"]),
            json!([5, "c:room1"]),
            json!([7, "c:room1", "hello"]),
        ]
    );

    peer.deliver(json!([8, "c:room1", "from server"]));
    assert_eq!(subscriber.recv().await.unwrap().unwrap(), json!("from server"));

    assert!(session.unsubscribe("chat/room1").unwrap());
    assert_eq!(peer.drain(), vec![json!([6, "chat/room1"])]);
}

#[tokio::test]
async fn prefixed_subscription_receives_events_in_either_form() {
    let (session, mut peer) = connected().await;
    session.define_prefix("c", "chat/").unwrap();
    let mut subscriber = session.subscribe::<Value>("c:room1").unwrap();
    assert_eq!(subscriber.topic(), "chat/room1");
    assert_eq!(session.subscriptions(), vec!["chat/room1".to_owned()]);
    assert_eq!(
        peer.drain(),
        vec![json!([1, "c", "chat/"]), json!([5, "c:room1"])]
    );

    peer.deliver(json!([8, "chat/room1", 1]));
    peer.deliver(json!([8, "c:room1", 2]));
    assert_eq!(subscriber.recv().await.unwrap().unwrap(), json!(1));
    assert_eq!(subscriber.recv().await.unwrap().unwrap(), json!(2));

    let _full = session.subscribe::<Value>("chat/room1").unwrap();
    assert!(peer.drain().is_empty());

    assert!(session.unsubscribe("c:room1").unwrap());
    assert_eq!(peer.drain(), vec![json!([6, "chat/room1"])]);
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn invalid_prefixes_are_refused_without_announcement() {
    let (session, mut peer) = connected().await;
    assert_matches!(
        session.define_prefix("", "math/"),
        Err(PrefixError::Invalid(prefix)) if prefix.is_empty()
    );
    assert_matches!(
        session.define_prefix("a:b", "math/"),
        Err(PrefixError::Invalid(prefix)) if prefix == "a:b"
    );
    assert!(session.prefixes().is_empty());
    assert!(peer.drain().is_empty());
}

#[tokio::test]
async fn redefining_a_prefix_reannounces() {
    let (session, mut peer) = connected().await;
    session.define_prefix("m", "math/").unwrap();
    session.define_prefix("m", "math/").unwrap();
    session.define_prefix("m", "maths/").unwrap();

    assert_eq!(
        peer.drain(),
        vec![
            json!([1, "m", "math/"]),
            json!([1, "m", "math/"]),
            json!([1, "m", "maths/"]),
        ]
    );
    let prefixes = session.prefixes();
    assert_eq!(prefixes.shrink("maths/add"), "m:add");
    assert_eq!(prefixes.shrink("math/add"), "math/add");
    assert_eq!(session.resolve_uri("m:add"), "maths/add");
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_message_type_is_dropped_and_reported() {
    let (logs, _guard) = capture_logs();
    let (session, mut peer) = connected().await;
    let mut diagnostics = session.diagnostics();

    peer.deliver(json!([99, "whatever"]));
    sync(&session, &mut peer).await;

    assert_matches!(
        diagnostics.try_recv(),
        Ok(Diagnostic::UnknownType { tag: 99, raw }) if raw == json!([99, "whatever"])
    );
    assert!(logs.has_event(Level::WARN, "unknown type"));
    assert_eq!(session.stats().messages_dropped, 1);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn malformed_messages_are_dropped_and_reported() {
    let (session, mut peer) = connected().await;
    let mut diagnostics = session.diagnostics();

    peer.deliver(json!("not an array"));
    peer.deliver(json!([]));
    peer.deliver(json!([3]));
    peer.deliver(json!([2, "id", "math/add"]));
    sync(&session, &mut peer).await;

    let mut malformed = 0;
    let mut unhandled = 0;
    while let Ok(diagnostic) = diagnostics.try_recv() {
        match diagnostic {
            Diagnostic::Malformed { .. } => malformed += 1,
            Diagnostic::Unhandled { .. } => unhandled += 1,
            other => panic!("unexpected diagnostic {other:?}"),
        }
    }
    assert_eq!(malformed, 3);
    assert_eq!(unhandled, 1);
    assert_eq!(session.stats().messages_dropped, 4);
}

#[tokio::test]
async fn transport_errors_are_reported_without_closing() {
    let (session, mut peer) = connected().await;
    let mut diagnostics = session.diagnostics();

    peer.fail("frame too large");
    sync(&session, &mut peer).await;

    assert_matches!(
        diagnostics.try_recv(),
        Ok(Diagnostic::Transport { reason }) if reason == "frame too large"
    );
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn stats_count_traffic() {
    let (session, mut peer) = connected().await;
    sync(&session, &mut peer).await;
    let stats = session.stats();
    // WELCOME + CALLRESULT in, CALL out.
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.messages_dropped, 0);
}
