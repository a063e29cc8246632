//! Integration tests for `ConnectionManager`.
//!
//! Drives the manager against the scriptable `MockConnector` from
//! `tests/common` and inspects what it does to each link: subscriptions,
//! publishes, replay after a drop, and the reconnection schedule (under
//! tokio's paused clock).

mod common;

use std::time::Duration;

use bbtronic_realtime::{
    ConnectionManager, ConnectionState, EnvironmentSignal, ManagerConfig, RealtimeError,
    TopicMessage,
};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use common::{settle, CountingHook, MockConnector, Open, Recorder};

const ENDPOINT: &str = "ws://mock/websocket/websocket";

fn manager_with(connector: &MockConnector) -> ConnectionManager {
    ConnectionManager::new(ManagerConfig::new(ENDPOINT), connector.clone())
}

async fn connected_manager() -> (ConnectionManager, MockConnector) {
    let connector = MockConnector::new();
    let manager = manager_with(&connector);
    assert_ok!(manager.connect().await);
    (manager, connector)
}

fn frame(event: &str) -> String {
    format!(r#"{{"event":"{event}"}}"#)
}

// ════════════════════════════════════════════════════════════════════
// connect
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_is_idempotent_while_connected() {
    let (manager, connector) = connected_manager().await;
    let first = manager.connect().await.unwrap();
    let second = manager.connect().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let connector = MockConnector::new();
    let manager = manager_with(&connector);
    connector.hold();

    let m1 = manager.clone();
    let first = tokio::spawn(async move { m1.connect().await });
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let m2 = manager.clone();
    let second = tokio::spawn(async move { m2.connect().await });
    settle().await;

    connector.release();
    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    assert_eq!(a, b);
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn waiting_connect_times_out() {
    let connector = MockConnector::new();
    let manager = manager_with(&connector);
    connector.hold();

    let m1 = manager.clone();
    let first = tokio::spawn(async move { m1.connect().await });
    settle().await;

    let waited = manager.connect().await;
    assert!(matches!(waited, Err(RealtimeError::ConnectTimeout)));

    connector.release();
    assert_ok!(first.await.unwrap());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn failed_attempt_rejects_every_waiter() {
    let connector = MockConnector::scripted(vec![Open::Fail("refused".into())]);
    let manager = manager_with(&connector);
    connector.hold();

    let m1 = manager.clone();
    let first = tokio::spawn(async move { m1.connect().await });
    settle().await;
    let m2 = manager.clone();
    let second = tokio::spawn(async move { m2.connect().await });
    settle().await;

    connector.release();
    let a = first.await.unwrap();
    let b = second.await.unwrap();

    assert!(matches!(a, Err(RealtimeError::ConnectFailed(ref r)) if r.contains("refused")));
    assert!(matches!(b, Err(RealtimeError::ConnectFailed(ref r)) if r.contains("refused")));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn connect_failure_schedules_reconnection() {
    let connector = MockConnector::scripted(vec![Open::Fail("refused".into())]);
    let manager = manager_with(&connector);

    let err = assert_err!(manager.connect().await);
    assert!(matches!(err, RealtimeError::ConnectFailed(_)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.reconnect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn successful_connect_resets_attempt_counter() {
    let connector = MockConnector::scripted(vec![Open::Fail("refused".into())]);
    let manager = manager_with(&connector);

    assert_err!(manager.connect().await);
    assert_eq!(manager.reconnect_attempts(), 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle().await;

    assert_eq!(connector.opens(), 2);
    assert!(manager.is_connected());
    assert_eq!(manager.reconnect_attempts(), 0);
}

// ════════════════════════════════════════════════════════════════════
// subscribe / send / unsubscribe
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn operations_fail_fast_while_disconnected() {
    let connector = MockConnector::new();
    let manager = manager_with(&connector);
    let recorder = Recorder::new();

    let sub = manager.subscribe("ABC123", recorder.handler("a"));
    assert!(matches!(sub, Err(RealtimeError::NotConnected)));
    let sent = manager.send("ABC123", "userUpdate", Value::Null);
    assert!(matches!(sent, Err(RealtimeError::NotConnected)));

    assert_eq!(connector.opens(), 0);
    assert!(manager.durable_topics().is_empty());
    assert!(manager.active_topics().is_empty());
}

#[tokio::test]
async fn subscribe_routes_parsed_messages_in_order() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("ABC123", recorder.handler("lobby")).unwrap();

    let link = connector.last_link();
    assert_eq!(link.live_paths(), vec!["/topic/ABC123".to_string()]);

    link.deliver("/topic/ABC123", r#"{"event":"userUpdate","userId":7}"#);
    link.deliver("/topic/ABC123", &frame("gameStarted"));

    assert_eq!(
        recorder.events(),
        vec![
            ("lobby".to_string(), "userUpdate".to_string()),
            ("lobby".to_string(), "gameStarted".to_string()),
        ]
    );
    let first = &recorder.messages()[0];
    assert_eq!(first.get("userId"), Some(&json!(7)));
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("ABC123", recorder.handler("lobby")).unwrap();

    let link = connector.last_link();
    link.deliver("/topic/ABC123", "not json at all");
    link.deliver("/topic/ABC123", r#"{"userId":7}"#);
    link.deliver("/topic/ABC123", r#"{"event":42,"userId":7}"#);
    link.deliver("/topic/ABC123", &frame("userLeft"));

    assert_eq!(
        recorder.events(),
        vec![("lobby".to_string(), "userLeft".to_string())]
    );
}

#[tokio::test]
async fn resubscribing_replaces_the_previous_handler() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("ABC123", recorder.handler("old")).unwrap();
    manager.subscribe("ABC123", recorder.handler("mid")).unwrap();
    manager.subscribe("ABC123", recorder.handler("new")).unwrap();

    let link = connector.last_link();
    assert_eq!(link.live_paths(), vec!["/topic/ABC123".to_string()]);
    assert_eq!(link.cancelled().len(), 2);

    link.deliver("/topic/ABC123", &frame("userUpdate"));
    assert_eq!(
        recorder.events(),
        vec![("new".to_string(), "userUpdate".to_string())]
    );
    assert_eq!(manager.active_topics(), vec!["ABC123".to_string()]);
    assert_eq!(manager.durable_topics(), vec!["ABC123".to_string()]);
}

#[tokio::test]
async fn send_publishes_event_with_payload_fields() {
    let (manager, connector) = connected_manager().await;
    manager
        .send("ABC123", "userUpdate", json!({ "userId": 7, "score": 12 }))
        .unwrap();
    manager.send("ABC123", "gameStarted", Value::Null).unwrap();

    let published = connector.last_link().published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].0, "/topic/ABC123");

    let body: Value = serde_json::from_str(&published[0].1).unwrap();
    assert_eq!(body, json!({ "event": "userUpdate", "userId": 7, "score": 12 }));
    let body: Value = serde_json::from_str(&published[1].1).unwrap();
    assert_eq!(body, json!({ "event": "gameStarted" }));
}

#[tokio::test]
async fn send_rejects_non_object_payloads() {
    let (manager, connector) = connected_manager().await;

    for payload in [json!(3), json!("text"), json!([1, 2])] {
        let result = manager.send("ABC123", "userUpdate", payload);
        assert!(matches!(result, Err(RealtimeError::InvalidPayload)));
    }
    assert!(connector.last_link().published().is_empty());
}

#[tokio::test]
async fn send_message_publishes_prebuilt_message() {
    let (manager, connector) = connected_manager().await;
    let message = TopicMessage::new("userLeft").with_field("userId", 3);
    manager.send_message("ABC123", &message).unwrap();

    let published = connector.last_link().published();
    let parsed = TopicMessage::parse(&published[0].1).unwrap();
    assert_eq!(parsed, message);
}

#[tokio::test]
async fn send_on_broken_link_fails() {
    let (manager, connector) = connected_manager().await;
    connector.last_link().drop_connection();

    // The close watcher has not run yet, so the manager still believes it is connected.
    let result = manager.send("ABC123", "userUpdate", Value::Null);
    assert!(matches!(result, Err(RealtimeError::SendFailed(_))));
}

#[tokio::test]
async fn unsubscribe_cancels_and_optionally_forgets() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();
    manager.subscribe("BBB", recorder.handler("b")).unwrap();

    manager.unsubscribe("AAA", false);
    manager.unsubscribe("BBB", true);

    let link = connector.last_link();
    assert!(link.live_paths().is_empty());
    assert!(manager.active_topics().is_empty());
    assert_eq!(manager.durable_topics(), vec!["BBB".to_string()]);
}

#[tokio::test]
async fn unsubscribe_unknown_topic_is_a_noop() {
    let (manager, connector) = connected_manager().await;
    manager.unsubscribe("NOPE", false);
    assert!(connector.last_link().cancelled().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// disconnect
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disconnect_tears_everything_down() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();
    manager.subscribe("BBB", recorder.handler("b")).unwrap();

    manager.disconnect().await;
    settle().await;

    let link = connector.last_link();
    assert_eq!(link.close_calls(), 1);
    assert!(link.live_paths().is_empty());
    assert_eq!(link.cancelled().len(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.durable_topics().is_empty());
    assert!(manager.active_topics().is_empty());
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnection() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();

    connector.last_link().drop_connection();
    settle().await;
    assert_eq!(manager.reconnect_attempts(), 1);

    manager.disconnect().await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    settle().await;

    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_abandons_in_flight_attempt() {
    let connector = MockConnector::new();
    let manager = manager_with(&connector);
    connector.hold();

    let m1 = manager.clone();
    let pending = tokio::spawn(async move { m1.connect().await });
    settle().await;

    manager.disconnect().await;
    connector.release();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RealtimeError::ConnectFailed(_))));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.last_link().close_calls(), 1);
}

#[tokio::test]
async fn connect_after_disconnect_opens_a_new_link() {
    let (manager, connector) = connected_manager().await;
    let before = manager.connect().await.unwrap();
    manager.disconnect().await;

    let after = manager.connect().await.unwrap();
    assert_ne!(before, after);
    assert!(before.is_closed());
    assert_eq!(connector.opens(), 2);
}

// ════════════════════════════════════════════════════════════════════
// Automatic reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn link_loss_drops_active_but_keeps_durable() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();

    connector.last_link().drop_connection();
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.active_topics().is_empty());
    assert_eq!(manager.durable_topics(), vec!["AAA".to_string()]);
    assert_eq!(manager.reconnect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_schedule_and_retry_budget() {
    let connector = MockConnector::new();
    connector.set_fallback(Open::Succeed);
    let manager = manager_with(&connector);
    let hook = CountingHook::new();
    manager.set_recovery_hook(hook.clone());
    assert_ok!(manager.connect().await);

    connector.set_fallback(Open::Fail("down".into()));
    connector.last_link().drop_connection();
    settle().await;
    let dropped_at = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_millis(1990)).await;
    settle().await;
    assert_eq!(connector.opens(), 1, "no attempt before the first delay");

    tokio::time::sleep(Duration::from_secs(600)).await;
    settle().await;

    let times = connector.open_times();
    assert_eq!(times.len(), 6, "one initial open plus five retries");
    assert_eq!(manager.reconnect_attempts(), 5);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let mut previous = dropped_at;
    for (n, expected_ms) in [2000u64, 4000, 8000, 16000, 32000].into_iter().enumerate() {
        let gap = times[n + 1] - previous;
        let expected = Duration::from_millis(expected_ms);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(10),
            "attempt {} came after {gap:?}, expected {expected:?}",
            n + 1
        );
        previous = times[n + 1];
    }

    assert_eq!(hook.before_count(), 5);
    assert_eq!(hook.recovered_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn manual_connect_after_exhaustion_resets_counter() {
    let connector = MockConnector::new();
    let manager = ConnectionManager::new(
        ManagerConfig::new(ENDPOINT).with_max_reconnect_attempts(2),
        connector.clone(),
    );
    assert_ok!(manager.connect().await);

    connector.set_fallback(Open::Fail("down".into()));
    connector.last_link().drop_connection();
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(connector.opens(), 3);
    assert_eq!(manager.reconnect_attempts(), 2);

    connector.set_fallback(Open::Succeed);
    assert_ok!(manager.connect().await);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnection_replays_durable_subscriptions_once() {
    let (manager, connector) = connected_manager().await;
    let hook = CountingHook::new();
    manager.set_recovery_hook(hook.clone());

    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();
    manager.subscribe("BBB", recorder.handler("b")).unwrap();
    manager.subscribe("CCC", recorder.handler("c")).unwrap();
    manager.unsubscribe("BBB", true);
    manager.unsubscribe("CCC", false);

    connector.last_link().drop_connection();
    settle().await;
    assert_eq!(hook.before_count(), 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle().await;

    assert_eq!(connector.opens(), 2);
    assert!(manager.is_connected());
    let link = connector.last_link();
    assert_eq!(
        link.live_paths(),
        vec!["/topic/AAA".to_string(), "/topic/BBB".to_string()]
    );
    assert_eq!(link.subscribed().len(), 2);
    assert_eq!(
        manager.active_topics(),
        vec!["AAA".to_string(), "BBB".to_string()]
    );
    assert_eq!(hook.recovered_count(), 1);

    link.deliver("/topic/BBB", &frame("userUpdate"));
    assert_eq!(
        recorder.events(),
        vec![("b".to_string(), "userUpdate".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn manual_connect_before_the_timer_replays_durable_subscriptions() {
    let (manager, connector) = connected_manager().await;
    let hook = CountingHook::new();
    manager.set_recovery_hook(hook.clone());
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();

    connector.last_link().drop_connection();
    settle().await;
    assert_eq!(manager.reconnect_attempts(), 1);

    assert_ok!(manager.connect().await);
    assert_eq!(manager.active_topics(), vec!["AAA".to_string()]);
    assert_eq!(connector.last_link().live_paths(), vec!["/topic/AAA".to_string()]);
    assert_eq!(hook.recovered_count(), 1);

    // The timer armed by the drop finds nothing left to recover.
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(connector.last_link().subscribed().len(), 1);
    assert_eq!(hook.recovered_count(), 1);

    connector.last_link().deliver("/topic/AAA", &frame("userUpdate"));
    assert_eq!(
        recorder.events(),
        vec![("a".to_string(), "userUpdate".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn manual_connect_during_a_held_reconnection_recovers_once() {
    let (manager, connector) = connected_manager().await;
    let hook = CountingHook::new();
    manager.set_recovery_hook(hook.clone());
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();

    connector.last_link().drop_connection();
    settle().await;
    connector.hold();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let m1 = manager.clone();
    let joined = tokio::spawn(async move { m1.connect().await });
    settle().await;
    connector.release();

    assert_ok!(joined.await.unwrap());
    settle().await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(connector.last_link().live_paths(), vec!["/topic/AAA".to_string()]);
    assert_eq!(connector.last_link().subscribed().len(), 1);
    assert_eq!(hook.recovered_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cleared_hook_is_not_invoked() {
    let (manager, connector) = connected_manager().await;
    let hook = CountingHook::new();
    manager.set_recovery_hook(hook.clone());
    manager.clear_recovery_hook();

    connector.last_link().drop_connection();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle().await;

    assert!(manager.is_connected());
    assert_eq!(hook.before_count(), 0);
    assert_eq!(hook.recovered_count(), 0);
}

// ════════════════════════════════════════════════════════════════════
// Environment signals
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn visibility_recovers_immediately() {
    let (manager, connector) = connected_manager().await;
    let hook = CountingHook::new();
    manager.set_recovery_hook(hook.clone());
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();

    connector.last_link().drop_connection();
    settle().await;

    manager.handle_signal(EnvironmentSignal::Visible).await;
    assert_eq!(connector.opens(), 2);
    assert!(manager.is_connected());
    assert_eq!(connector.last_link().live_paths(), vec!["/topic/AAA".to_string()]);
    assert_eq!(hook.recovered_count(), 1);

    // The reconnect timer armed by the drop finds the channel connected.
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(hook.recovered_count(), 1);
}

#[tokio::test]
async fn signals_are_ignored_when_nothing_to_recover() {
    let (manager, connector) = connected_manager().await;
    manager.handle_signal(EnvironmentSignal::Focused).await;
    assert_eq!(connector.opens(), 1);

    let idle_connector = MockConnector::new();
    let idle = manager_with(&idle_connector);
    idle.handle_signal(EnvironmentSignal::Visible).await;
    assert_eq!(idle_connector.opens(), 0);
}

#[tokio::test]
async fn recovery_joins_an_in_flight_attempt() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();
    connector.last_link().drop_connection();
    settle().await;

    connector.hold();
    let m1 = manager.clone();
    let first = tokio::spawn(async move { m1.connect().await });
    settle().await;

    let m2 = manager.clone();
    let signal = tokio::spawn(async move { m2.handle_signal(EnvironmentSignal::Focused).await });
    settle().await;
    connector.release();

    assert_ok!(first.await.unwrap());
    signal.await.unwrap();
    assert_eq!(connector.opens(), 2);
    assert_eq!(connector.last_link().live_paths(), vec!["/topic/AAA".to_string()]);
}

#[tokio::test]
async fn listener_forwards_signals() {
    let (manager, connector) = connected_manager().await;
    let recorder = Recorder::new();
    manager.subscribe("AAA", recorder.handler("a")).unwrap();
    connector.last_link().drop_connection();
    settle().await;

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let listener = manager.listen_for_signals(rx);
    tx.send(EnvironmentSignal::Visible).await.unwrap();
    settle().await;

    assert!(manager.is_connected());
    assert_eq!(connector.opens(), 2);

    drop(tx);
    listener.await.unwrap();
}

// ════════════════════════════════════════════════════════════════════
// Misc
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn debug_impl_for_manager() {
    let (manager, _connector) = connected_manager().await;
    let out = format!("{manager:?}");
    assert!(out.contains("ConnectionManager"));
    assert!(out.contains("Connected"));
    assert!(out.contains(ENDPOINT));
}

#[tokio::test]
async fn dropping_the_manager_closes_the_watch_on_the_link() {
    let (manager, connector) = connected_manager().await;
    let probe = connector.last_link();
    drop(manager);
    settle().await;

    // Nothing left to react; a later drop must not trigger any reconnection.
    probe.drop_connection();
    settle().await;
    assert_eq!(connector.opens(), 1);
}
