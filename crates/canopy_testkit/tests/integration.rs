//! End-to-end tests: clients and the reference server over the loopback
//! transport.

use canopy_core::{CoreError, MemoryPersistence};
use canopy_sync_engine::{
    ConnectionState, Disconnect, EventType, ListenOptions, Location, Mutation, QueryOps,
    ServerValue, SyncError, SyncResult, TransactionDecision,
};
use canopy_sync_protocol::ClientMessage;
use canopy_sync_server::{Rules, ServerConfig};
use canopy_testkit::prelude::*;
use serde_json::{json, Value as Json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as f64
}

#[tokio::test]
async fn pushed_children_arrive_in_order() {
    let harness = TestHarness::new();
    let client = harness.client();
    let messages = client.reference("messages").unwrap();
    let log = EventLog::new();
    messages.on(log.options(EventType::ChildAdded)).unwrap();

    let first = messages.push(Some(json!("hello"))).unwrap().await.unwrap();
    let second = messages.push(Some(json!("again"))).unwrap().await.unwrap();
    settle(&client);

    assert!(first.key() < second.key());
    let added = log.take();
    assert_eq!(added.len(), 2);
    assert_eq!(added[0].key.as_deref(), first.key());
    assert_eq!(added[0].prev_key, None);
    assert_eq!(added[1].key.as_deref(), second.key());
    assert_eq!(added[1].prev_key.as_deref(), first.key());

    let stored = harness.server.value("/messages").unwrap();
    assert_eq!(stored.as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn other_clients_see_writes() {
    let harness = TestHarness::new();
    let alice = harness.client();
    let bob = harness.client();

    let log = EventLog::new();
    bob.reference("rooms/lobby")
        .unwrap()
        .on(log.options(EventType::Value))
        .unwrap();
    settle(&bob);
    assert_eq!(log.take_values(), vec![Json::Null]);

    alice
        .reference("rooms/lobby/topic")
        .unwrap()
        .set(json!("rust"))
        .unwrap()
        .await
        .unwrap();
    settle(&bob);
    assert_eq!(log.take_values(), vec![json!({"topic": "rust"})]);
}

#[tokio::test]
async fn disconnect_actions_run_when_the_session_drops() {
    let harness = TestHarness::new();
    let alice = harness.client();
    let bob = harness.client();
    let presence = alice.reference("presence/alice").unwrap();

    let alice_log = EventLog::new();
    presence.on(alice_log.options(EventType::Value)).unwrap();
    let bob_log = EventLog::new();
    bob.reference("presence/alice")
        .unwrap()
        .on(bob_log.options(EventType::Value))
        .unwrap();

    presence.set(json!(true)).unwrap().await.unwrap();
    presence.on_disconnect().remove().unwrap().await.unwrap();
    settle(&bob);
    assert_eq!(bob_log.take_values().last(), Some(&json!(true)));

    alice.transport.set_reachable(false);
    alice.lose_connection();
    assert_eq!(alice.connection_state(), ConnectionState::Offline);
    assert_eq!(harness.server.value("/presence/alice").unwrap(), Json::Null);
    settle(&bob);
    assert_eq!(bob_log.take_values(), vec![Json::Null]);

    alice.transport.set_reachable(true);
    alice.go_online().unwrap();
    settle(&alice);
    assert_eq!(alice.connection_state(), ConnectionState::Online);
    assert_eq!(alice_log.take_values().last(), Some(&Json::Null));
}

#[tokio::test]
async fn cancelled_disconnect_actions_do_not_run() {
    let harness = TestHarness::new();
    let client = harness.client();
    let status = client.reference("status").unwrap();
    status.set(json!("online")).unwrap().await.unwrap();
    status
        .on_disconnect()
        .set(json!("offline"))
        .unwrap()
        .await
        .unwrap();
    status.on_disconnect().cancel().unwrap().await.unwrap();

    client.transport.set_reachable(false);
    client.lose_connection();
    assert_eq!(harness.server.value("/status").unwrap(), json!("online"));
}

#[tokio::test]
async fn cancelling_reports_to_the_queued_action() {
    let harness = TestHarness::new();
    let client = harness.offline_client();
    let status = client.reference("status").unwrap();
    let queued = status.on_disconnect().set(json!("offline")).unwrap();
    status.on_disconnect().cancel().unwrap().await.unwrap();

    let err = queued.await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled { path } if path == "/status"));

    client.go_online().unwrap();
    client.transport.set_reachable(false);
    client.lose_connection();
    assert_eq!(harness.server.value("/status").unwrap(), Json::Null);
}

#[tokio::test]
async fn once_sees_values_written_after_our_own() {
    let harness = TestHarness::new();
    let alice = harness.client();
    let bob = harness.client();
    let x = alice.reference("x").unwrap();
    x.set(json!(1)).unwrap().await.unwrap();
    bob.reference("x").unwrap().set(json!(2)).unwrap().await.unwrap();
    settle(&alice);

    let seen = x.once(EventType::Value).unwrap().await.unwrap();
    assert_eq!(seen.snapshot.val(), json!(2));

    bob.reference("x").unwrap().set(json!(3)).unwrap().await.unwrap();
    settle(&alice);
    let seen = x.once(EventType::Value).unwrap().await.unwrap();
    assert_eq!(seen.snapshot.val(), json!(3));
    let session = alice.transport.session().unwrap();
    assert_eq!(harness.server.listen_count(session), 0);
}

#[tokio::test]
async fn offline_writes_reach_the_server_in_order() {
    let harness = TestHarness::new();
    let client = harness.offline_client();
    let list = client.reference("list").unwrap();

    let first = list.child("a").unwrap().set(json!(1)).unwrap();
    let second = list.update(json!({"b": 2})).unwrap();
    let third = list.child("a").unwrap().remove().unwrap();
    assert_eq!(client.outstanding_writes(), 3);
    assert!(client.transport.sent().is_empty());

    client.go_online().unwrap();
    first.await.unwrap();
    second.await.unwrap();
    third.await.unwrap();

    let writes: Vec<(String, bool)> = client
        .transport
        .sent()
        .into_iter()
        .filter_map(|message| match message {
            ClientMessage::Put { path, .. } => Some((path, false)),
            ClientMessage::Merge { path, .. } => Some((path, true)),
            _ => None,
        })
        .collect();
    assert_eq!(
        writes,
        vec![
            ("/list/a".to_string(), false),
            ("/list".to_string(), true),
            ("/list/a".to_string(), false),
        ]
    );
    assert_eq!(harness.server.value("/list").unwrap(), json!({"b": 2}));
    assert_eq!(client.outstanding_writes(), 0);
}

#[tokio::test]
async fn competing_transactions_both_commit() {
    let harness = TestHarness::new();
    let alice = harness.client();
    let bob = harness.client();
    let ignore = EventLog::new();
    for client in [&alice, &bob] {
        client
            .reference("counter")
            .unwrap()
            .on(ignore.options(EventType::Value))
            .unwrap();
    }
    alice
        .reference("counter")
        .unwrap()
        .set(json!(0))
        .unwrap()
        .await
        .unwrap();
    settle(&alice);
    settle(&bob);

    let calls = Arc::new(AtomicUsize::new(0));
    let increment = |calls: Arc<AtomicUsize>| {
        move |current: Json| {
            calls.fetch_add(1, Ordering::SeqCst);
            TransactionDecision::Commit(json!(current.as_i64().unwrap_or(0) + 1))
        }
    };
    let (left, right) = tokio::join!(
        alice
            .reference("counter")
            .unwrap()
            .transaction(increment(Arc::clone(&calls)), true),
        bob.reference("counter")
            .unwrap()
            .transaction(increment(Arc::clone(&calls)), true),
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert!(left.committed && right.committed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let mut finals = vec![left.snapshot.val(), right.snapshot.val()];
    finals.sort_by_key(|v| v.as_i64());
    assert_eq!(finals, vec![json!(1), json!(2)]);
    assert_eq!(harness.server.value("/counter").unwrap(), json!(2));

    settle(&alice);
    let seen = alice
        .reference("counter")
        .unwrap()
        .once(EventType::Value)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(seen.snapshot.val(), json!(2));
}

#[tokio::test]
async fn aborted_transaction_leaves_value_alone() {
    let harness = TestHarness::new();
    let client = harness.client();
    let slot = client.reference("slot").unwrap();
    slot.set(json!("taken")).unwrap().await.unwrap();

    let result = slot
        .transaction(
            |current: Json| {
                if current.is_null() {
                    TransactionDecision::Commit(json!("mine"))
                } else {
                    TransactionDecision::Abort
                }
            },
            true,
        )
        .await
        .unwrap();
    assert!(!result.committed);
    assert_eq!(result.snapshot.val(), json!("taken"));
    assert_eq!(harness.server.value("/slot").unwrap(), json!("taken"));
}

#[test]
fn reattached_listener_gets_one_value_event() {
    let harness = TestHarness::new();
    let client = harness.client();
    let score = client.reference("score").unwrap();
    let _ = score.set(json!(7)).unwrap();

    let log = EventLog::new();
    score.on(log.options(EventType::Value)).unwrap();
    settle(&client);
    assert_eq!(log.take_values(), vec![json!(7)]);

    score.off(None, None).unwrap();
    score.on(log.options(EventType::Value)).unwrap();
    settle(&client);
    assert_eq!(log.take_values(), vec![json!(7)]);

    score.off(None, None).unwrap();
    let _ = score.set(json!(8)).unwrap();
    settle(&client);
    assert!(log.is_empty());
}

#[tokio::test]
async fn denied_write_is_reverted() {
    let harness = TestHarness::with_config(
        ServerConfig::new().with_rules(Rules::open().deny_write("locked")),
    );
    let client = harness.client();
    let target = client.reference("locked/door").unwrap();
    let log = EventLog::new();
    target.on(log.options(EventType::Value)).unwrap();
    settle(&client);
    assert_eq!(log.take_values(), vec![Json::Null]);

    let err = target.set(json!(5)).unwrap().await.unwrap_err();
    assert!(err.is_permission_denied());
    assert_eq!(log.take_values(), vec![json!(5), Json::Null]);
    assert_eq!(harness.server.value("/locked/door").unwrap(), Json::Null);
}

#[test]
fn revoked_listen_is_cancelled() {
    let harness = TestHarness::new();
    let client = harness.client();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let log = EventLog::new();
    let options = log
        .options(EventType::Value)
        .with_cancel(move |error: &CoreError| {
            flag.store(
                matches!(error, CoreError::StaleListenerCancelled { .. }),
                Ordering::SeqCst,
            );
        });
    client.reference("secret").unwrap().on(options).unwrap();
    settle(&client);
    assert_eq!(log.take_values(), vec![Json::Null]);
    let session = client.transport.session().unwrap();
    assert_eq!(harness.server.listen_count(session), 1);

    harness
        .server
        .set_rules(Rules::open().deny_read("secret"));
    settle(&client);
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(harness.server.listen_count(session), 0);

    harness.server.set_value("/secret", json!("hidden")).unwrap();
    settle(&client);
    assert!(log.is_empty());
}

#[test]
fn refused_listen_cancels_the_listener() {
    let harness = TestHarness::with_config(
        ServerConfig::new().with_rules(Rules::open().deny_read("private")),
    );
    let client = harness.client();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&cancelled);
    let options = ListenOptions::new(EventType::Value, |_| {}).with_cancel(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    client.reference("private/notes").unwrap().on(options).unwrap();
    settle(&client);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[test]
fn revoked_credentials_are_refreshed() {
    let harness = TestHarness::with_config(ServerConfig::new().with_auth(b"secret".to_vec()));
    let server = Arc::clone(&harness.server);
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let provider = move |force_refresh: bool| -> SyncResult<Option<String>> {
        if force_refresh {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        server
            .issue_token([7; 16])
            .map(Some)
            .map_err(|e| SyncError::ServerError(e.to_string()))
    };
    let client = harness.client_with(|builder| builder.token_provider(Arc::new(provider)));
    assert_eq!(client.connection_state(), ConnectionState::Online);
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);

    harness.server.revoke_auth("keys rotated");
    settle(&client);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection_state(), ConnectionState::Online);
    assert_eq!(harness.server.session_count(), 1);
}

#[test]
fn anonymous_client_is_refused_by_authenticated_server() {
    let harness = TestHarness::with_config(ServerConfig::new().with_auth(b"secret".to_vec()));
    let client = harness.client();
    assert_eq!(client.connection_state(), ConnectionState::Offline);
    assert_eq!(harness.server.session_count(), 0);
}

#[tokio::test]
async fn persisted_writes_are_sent_after_restart() {
    let harness = TestHarness::new();
    let store = MemoryPersistence::new();

    let first = harness.client_with(|builder| {
        builder
            .persistence(Box::new(store.clone()))
            .start_offline()
    });
    let _ = first
        .reference("drafts/intro")
        .unwrap()
        .set(json!("hello"))
        .unwrap();
    assert_eq!(first.outstanding_writes(), 1);
    drop(first);

    let second = harness.client_with(|builder| builder.persistence(Box::new(store.clone())));
    settle(&second);
    assert_eq!(second.outstanding_writes(), 0);
    assert_eq!(
        harness.server.value("/drafts/intro").unwrap(),
        json!("hello")
    );
}

#[tokio::test]
async fn server_timestamps_resolve_on_the_server() {
    let harness = TestHarness::new();
    let client = harness.client();
    let stamp = client.reference("stamp").unwrap();
    let log = EventLog::new();
    stamp.on(log.options(EventType::Value)).unwrap();

    let before = now_millis();
    stamp.set(ServerValue::timestamp()).unwrap().await.unwrap();
    settle(&client);

    let stored = harness.server.value("/stamp").unwrap();
    let millis = stored.as_f64().unwrap();
    assert!((millis - before).abs() < 60_000.0);
    assert_eq!(log.take_values().last(), Some(&stored));
}

#[test]
fn limited_query_follows_server_changes() {
    let harness = TestHarness::new();
    harness
        .server
        .set_value("/scores", json!({"ada": 1, "bob": 5, "cy": 3}))
        .unwrap();
    let watcher = harness.client();
    let writer = harness.client();

    let log = EventLog::new();
    watcher
        .reference("scores")
        .unwrap()
        .order_by_value()
        .unwrap()
        .limit_to_first(2)
        .unwrap()
        .on(log.options(EventType::Value))
        .unwrap();
    settle(&watcher);
    assert_eq!(log.take_values(), vec![json!({"ada": 1, "cy": 3})]);

    let _ = writer
        .reference("scores/dee")
        .unwrap()
        .set(json!(0))
        .unwrap();
    settle(&writer);
    settle(&watcher);
    assert_eq!(log.take_values(), vec![json!({"ada": 1, "dee": 0})]);
}

#[test]
fn off_by_type_detaches_every_filtered_view() {
    let harness = TestHarness::new();
    harness
        .server
        .set_value("/scores", json!({"ada": 1, "bob": 5, "cy": 3}))
        .unwrap();
    let watcher = harness.client();
    let writer = harness.client();
    let scores = watcher.reference("scores").unwrap();

    let top = EventLog::new();
    let by_key = EventLog::new();
    let added = EventLog::new();
    scores
        .order_by_value()
        .unwrap()
        .limit_to_first(2)
        .unwrap()
        .on(top.options(EventType::Value))
        .unwrap();
    scores
        .order_by_key()
        .unwrap()
        .on(by_key.options(EventType::Value))
        .unwrap();
    scores.on(added.options(EventType::ChildAdded)).unwrap();
    settle(&watcher);
    assert_eq!(top.take_values(), vec![json!({"ada": 1, "cy": 3})]);
    assert_eq!(by_key.take_values().len(), 1);
    assert_eq!(added.take().len(), 3);
    let session = watcher.transport.session().unwrap();
    assert_eq!(harness.server.listen_count(session), 3);

    scores.off(Some(EventType::Value), None).unwrap();
    assert_eq!(harness.server.listen_count(session), 1);

    let _ = writer
        .reference("scores/dee")
        .unwrap()
        .set(json!(0))
        .unwrap();
    settle(&writer);
    settle(&watcher);
    assert!(top.is_empty());
    assert!(by_key.is_empty());
    let added = added.take();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].key.as_deref(), Some("dee"));
}

#[test]
fn references_resolve_from_urls() {
    let harness = TestHarness::new();
    let client = harness.client();
    let reference = client
        .reference_from_url(&format!("{TEST_URL}/users/ada?ns=demo"))
        .unwrap();
    assert_eq!(reference.path().to_string(), "/users/ada");
    assert!(client
        .reference_from_url("https://elsewhere.test/users")
        .unwrap_err()
        .is_invalid_argument());
}

#[tokio::test]
async fn deleted_database_fails_pending_writes() {
    let harness = TestHarness::new();
    let client = harness.offline_client();
    let pending = client.reference("x").unwrap().set(json!(1)).unwrap();
    client.delete();
    assert!(matches!(pending.await, Err(SyncError::DatabaseDeleted)));
    assert!(matches!(
        client.reference("x").unwrap().set(json!(2)),
        Err(SyncError::DatabaseDeleted)
    ));
}
