//! Integration tests for fleet behavior: two instances, one shared store.

use std::sync::Arc;
use std::time::Duration;

use mcp_relay::transport::poller::MessagePoller;
use mcp_relay::transport::registry::{StreamEvent, StreamHandle};
use mcp_relay::transport::sse;
use serde_json::{json, Map};
use tokio::sync::mpsc;

use super::test_helpers::{file_state, initialize_session, post_rpc, spawn_server};

fn shared_db() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir
        .path()
        .join("fleet.db")
        .to_str()
        .expect("utf8")
        .to_owned();
    (dir, path)
}

// ─── Shared sessions ─────────────────────────────────────────────────

#[tokio::test]
async fn session_created_on_one_instance_is_visible_on_another() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    a.sessions
        .create("sess-1", Map::new())
        .await
        .expect("create on a");

    assert!(b.sessions.exists("sess-1").await.expect("exists on b"));
}

#[tokio::test]
async fn any_instance_answers_requests_for_a_shared_session() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    let (url_a, ct_a) = spawn_server(a).await;
    let (url_b, ct_b) = spawn_server(b).await;
    let client = reqwest::Client::new();

    // Initialize against A, then talk to B with the same session id.
    let session_id = initialize_session(&client, &url_a).await;
    let response = post_rpc(
        &client,
        &url_b,
        Some(&session_id),
        &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
    )
    .await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("body");
    assert_eq!(body["result"], json!({}));

    ct_a.cancel();
    ct_b.cancel();
}

// ─── Cross-instance message routing ──────────────────────────────────

#[tokio::test]
async fn message_queued_on_one_instance_reaches_stream_on_another() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    // The client's live stream is held by A.
    a.sessions
        .create("sess-1", Map::new())
        .await
        .expect("create");
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(16);
    a.registry
        .register("sess-1", StreamHandle::new(tx))
        .await
        .expect("register");
    a.sessions
        .mark_stream_active("sess-1", "srv-a")
        .await
        .expect("mark active");

    // B handles a request and emits a notification for that session.
    b.sink
        .send_notification("notifications/message", json!({"from": "b"}), Some("sess-1"))
        .await
        .expect("queue on b");

    // A's poller routes it into the stream A holds.
    let poller = MessagePoller::new(
        a.config.poller,
        Arc::clone(&a.registry),
        a.sessions.clone(),
        a.server_requests.clone(),
        a.counter.clone(),
    );
    poller.poll_once().await.expect("poll");

    let event = rx.try_recv().expect("routed event");
    assert_eq!(event.message["method"], "notifications/message");
    assert_eq!(event.message["params"]["from"], "b");
    assert_eq!(event.id, Some("srv-a-1".to_owned()));
}

#[tokio::test]
async fn stream_ownership_is_visible_fleet_wide() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    a.sessions
        .create("sess-1", Map::new())
        .await
        .expect("create");
    let (tx, _rx) = mpsc::channel::<StreamEvent>(16);
    a.registry
        .register("sess-1", StreamHandle::new(tx))
        .await
        .expect("register");
    a.sessions
        .mark_stream_active("sess-1", "srv-a")
        .await
        .expect("mark active");

    assert!(b
        .sessions
        .has_active_stream("sess-1")
        .await
        .expect("active on b"));
    assert_eq!(
        b.sessions
            .owning_instance("sess-1")
            .await
            .expect("owner on b"),
        Some("srv-a".to_owned())
    );
    assert!(!b.registry.has_local("sess-1").await, "handle stays local to a");
}

// ─── Cross-instance cancellation ─────────────────────────────────────

#[tokio::test]
async fn cancellation_posted_to_one_instance_flags_work_on_another() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    let (url_b, ct_b) = spawn_server(b).await;
    let client = reqwest::Client::new();

    // A registered the in-flight request.
    a.sessions
        .create("sess-1", Map::new())
        .await
        .expect("create");
    a.requests
        .register_request("req-9", Some("sess-1"))
        .await
        .expect("register on a");

    // The cancellation lands on B.
    let response = post_rpc(
        &client,
        &url_b,
        Some("sess-1"),
        &json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": { "requestId": "req-9", "reason": "timeout" },
        }),
    )
    .await;
    assert_eq!(response.status(), 202);

    // A observes the flag through the shared store.
    assert!(a.requests.cancelled("req-9").await.expect("cancelled on a"));
    assert_eq!(
        a.requests
            .cancellation_reason("req-9")
            .await
            .expect("reason"),
        Some("timeout".to_owned())
    );

    ct_b.cancel();
}

// ─── Teardown propagation ────────────────────────────────────────────

#[tokio::test]
async fn delete_on_one_instance_removes_session_for_all() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    let (url_a, ct_a) = spawn_server(a.clone()).await;
    let (url_b, ct_b) = spawn_server(b.clone()).await;
    let client = reqwest::Client::new();

    let session_id = initialize_session(&client, &url_a).await;
    assert!(b.sessions.exists(&session_id).await.expect("exists on b"));

    let response = client
        .delete(format!("{url_b}/"))
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .expect("DELETE on b");
    assert_eq!(response.status(), 200);

    assert!(!a.sessions.exists(&session_id).await.expect("exists on a"));

    ct_a.cancel();
    ct_b.cancel();
}

// ─── Event ids across instances ──────────────────────────────────────

#[tokio::test]
async fn event_ids_are_unique_per_instance_in_a_shared_store() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    assert_eq!(a.counter.next_id("srv-a").await.expect("next"), "srv-a-1");
    assert_eq!(b.counter.next_id("srv-b").await.expect("next"), "srv-b-1");
    assert_eq!(b.counter.next_id("srv-a").await.expect("next"), "srv-a-2");
}

// ─── Takeover after reconnect ────────────────────────────────────────

#[tokio::test]
async fn reconnect_to_other_instance_takes_over_the_claim() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    a.sessions
        .create("sess-1", Map::new())
        .await
        .expect("create");
    let (tx_a, _rx_a) = mpsc::channel::<StreamEvent>(16);
    a.registry
        .register("sess-1", StreamHandle::new(tx_a))
        .await
        .expect("register on a");
    a.sessions
        .mark_stream_active("sess-1", "srv-a")
        .await
        .expect("mark active");

    // Client reconnects to B: B claims the stream.
    let (tx_b, mut rx_b) = mpsc::channel::<StreamEvent>(16);
    b.registry
        .register("sess-1", StreamHandle::new(tx_b))
        .await
        .expect("register on b");
    b.sessions
        .mark_stream_active("sess-1", "srv-b")
        .await
        .expect("mark active on b");

    // A's next cycle notices the lost claim and drops its stale handle.
    let poller_a = MessagePoller::new(
        a.config.poller,
        Arc::clone(&a.registry),
        a.sessions.clone(),
        a.server_requests.clone(),
        a.counter.clone(),
    );
    poller_a.poll_once().await.expect("poll a");
    assert!(!a.registry.has_local("sess-1").await);

    // Messages now flow through B.
    b.sessions
        .queue_message("sess-1", &json!({"after": "takeover"}))
        .await
        .expect("queue");
    let poller_b = MessagePoller::new(
        b.config.poller,
        Arc::clone(&b.registry),
        b.sessions.clone(),
        b.server_requests.clone(),
        b.counter.clone(),
    );
    poller_b.poll_once().await.expect("poll b");

    let event = rx_b.try_recv().expect("delivered on b");
    assert_eq!(event.message["after"], "takeover");

    // The stream stays active fleet-wide, owned by B.
    assert!(b
        .sessions
        .has_active_stream("sess-1")
        .await
        .expect("active"));
}

#[tokio::test]
async fn stale_stream_drop_preserves_takeover_state() {
    let (_dir, path) = shared_db();
    let a = file_state(&path, "srv-a").await;
    let b = file_state(&path, "srv-b").await;

    a.sessions
        .create("sess-1", Map::new())
        .await
        .expect("create");

    let keep_alive = Duration::from_secs(1);
    let stream_a = sse::open_stream(
        Arc::clone(&a.registry),
        a.sessions.clone(),
        "sess-1".to_owned(),
        keep_alive,
    )
    .await
    .expect("stream on a");
    // The client reconnects to B; B takes over the claim and flag.
    let _stream_b = sse::open_stream(
        Arc::clone(&b.registry),
        b.sessions.clone(),
        "sess-1".to_owned(),
        keep_alive,
    )
    .await
    .expect("stream on b");

    // A's stale body is torn down afterward; B's state must survive.
    drop(stream_a);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(b.registry.has_local("sess-1").await, "b keeps its handle");
    assert!(b
        .sessions
        .has_active_stream("sess-1")
        .await
        .expect("active"));
    assert_eq!(
        b.sessions
            .owning_instance("sess-1")
            .await
            .expect("owner"),
        Some("srv-b".to_owned())
    );
}
