//! Integration tests for `GET /` streams and `DELETE /` teardown.

use futures_util::StreamExt;
use mcp_relay::transport::poller::MessagePoller;
use mcp_relay::transport::sse;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

use super::test_helpers::{initialize_session, memory_state, post_rpc, spawn_server};

// ─── DELETE ──────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_without_header_is_idempotent_success() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .delete(format!("{base_url}/"))
        .send()
        .await
        .expect("DELETE /");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("body");
    assert_eq!(body["success"], true);

    ct.cancel();
}

#[tokio::test]
async fn delete_unknown_session_is_idempotent_success() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .delete(format!("{base_url}/"))
        .header("Mcp-Session-Id", "never-existed")
        .send()
        .await
        .expect("DELETE /");
    assert_eq!(response.status(), 200);

    ct.cancel();
}

#[tokio::test]
async fn delete_tears_down_session_and_bookkeeping() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &base_url).await;

    state
        .requests
        .register_request("req-1", Some(&session_id))
        .await
        .expect("register");
    state
        .sessions
        .queue_message(&session_id, &json!({"pending": true}))
        .await
        .expect("queue");

    let response = client
        .delete(format!("{base_url}/"))
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .expect("DELETE /");
    assert_eq!(response.status(), 200);

    assert!(!state.sessions.exists(&session_id).await.expect("exists"));
    assert!(state
        .requests
        .get_request("req-1")
        .await
        .expect("get")
        .is_none());
    assert_eq!(state.sessions.queue().size(&session_id).await, 0);

    // A request on the deleted session is rejected like any unknown id.
    let rejected = post_rpc(
        &client,
        &base_url,
        Some(&session_id),
        &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
    )
    .await;
    assert_eq!(rejected.status(), 400);

    ct.cancel();
}

#[tokio::test]
async fn repeated_delete_stays_successful() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state).await;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &base_url).await;

    for _ in 0..3 {
        let response = client
            .delete(format!("{base_url}/"))
            .header("Mcp-Session-Id", &session_id)
            .send()
            .await
            .expect("DELETE /");
        assert_eq!(response.status(), 200);
    }

    ct.cancel();
}

// ─── GET / stream ────────────────────────────────────────────────────

#[tokio::test]
async fn get_without_session_header_rejected() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state).await;

    let response = reqwest::get(format!("{base_url}/")).await.expect("GET /");
    assert_eq!(response.status(), 400);

    ct.cancel();
}

#[tokio::test]
async fn get_with_unknown_session_rejected() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base_url}/"))
        .header("Mcp-Session-Id", "ghost")
        .send()
        .await
        .expect("GET /");
    assert_eq!(response.status(), 400);

    ct.cancel();
}

#[tokio::test]
async fn open_stream_marks_session_active() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &base_url).await;

    let response = client
        .get(format!("{base_url}/"))
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .expect("GET /");
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .expect("content-type")
        .to_str()
        .expect("utf8")
        .to_owned();
    assert!(content_type.starts_with("text/event-stream"));

    // The shared store reflects the open stream and its owner.
    let mut active = false;
    for _ in 0..50 {
        active = state
            .sessions
            .has_active_stream(&session_id)
            .await
            .expect("active");
        if active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(active);
    assert_eq!(
        state
            .sessions
            .owning_instance(&session_id)
            .await
            .expect("owner"),
        Some("srv-a".to_owned())
    );
    assert!(state.registry.has_local(&session_id).await);

    drop(response);
    ct.cancel();
}

#[tokio::test]
async fn queued_message_is_delivered_over_the_stream() {
    let state = memory_state("srv-a").await;
    let (base_url, ct) = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &base_url).await;

    let poller = MessagePoller::new(
        state.config.poller,
        Arc::clone(&state.registry),
        state.sessions.clone(),
        state.server_requests.clone(),
        state.counter.clone(),
    );
    poller.start();

    let response = client
        .get(format!("{base_url}/"))
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .expect("GET /");
    assert_eq!(response.status(), 200);

    // Wait until the stream is registered, then queue a notification.
    for _ in 0..50 {
        if state.registry.has_local(&session_id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    state
        .sink
        .send_notification("notifications/message", json!({"level": "info"}), Some(&session_id))
        .await
        .expect("queue notification");

    // Read SSE frames until the event arrives.
    let mut body = String::new();
    let mut stream = response.bytes_stream();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let chunk = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        if let Ok(Some(Ok(bytes))) = chunk {
            body.push_str(&String::from_utf8_lossy(&bytes));
            if body.contains("notifications/message") {
                break;
            }
        }
    }

    assert!(
        body.contains("id: srv-a-1"),
        "expected instance-scoped event id, got: {body}"
    );
    assert!(body.contains("notifications/message"));

    poller.stop().await;
    ct.cancel();
}

// ─── Reconnect teardown ──────────────────────────────────────────────

#[tokio::test]
async fn stale_stream_drop_leaves_replacement_intact() {
    let state = memory_state("srv-a").await;
    state
        .sessions
        .create("sess-1", Map::new())
        .await
        .expect("create");

    let keep_alive = Duration::from_secs(1);
    let first = sse::open_stream(
        Arc::clone(&state.registry),
        state.sessions.clone(),
        "sess-1".to_owned(),
        keep_alive,
    )
    .await
    .expect("first stream");
    // The client reconnects before the old body is dropped; the new
    // stream replaces the registration.
    let second = sse::open_stream(
        Arc::clone(&state.registry),
        state.sessions.clone(),
        "sess-1".to_owned(),
        keep_alive,
    )
    .await
    .expect("second stream");

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        state.registry.has_local("sess-1").await,
        "replacement handle must survive the stale teardown"
    );
    assert!(state
        .sessions
        .has_active_stream("sess-1")
        .await
        .expect("active"));
    assert_eq!(
        state
            .sessions
            .owning_instance("sess-1")
            .await
            .expect("owner"),
        Some("srv-a".to_owned())
    );

    // Dropping the live stream performs the real teardown.
    drop(second);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!state.registry.has_local("sess-1").await);
    assert!(!state
        .sessions
        .has_active_stream("sess-1")
        .await
        .expect("active"));
}
