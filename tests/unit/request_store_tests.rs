//! Unit tests for in-flight request bookkeeping, client and server side.

use std::sync::Arc;
use std::time::Duration;

use mcp_relay::models::request::ServerRequestKind;
use mcp_relay::persistence::db;
use mcp_relay::persistence::request_store::{RequestStore, ServerRequestStore};

async fn client_store() -> RequestStore {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    RequestStore::new(db, "srv-a", Duration::from_secs(60))
}

async fn server_store() -> ServerRequestStore {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    ServerRequestStore::new(db, Duration::from_secs(60))
}

// ─── Client request registration ─────────────────────────────────────

#[tokio::test]
async fn register_and_fetch_request() {
    let store = client_store().await;
    store
        .register_request("req-1", Some("sess-1"))
        .await
        .expect("register");

    let request = store
        .get_request("req-1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(request.id, "req-1");
    assert_eq!(request.session_id, Some("sess-1".to_owned()));
    assert_eq!(request.instance_id, "srv-a");
}

#[tokio::test]
async fn register_without_session_has_no_linkage() {
    let store = client_store().await;
    store.register_request("req-1", None).await.expect("register");

    let request = store
        .get_request("req-1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(request.session_id, None);
}

#[tokio::test]
async fn unregister_removes_record_and_flag() {
    let store = client_store().await;
    store
        .register_request("req-1", Some("sess-1"))
        .await
        .expect("register");
    assert!(store.mark_cancelled("req-1", None).await);

    store.unregister_request("req-1").await.expect("unregister");

    assert!(store.get_request("req-1").await.expect("get").is_none());
    assert!(!store.cancelled("req-1").await.expect("cancelled"));
}

#[tokio::test]
async fn unregister_missing_request_is_a_no_op() {
    let store = client_store().await;
    store.unregister_request("ghost").await.expect("unregister");
}

// ─── Cancellation flags ──────────────────────────────────────────────

#[tokio::test]
async fn cancellation_flag_is_monotonic_and_carries_reason() {
    let store = client_store().await;
    store
        .register_request("req-1", Some("sess-1"))
        .await
        .expect("register");

    assert!(!store.cancelled("req-1").await.expect("cancelled"));
    assert!(store.mark_cancelled("req-1", Some("user closed tab")).await);
    assert!(store.cancelled("req-1").await.expect("cancelled"));
    assert_eq!(
        store.cancellation_reason("req-1").await.expect("reason"),
        Some("user closed tab".to_owned())
    );

    // A second flagging keeps the request cancelled.
    assert!(store.mark_cancelled("req-1", None).await);
    assert!(store.cancelled("req-1").await.expect("cancelled"));
}

#[tokio::test]
async fn flag_can_precede_registration() {
    // A cancellation landing on instance B before instance A registers
    // the request must still be visible afterwards.
    let store = client_store().await;
    assert!(store.mark_cancelled("req-early", Some("raced")).await);

    store
        .register_request("req-early", Some("sess-1"))
        .await
        .expect("register");
    assert!(store.cancelled("req-early").await.expect("cancelled"));
}

#[tokio::test]
async fn reason_absent_when_none_given() {
    let store = client_store().await;
    store.mark_cancelled("req-1", None).await;
    assert_eq!(
        store.cancellation_reason("req-1").await.expect("reason"),
        None
    );
}

// ─── Session-scoped cleanup ──────────────────────────────────────────

#[tokio::test]
async fn cleanup_session_requests_returns_removed_ids() {
    let store = client_store().await;
    store
        .register_request("req-1", Some("sess-1"))
        .await
        .expect("register");
    store
        .register_request("req-2", Some("sess-1"))
        .await
        .expect("register");
    store
        .register_request("req-3", Some("sess-2"))
        .await
        .expect("register");
    store.mark_cancelled("req-1", None).await;

    let mut removed = store
        .cleanup_session_requests("sess-1")
        .await
        .expect("cleanup");
    removed.sort();
    assert_eq!(removed, vec!["req-1".to_owned(), "req-2".to_owned()]);

    assert!(store.get_request("req-1").await.expect("get").is_none());
    assert!(!store.cancelled("req-1").await.expect("flag cleared"));
    assert!(store.get_request("req-3").await.expect("get").is_some());
}

// ─── Server-initiated requests ───────────────────────────────────────

#[tokio::test]
async fn server_request_register_and_acknowledge() {
    let store = server_store().await;
    store
        .register("ping-1", "sess-1", ServerRequestKind::Ping)
        .await
        .expect("register");

    store.acknowledge("ping-1").await.expect("ack");
    let expired = store
        .expired_requests(Duration::ZERO)
        .await
        .expect("expired");
    assert!(expired.is_empty(), "acknowledged request must be gone");
}

#[tokio::test]
async fn unanswered_requests_surface_after_timeout() {
    let store = server_store().await;
    store
        .register("ping-1", "sess-1", ServerRequestKind::Ping)
        .await
        .expect("register");
    store
        .register("elicit-1", "sess-2", ServerRequestKind::Elicit)
        .await
        .expect("register");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let expired = store
        .expired_requests(Duration::from_millis(10))
        .await
        .expect("expired");
    assert_eq!(expired.len(), 2);
    let kinds: Vec<ServerRequestKind> = expired.iter().map(|r| r.kind).collect();
    assert!(kinds.contains(&ServerRequestKind::Ping));
    assert!(kinds.contains(&ServerRequestKind::Elicit));

    // A generous timeout sees nothing.
    let fresh = store
        .expired_requests(Duration::from_secs(30))
        .await
        .expect("expired");
    assert!(fresh.is_empty());
}

#[tokio::test]
async fn server_cleanup_scoped_to_session() {
    let store = server_store().await;
    store
        .register("ping-1", "sess-1", ServerRequestKind::Ping)
        .await
        .expect("register");
    store
        .register("roots-1", "sess-2", ServerRequestKind::ListRoots)
        .await
        .expect("register");

    let removed = store.cleanup_session("sess-1").await.expect("cleanup");
    assert_eq!(removed, vec!["ping-1".to_owned()]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let remaining = store
        .expired_requests(Duration::from_millis(1))
        .await
        .expect("expired");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, "sess-2");
}
