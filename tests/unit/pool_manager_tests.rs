//! Unit tests for the pool manager: lifecycle, stats, and the reaper.

use std::sync::Arc;

use mcp_relay::config::{DatastoreConfig, ReaperConfig};
use mcp_relay::persistence::pool::{PoolManager, PoolStats};
use mcp_relay::AppError;

fn datastore(path: &str) -> DatastoreConfig {
    DatastoreConfig {
        path: path.to_owned(),
        pool_size: 4,
        acquire_timeout_seconds: 2,
    }
}

fn reaper_disabled() -> ReaperConfig {
    ReaperConfig {
        enabled: false,
        interval_seconds: 60,
        idle_timeout_seconds: 300,
    }
}

fn temp_db() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir
        .path()
        .join("relay.db")
        .to_str()
        .expect("utf8")
        .to_owned();
    (dir, path)
}

// ─── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn start_validates_empty_path() {
    let manager = Arc::new(PoolManager::new(datastore(""), reaper_disabled()));
    let err = manager.start().await.expect_err("empty path");
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn start_validates_zero_pool_size() {
    let (_dir, path) = temp_db();
    let mut config = datastore(&path);
    config.pool_size = 0;
    let manager = Arc::new(PoolManager::new(config, reaper_disabled()));
    let err = manager.start().await.expect_err("zero pool size");
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn pool_unavailable_before_start() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(datastore(&path), reaper_disabled()));
    assert!(manager.pool().is_err());
    assert_eq!(manager.stats(), PoolStats::default());
}

#[tokio::test]
async fn start_is_idempotent() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(datastore(&path), reaper_disabled()));

    manager.start().await.expect("start");
    manager.start().await.expect("second start is a no-op");

    assert!(manager.pool().is_ok());
    manager.shutdown().await;
}

#[tokio::test]
async fn stats_populated_after_start() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(datastore(&path), reaper_disabled()));
    manager.start().await.expect("start");

    let stats = manager.stats();
    assert!(stats.size >= 1, "at least the bootstrap connection");
    assert!(stats.available >= 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_discards_the_pool() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(datastore(&path), reaper_disabled()));
    manager.start().await.expect("start");
    manager.shutdown().await;

    assert!(manager.pool().is_err());
    assert_eq!(manager.stats(), PoolStats::default());
}

// ─── Reaping ─────────────────────────────────────────────────────────

#[tokio::test]
async fn reap_now_removes_expired_rows() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(datastore(&path), reaper_disabled()));
    manager.start().await.expect("start");
    let pool = manager.pool().expect("pool");

    // One expired session with an orphan-to-be message, one live session.
    sqlx::query(
        "INSERT INTO session (id, server_instance, created_at, last_activity, expires_at)
         VALUES ('dead', 'srv-a', '2020-01-01T00:00:00.000000Z',
                 '2020-01-01T00:00:00.000000Z', '2020-01-01T00:00:01.000000Z')",
    )
    .execute(&pool)
    .await
    .expect("insert dead");
    sqlx::query(
        "INSERT INTO session (id, server_instance, created_at, last_activity, expires_at)
         VALUES ('live', 'srv-a', '2020-01-01T00:00:00.000000Z',
                 '2020-01-01T00:00:00.000000Z', '2999-01-01T00:00:00.000000Z')",
    )
    .execute(&pool)
    .await
    .expect("insert live");
    sqlx::query(
        "INSERT INTO session_message (session_id, payload, created_at)
         VALUES ('dead', '{}', '2020-01-01T00:00:00.000000Z')",
    )
    .execute(&pool)
    .await
    .expect("insert message");
    sqlx::query(
        "INSERT INTO stream_claim (session_id, instance_id, heartbeat_at, expires_at)
         VALUES ('dead', 'srv-a', '2020-01-01T00:00:00.000000Z',
                 '2020-01-01T00:00:01.000000Z')",
    )
    .execute(&pool)
    .await
    .expect("insert claim");

    let report = manager.reap_now().await.expect("reap");
    assert_eq!(report.sessions, 1);
    assert_eq!(report.claims, 1);
    assert_eq!(report.orphaned_messages, 1);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM session")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(remaining, 1, "live session must survive");

    manager.shutdown().await;
}

#[tokio::test]
async fn reap_now_requires_started_manager() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(datastore(&path), reaper_disabled()));
    assert!(manager.reap_now().await.is_err());
}

#[tokio::test]
async fn background_reaper_keeps_cycling() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(
        datastore(&path),
        ReaperConfig {
            enabled: true,
            interval_seconds: 1,
            idle_timeout_seconds: 300,
        },
    ));
    manager.start().await.expect("start");

    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    assert!(
        manager.reap_cycles() >= 2,
        "reaper should have completed at least two cycles, saw {}",
        manager.reap_cycles()
    );

    // The pool stays usable under the running reaper.
    let pool = manager.pool().expect("pool");
    let one: i64 = sqlx::query_scalar("SELECT 1")
        .fetch_one(&pool)
        .await
        .expect("query");
    assert_eq!(one, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn reaper_survives_failing_sweeps() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(
        datastore(&path),
        ReaperConfig {
            enabled: true,
            interval_seconds: 1,
            idle_timeout_seconds: 300,
        },
    ));
    manager.start().await.expect("start");
    let pool = manager.pool().expect("pool");

    // Every sweep fails from here on.
    sqlx::query("DROP TABLE session")
        .execute(&pool)
        .await
        .expect("drop");
    assert!(
        manager.reap_now().await.is_err(),
        "sweep must fail without the session table"
    );

    let before = manager.reap_cycles();
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    assert!(
        manager.reap_cycles() >= before + 2,
        "loop must keep cycling through failures, saw {}",
        manager.reap_cycles()
    );

    // The pool itself stays healthy under the failing reaper.
    let one: i64 = sqlx::query_scalar("SELECT 1")
        .fetch_one(&pool)
        .await
        .expect("query");
    assert_eq!(one, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn configure_reaper_stops_disabled_task() {
    let (_dir, path) = temp_db();
    let manager = Arc::new(PoolManager::new(
        datastore(&path),
        ReaperConfig {
            enabled: true,
            interval_seconds: 1,
            idle_timeout_seconds: 300,
        },
    ));
    manager.start().await.expect("start");

    manager.configure_reaper(reaper_disabled());
    let cycles = manager.reap_cycles();
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert_eq!(
        manager.reap_cycles(),
        cycles,
        "disabled reaper must not cycle"
    );

    manager.shutdown().await;
}
