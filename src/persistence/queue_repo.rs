//! Durable FIFO message queues.
//!
//! [`SessionMessageQueue`] is keyed by session and feeds the delivery
//! poller; [`NotificationQueue`] is keyed by server instance. Both are
//! append-only, bounded (oldest dropped on overflow), and drained with
//! an atomic pop-all so two concurrent pollers can never observe the
//! same message.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppError, Result};

use super::db::Database;
use super::{expiry_rfc3339, now_rfc3339};

/// How long an acquired compound-operation lock stays valid if the
/// holder never releases it (crash protection).
const LOCK_TTL: Duration = Duration::from_secs(10);

/// Retry cadence while waiting to acquire a lock.
const LOCK_RETRY: Duration = Duration::from_millis(10);

fn serialize_payload(msg: &Value) -> String {
    match msg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a stored payload; malformed JSON comes back as an opaque
/// string instead of an error.
fn deserialize_payload(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

async fn push_rows(
    db: &Database,
    table: &str,
    key_col: &str,
    key: &str,
    msgs: &[Value],
    max_len: u32,
) -> Result<()> {
    if msgs.is_empty() {
        return Ok(());
    }
    let now = now_rfc3339();
    let mut tx = db.begin().await?;
    for msg in msgs {
        sqlx::query(&format!(
            "INSERT INTO {table} ({key_col}, payload, created_at) VALUES (?1, ?2, ?3)"
        ))
        .bind(key)
        .bind(serialize_payload(msg))
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }
    // Trim once per push: keep the newest `max_len`, drop the rest.
    sqlx::query(&format!(
        "DELETE FROM {table}
         WHERE {key_col} = ?1 AND seq NOT IN (
             SELECT seq FROM {table} WHERE {key_col} = ?1
             ORDER BY seq DESC LIMIT ?2
         )"
    ))
    .bind(key)
    .bind(i64::from(max_len))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn pop_all_rows(db: &Database, table: &str, key_col: &str, key: &str) -> Result<Vec<Value>> {
    // Single-statement read-and-clear: atomic against concurrent
    // producers and competing pollers.
    let mut rows: Vec<(i64, String)> = sqlx::query_as(&format!(
        "DELETE FROM {table} WHERE {key_col} = ?1 RETURNING seq, payload"
    ))
    .bind(key)
    .fetch_all(db)
    .await?;
    rows.sort_by_key(|(seq, _)| *seq);
    Ok(rows
        .into_iter()
        .map(|(_, payload)| deserialize_payload(payload))
        .collect())
}

async fn count_rows(db: &Database, table: &str, key_col: &str, key: &str) -> Result<u64> {
    let count: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE {key_col} = ?1"))
            .bind(key)
            .fetch_one(db)
            .await?;
    u64::try_from(count).map_err(|err| AppError::Db(err.to_string()))
}

/// Per-session FIFO queue of serialized JSON-RPC messages.
#[derive(Clone)]
pub struct SessionMessageQueue {
    db: Arc<Database>,
    max_len: u32,
}

impl SessionMessageQueue {
    /// Create a queue with the given bound.
    #[must_use]
    pub fn new(db: Arc<Database>, max_len: u32) -> Self {
        Self { db, max_len }
    }

    /// Append one message, trimming to the bound.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn push(&self, session_id: &str, msg: &Value) -> Result<()> {
        push_rows(
            &self.db,
            "session_message",
            "session_id",
            session_id,
            std::slice::from_ref(msg),
            self.max_len,
        )
        .await
    }

    /// Append several messages in order, trimming once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn push_bulk(&self, session_id: &str, msgs: &[Value]) -> Result<()> {
        push_rows(
            &self.db,
            "session_message",
            "session_id",
            session_id,
            msgs,
            self.max_len,
        )
        .await
    }

    /// Atomically remove and return all queued messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the drain fails.
    pub async fn pop_all(&self, session_id: &str) -> Result<Vec<Value>> {
        pop_all_rows(&self.db, "session_message", "session_id", session_id).await
    }

    /// Best-effort presence check; transient store errors read as `false`.
    pub async fn has_messages(&self, session_id: &str) -> bool {
        self.size(session_id).await > 0
    }

    /// Best-effort queue depth; transient store errors read as `0`.
    pub async fn size(&self, session_id: &str) -> u64 {
        match count_rows(&self.db, "session_message", "session_id", session_id).await {
            Ok(count) => count,
            Err(err) => {
                debug!(session_id, %err, "queue size check failed, defaulting to 0");
                0
            }
        }
    }

    /// Run `f` while holding the session's compound-operation lock.
    ///
    /// The lock is a set-if-absent row with a short TTL, so it
    /// survives process boundaries and cannot outlive a crashed
    /// holder. It is always released before this returns, whether `f`
    /// succeeded or failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` if the lock cannot be acquired
    /// within `timeout`, `AppError::Db` for store failures, or
    /// whatever error `f` produced.
    pub async fn with_lock<F, Fut, T>(&self, session_id: &str, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let holder = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Clear a lapsed lock before attempting set-if-absent.
            sqlx::query("DELETE FROM session_lock WHERE session_id = ?1 AND expires_at < ?2")
                .bind(session_id)
                .bind(now_rfc3339())
                .execute(self.db.as_ref())
                .await?;

            let acquired = sqlx::query(
                "INSERT OR IGNORE INTO session_lock (session_id, holder, expires_at)
                 VALUES (?1, ?2, ?3)",
            )
            .bind(session_id)
            .bind(&holder)
            .bind(expiry_rfc3339(LOCK_TTL))
            .execute(self.db.as_ref())
            .await?
            .rows_affected();

            if acquired == 1 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::LockTimeout(format!(
                    "session lock for {session_id} not acquired within {timeout:?}"
                )));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }

        let result = f().await;

        // Release unconditionally; a failed delete only means the TTL
        // will clear it.
        if let Err(err) = sqlx::query(
            "DELETE FROM session_lock WHERE session_id = ?1 AND holder = ?2",
        )
        .bind(session_id)
        .bind(&holder)
        .execute(self.db.as_ref())
        .await
        {
            warn!(session_id, %err, "failed to release session lock, TTL will clear it");
        }

        result
    }
}

/// Per-instance FIFO queue for fleet-internal notifications.
#[derive(Clone)]
pub struct NotificationQueue {
    db: Arc<Database>,
    max_len: u32,
}

impl NotificationQueue {
    /// Create a queue with the given bound.
    #[must_use]
    pub fn new(db: Arc<Database>, max_len: u32) -> Self {
        Self { db, max_len }
    }

    /// Append one notification for `instance_id`, trimming to the bound.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn push(&self, instance_id: &str, msg: &Value) -> Result<()> {
        push_rows(
            &self.db,
            "instance_notification",
            "instance_id",
            instance_id,
            std::slice::from_ref(msg),
            self.max_len,
        )
        .await
    }

    /// Append several notifications in order, trimming once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn push_bulk(&self, instance_id: &str, msgs: &[Value]) -> Result<()> {
        push_rows(
            &self.db,
            "instance_notification",
            "instance_id",
            instance_id,
            msgs,
            self.max_len,
        )
        .await
    }

    /// Atomically remove and return all queued notifications, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the drain fails.
    pub async fn pop_all(&self, instance_id: &str) -> Result<Vec<Value>> {
        pop_all_rows(&self.db, "instance_notification", "instance_id", instance_id).await
    }

    /// Best-effort queue depth; transient store errors read as `0`.
    pub async fn size(&self, instance_id: &str) -> u64 {
        match count_rows(&self.db, "instance_notification", "instance_id", instance_id).await {
            Ok(count) => count,
            Err(err) => {
                debug!(instance_id, %err, "notification size check failed, defaulting to 0");
                0
            }
        }
    }
}
