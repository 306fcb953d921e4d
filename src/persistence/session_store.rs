//! Session lifecycle repository.
//!
//! Every mutation is a single-record write that also refreshes the
//! session TTL, so any activity extends the session's life. The store
//! never errors for "session not found" — those cases degrade to
//! `false` / `None` / empty results. Only datastore failures surface
//! as `AppError::Db`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::models::session::{HandlerSnapshot, Session};
use crate::{AppError, Result};

use super::db::Database;
use super::queue_repo::SessionMessageQueue;
use super::{expiry_rfc3339, now_rfc3339, parse_rfc3339};

/// Repository for session records in the shared store.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Database>,
    instance_id: String,
    ttl: Duration,
    queue: SessionMessageQueue,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    server_instance: String,
    context: String,
    active_stream: i64,
    stream_server: Option<String>,
    created_at: String,
    last_activity: String,
    expires_at: String,
    prompts: String,
    resources: String,
    tools: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let context = serde_json::from_str(&self.context)
            .map_err(|err| AppError::Db(format!("invalid session context: {err}")))?;
        Ok(Session {
            id: self.id,
            server_instance: self.server_instance,
            context,
            active_stream: self.active_stream != 0,
            stream_server: self.stream_server,
            created_at: parse_rfc3339(&self.created_at)?,
            last_activity: parse_rfc3339(&self.last_activity)?,
            expires_at: parse_rfc3339(&self.expires_at)?,
            handlers: HandlerSnapshot {
                prompts: parse_names(&self.prompts),
                resources: parse_names(&self.resources),
                tools: parse_names(&self.tools),
            },
        })
    }
}

fn parse_names(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

impl SessionStore {
    /// Create a new store bound to this instance.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        instance_id: impl Into<String>,
        ttl: Duration,
        queue: SessionMessageQueue,
    ) -> Self {
        Self {
            db,
            instance_id: instance_id.into(),
            ttl,
            queue,
        }
    }

    /// The per-session message queue backing this store.
    #[must_use]
    pub fn queue(&self) -> &SessionMessageQueue {
        &self.queue
    }

    /// Create a session record.
    ///
    /// An empty id degrades to a no-op write and the empty id is
    /// returned unchanged. An id that already exists is left as-is.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(
        &self,
        id: &str,
        context: serde_json::Map<String, Value>,
    ) -> Result<String> {
        if id.is_empty() {
            return Ok(String::new());
        }
        let now = now_rfc3339();
        let context = serde_json::to_string(&context)
            .map_err(|err| AppError::Db(format!("unserializable context: {err}")))?;

        sqlx::query(
            "INSERT OR IGNORE INTO session
               (id, server_instance, context, active_stream, stream_server,
                created_at, last_activity, expires_at)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?4, ?5)",
        )
        .bind(id)
        .bind(&self.instance_id)
        .bind(&context)
        .bind(&now)
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;

        Ok(id.to_owned())
    }

    /// Whether a live (unexpired) session exists for `id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM session WHERE id = ?1 AND expires_at > ?2")
                .bind(id)
                .bind(now_rfc3339())
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(found.is_some())
    }

    /// Fetch the full session record, `None` when missing or expired.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, server_instance, context, active_stream, stream_server,
                    created_at, last_activity, expires_at, prompts, resources, tools
             FROM session WHERE id = ?1 AND expires_at > ?2",
        )
        .bind(id)
        .bind(now_rfc3339())
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Record that `instance` now holds the session's live stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_stream_active(&self, id: &str, instance: &str) -> Result<()> {
        sqlx::query(
            "UPDATE session
             SET active_stream = 1, stream_server = ?2,
                 last_activity = ?3, expires_at = ?4
             WHERE id = ?1",
        )
        .bind(id)
        .bind(instance)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Record that the session no longer has a live stream anywhere.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_stream_inactive(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE session
             SET active_stream = 0, stream_server = NULL,
                 last_activity = ?2, expires_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Whether the session currently has a live stream somewhere in
    /// the fleet. Missing session reads as `false`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn has_active_stream(&self, id: &str) -> Result<bool> {
        let active: Option<i64> = sqlx::query_scalar(
            "SELECT active_stream FROM session WHERE id = ?1 AND expires_at > ?2",
        )
        .bind(id)
        .bind(now_rfc3339())
        .fetch_optional(self.db.as_ref())
        .await?;
        Ok(active == Some(1))
    }

    /// Instance currently owning the session's stream, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn owning_instance(&self, id: &str) -> Result<Option<String>> {
        let server: Option<Option<String>> = sqlx::query_scalar(
            "SELECT stream_server FROM session WHERE id = ?1 AND expires_at > ?2",
        )
        .bind(id)
        .bind(now_rfc3339())
        .fetch_optional(self.db.as_ref())
        .await?;
        Ok(server.flatten())
    }

    /// The session's opaque context bag; empty when the session is missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn context(&self, id: &str) -> Result<serde_json::Map<String, Value>> {
        Ok(self
            .get(id)
            .await?
            .map(|session| session.context)
            .unwrap_or_default())
    }

    /// Remove the session record, its queued messages, and its lock.
    /// Missing session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any delete fails.
    pub async fn cleanup(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        sqlx::query("DELETE FROM session_message WHERE session_id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        sqlx::query("DELETE FROM session_lock WHERE session_id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        sqlx::query("DELETE FROM stream_claim WHERE session_id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Queue a message for delivery through the session's stream.
    ///
    /// Returns `false` without writing when the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only for datastore failures.
    pub async fn queue_message(&self, id: &str, msg: &Value) -> Result<bool> {
        if !self.exists(id).await? {
            return Ok(false);
        }
        self.queue.push(id, msg).await?;
        self.touch(id).await?;
        Ok(true)
    }

    /// Atomically drain all queued messages for the session, oldest
    /// first. Missing session yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only for datastore failures.
    pub async fn drain_messages(&self, id: &str) -> Result<Vec<Value>> {
        if !self.exists(id).await? {
            return Ok(Vec::new());
        }
        let messages = self.queue.pop_all(id).await?;
        self.touch(id).await?;
        Ok(messages)
    }

    /// Sessions that have at least one queued message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn sessions_with_pending_messages(&self) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT session_id FROM session_message ORDER BY session_id")
                .fetch_all(self.db.as_ref())
                .await?;
        Ok(ids)
    }

    /// Sessions whose stream is currently active anywhere in the fleet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn sessions_with_active_stream(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM session WHERE active_stream = 1 AND expires_at > ?1",
        )
        .bind(now_rfc3339())
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids)
    }

    /// Persist the handler names advertised to this session's client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn store_handler_snapshot(&self, id: &str, snapshot: &HandlerSnapshot) -> Result<()> {
        let prompts = serde_json::to_string(&snapshot.prompts)
            .map_err(|err| AppError::Db(err.to_string()))?;
        let resources = serde_json::to_string(&snapshot.resources)
            .map_err(|err| AppError::Db(err.to_string()))?;
        let tools =
            serde_json::to_string(&snapshot.tools).map_err(|err| AppError::Db(err.to_string()))?;

        sqlx::query(
            "UPDATE session
             SET prompts = ?2, resources = ?3, tools = ?4,
                 last_activity = ?5, expires_at = ?6
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&prompts)
        .bind(&resources)
        .bind(&tools)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// The last-stored handler snapshot, `None` when the session is missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_handler_snapshot(&self, id: &str) -> Result<Option<HandlerSnapshot>> {
        Ok(self.get(id).await?.map(|session| session.handlers))
    }

    /// Refresh the session TTL without any other mutation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE session SET last_activity = ?2, expires_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}
