//! In-flight request bookkeeping.
//!
//! [`RequestStore`] tracks client-initiated requests so an
//! out-of-band `notifications/cancelled` arriving at *any* instance
//! can flag work running on another. [`ServerRequestStore`] mirrors it
//! for server-initiated requests (liveness pings and the like) whose
//! replies may never come; staleness is detected by a caller-driven
//! sweep over `expired_requests`, never by the store itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::models::request::{PendingRequest, PendingServerRequest, ServerRequestKind};
use crate::Result;

use super::db::Database;
use super::{expiry_rfc3339, now_rfc3339, parse_rfc3339};

/// Store for client-initiated in-flight requests and their
/// cancellation flags.
#[derive(Clone)]
pub struct RequestStore {
    db: Arc<Database>,
    instance_id: String,
    ttl: Duration,
}

#[derive(sqlx::FromRow)]
struct ActiveRequestRow {
    id: String,
    session_id: Option<String>,
    instance_id: String,
    created_at: String,
}

impl ActiveRequestRow {
    fn into_request(self) -> Result<PendingRequest> {
        Ok(PendingRequest {
            id: self.id,
            session_id: self.session_id,
            instance_id: self.instance_id,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

impl RequestStore {
    /// Create a store bound to this instance.
    #[must_use]
    pub fn new(db: Arc<Database>, instance_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            db,
            instance_id: instance_id.into(),
            ttl,
        }
    }

    /// Register a request as in-flight. Without a session id no
    /// cross-session linkage is created.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn register_request(&self, id: &str, session_id: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO active_request
               (id, session_id, instance_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(session_id)
        .bind(&self.instance_id)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch an in-flight request record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_request(&self, id: &str) -> Result<Option<PendingRequest>> {
        let row: Option<ActiveRequestRow> = sqlx::query_as(
            "SELECT id, session_id, instance_id, created_at
             FROM active_request WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(ActiveRequestRow::into_request).transpose()
    }

    /// Flag a request as cancelled. Monotonic: once set, it stays set
    /// until the record expires or the request is unregistered.
    ///
    /// Never raises — a failed write is logged and reported as `false`.
    pub async fn mark_cancelled(&self, id: &str, reason: Option<&str>) -> bool {
        let result = sqlx::query(
            "INSERT OR REPLACE INTO cancelled_request (id, reason, expires_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(id)
        .bind(reason)
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await;

        match result {
            Ok(_) => true,
            Err(err) => {
                warn!(request_id = id, %err, "failed to persist cancellation flag");
                false
            }
        }
    }

    /// Whether the request has been flagged cancelled. Pure read.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn cancelled(&self, id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM cancelled_request WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(found.is_some())
    }

    /// The reason recorded with the cancellation, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn cancellation_reason(&self, id: &str) -> Result<Option<String>> {
        let reason: Option<Option<String>> =
            sqlx::query_scalar("SELECT reason FROM cancelled_request WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(reason.flatten())
    }

    /// Remove the request's active record and cancellation flag.
    /// Missing request is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a delete fails.
    pub async fn unregister_request(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM active_request WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        sqlx::query("DELETE FROM cancelled_request WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Remove every request record linked to a session, returning the
    /// ids that were removed. Supports bulk teardown on session end.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn cleanup_session_requests(&self, session_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "DELETE FROM active_request WHERE session_id = ?1 RETURNING id",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        for id in &ids {
            sqlx::query("DELETE FROM cancelled_request WHERE id = ?1")
                .bind(id)
                .execute(self.db.as_ref())
                .await?;
        }
        Ok(ids)
    }
}

/// Store for server-initiated requests awaiting a client reply.
#[derive(Clone)]
pub struct ServerRequestStore {
    db: Arc<Database>,
    ttl: Duration,
}

#[derive(sqlx::FromRow)]
struct ServerRequestRow {
    id: String,
    session_id: String,
    kind: String,
    created_at: String,
}

impl ServerRequestRow {
    fn into_request(self) -> Result<PendingServerRequest> {
        let kind = ServerRequestKind::parse(&self.kind).ok_or_else(|| {
            crate::AppError::Db(format!("invalid server request kind: {}", self.kind))
        })?;
        Ok(PendingServerRequest {
            id: self.id,
            session_id: self.session_id,
            kind,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

impl ServerRequestStore {
    /// Create a store over the shared database.
    #[must_use]
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Register a server-initiated request on send.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn register(
        &self,
        id: &str,
        session_id: &str,
        kind: ServerRequestKind,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO server_request
               (id, session_id, kind, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(session_id)
        .bind(kind.as_str())
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Remove a request once the client acknowledged it. Missing id is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn acknowledge(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM server_request WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Requests older than `timeout` that never got a reply.
    ///
    /// Computed by comparing `created_at` against current time; the
    /// caller decides what to do with them (typically reap the
    /// session's stream).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn expired_requests(&self, timeout: Duration) -> Result<Vec<PendingServerRequest>> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let rows: Vec<ServerRequestRow> = sqlx::query_as(
            "SELECT id, session_id, kind, created_at
             FROM server_request WHERE created_at < ?1
             ORDER BY created_at ASC",
        )
        .bind(&cutoff)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(ServerRequestRow::into_request).collect()
    }

    /// Remove every server request linked to a session, returning the
    /// removed ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "DELETE FROM server_request WHERE session_id = ?1 RETURNING id",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids)
    }
}
