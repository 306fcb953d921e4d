//! Shared stream-claim repository.
//!
//! A claim states which instance currently owns a session's live
//! stream. Exactly one instance may hold a claim at a time; a claim
//! whose heartbeat stops refreshing lapses on its own.

use std::sync::Arc;
use std::time::Duration;

use crate::models::claim::StreamClaim;
use crate::Result;

use super::db::Database;
use super::{expiry_rfc3339, now_rfc3339, parse_rfc3339};

/// Repository for stream claims in the shared store.
#[derive(Clone)]
pub struct StreamClaimRepo {
    db: Arc<Database>,
    ttl: Duration,
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    session_id: String,
    instance_id: String,
    heartbeat_at: String,
    expires_at: String,
}

impl ClaimRow {
    fn into_claim(self) -> Result<StreamClaim> {
        Ok(StreamClaim {
            session_id: self.session_id,
            instance_id: self.instance_id,
            heartbeat_at: parse_rfc3339(&self.heartbeat_at)?,
            expires_at: parse_rfc3339(&self.expires_at)?,
        })
    }
}

impl StreamClaimRepo {
    /// Create a repository with the given claim TTL.
    #[must_use]
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Write (or take over) the claim for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn claim(&self, session_id: &str, instance_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO stream_claim
               (session_id, instance_id, heartbeat_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(instance_id)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Remove the claim, but only when `instance_id` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn release(&self, session_id: &str, instance_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM stream_claim WHERE session_id = ?1 AND instance_id = ?2")
            .bind(session_id)
            .bind(instance_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Refresh the heartbeat on an owned claim.
    ///
    /// Returns `false` when the claim no longer exists or belongs to a
    /// different instance, so the caller knows ownership was lost.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn refresh(&self, session_id: &str, instance_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE stream_claim SET heartbeat_at = ?3, expires_at = ?4
             WHERE session_id = ?1 AND instance_id = ?2",
        )
        .bind(session_id)
        .bind(instance_id)
        .bind(now_rfc3339())
        .bind(expiry_rfc3339(self.ttl))
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Fetch the live claim for a session, `None` when missing or lapsed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<StreamClaim>> {
        let row: Option<ClaimRow> = sqlx::query_as(
            "SELECT session_id, instance_id, heartbeat_at, expires_at
             FROM stream_claim WHERE session_id = ?1 AND expires_at > ?2",
        )
        .bind(session_id)
        .bind(now_rfc3339())
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(ClaimRow::into_claim).transpose()
    }

    /// Session ids with a live claim held by `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn live_sessions_for(&self, instance_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT session_id FROM stream_claim
             WHERE instance_id = ?1 AND expires_at > ?2",
        )
        .bind(instance_id)
        .bind(now_rfc3339())
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids)
    }
}
