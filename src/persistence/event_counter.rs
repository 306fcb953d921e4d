//! Per-instance monotonic stream event counter.

use std::sync::Arc;

use crate::Result;

use super::db::Database;

/// Produces globally-unique, per-instance-ordered SSE event ids of the
/// form `{instance}-{n}`.
///
/// The increment is a single upsert-returning statement, so arbitrary
/// concurrent callers across threads and processes never observe a
/// duplicate or out-of-order value for the same instance. An existing
/// stored counter is continued, never reset.
#[derive(Clone)]
pub struct EventCounter {
    db: Arc<Database>,
}

impl EventCounter {
    /// Create a counter over the shared store.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Next event id for `instance`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the increment fails.
    pub async fn next_id(&self, instance: &str) -> Result<String> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO event_counter (instance_id, value) VALUES (?1, 1)
             ON CONFLICT(instance_id) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .bind(instance)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(format!("{instance}-{value}"))
    }

    /// Current counter value without incrementing; `0` when unseeded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn current(&self, instance: &str) -> Result<i64> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM event_counter WHERE instance_id = ?1")
                .bind(instance)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(value.unwrap_or(0))
    }
}
