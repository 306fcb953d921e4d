//! Shared-store persistence layer.
//!
//! The shared store is the sole source of cross-instance truth:
//! session records, durable message queues, stream claims, request
//! bookkeeping, and the per-instance event counter all live here.
//! Repositories wrap a `SqlitePool` and perform every mutation that
//! must be atomic as a single statement or one transaction.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

pub mod claim_repo;
pub mod db;
pub mod event_counter;
pub mod pool;
pub mod queue_repo;
pub mod request_store;
pub mod schema;
pub mod session_store;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Current time as a fixed-precision RFC 3339 string.
///
/// All stored timestamps use microsecond precision so lexicographic
/// comparison in SQL matches chronological order.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Expiry deadline `ttl` from now, as a fixed-precision RFC 3339 string.
#[must_use]
pub fn expiry_rfc3339(ttl: Duration) -> String {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    (Utc::now() + ttl).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_rfc3339(raw: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| crate::AppError::Db(format!("invalid stored timestamp: {err}")))
}
