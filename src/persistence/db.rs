//! Shared `SQLite` store connection and schema bootstrap.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::DatastoreConfig;
use crate::{AppError, Result};

use super::schema;

/// Alias for the shared store pool.
pub type Database = SqlitePool;

/// Connect to the shared store file and apply the schema.
///
/// `idle_timeout` bounds how long an unused pooled connection is kept
/// before the pool evicts it; `None` disables eviction.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect(config: &DatastoreConfig, idle_timeout: Option<Duration>) -> Result<Database> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
        .map_err(|err| AppError::Db(format!("invalid datastore path: {err}")))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .idle_timeout(idle_timeout)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Connect to an in-memory store for tests.
///
/// The pool is pinned to a single connection so all queries see the
/// same in-memory database.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect_memory() -> Result<Database> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|err| AppError::Db(format!("invalid memory options: {err}")))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
