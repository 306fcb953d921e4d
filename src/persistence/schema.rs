//! Shared-store schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every instance startup. Produces a convergent result
//! regardless of how many instances race the bootstrap.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected store.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id              TEXT PRIMARY KEY NOT NULL,
    server_instance TEXT NOT NULL,
    context         TEXT NOT NULL DEFAULT '{}',
    active_stream   INTEGER NOT NULL DEFAULT 0,
    stream_server   TEXT,
    created_at      TEXT NOT NULL,
    last_activity   TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    prompts         TEXT NOT NULL DEFAULT '[]',
    resources       TEXT NOT NULL DEFAULT '[]',
    tools           TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS session_message (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_message_session
    ON session_message(session_id, seq);

CREATE TABLE IF NOT EXISTS instance_notification (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id     TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instance_notification_instance
    ON instance_notification(instance_id, seq);

CREATE TABLE IF NOT EXISTS event_counter (
    instance_id     TEXT PRIMARY KEY NOT NULL,
    value           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_claim (
    session_id      TEXT PRIMARY KEY NOT NULL,
    instance_id     TEXT NOT NULL,
    heartbeat_at    TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_lock (
    session_id      TEXT PRIMARY KEY NOT NULL,
    holder          TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS active_request (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT,
    instance_id     TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_active_request_session
    ON active_request(session_id);

CREATE TABLE IF NOT EXISTS cancelled_request (
    id              TEXT PRIMARY KEY NOT NULL,
    reason          TEXT,
    expires_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS server_request (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    kind            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_server_request_session
    ON server_request(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
