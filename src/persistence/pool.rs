//! Shared-connection-pool manager with background reaper.
//!
//! Owns the bounded `sqlx` pool every repository borrows. Idle
//! connection eviction is delegated to the pool's own `idle_timeout`;
//! the background reaper sweeps TTL-expired rows (sessions, claims,
//! locks, request bookkeeping) so shared state stays bounded even
//! when no instance performs an explicit teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{DatastoreConfig, ReaperConfig};
use crate::{AppError, Result};

use super::db;
use super::now_rfc3339;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open.
    pub size: u32,
    /// Connections that could be checked out right now without waiting.
    pub available: u32,
    /// Open connections sitting idle in the pool.
    pub idle: u32,
}

/// Row counts removed by one reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Expired session records removed.
    pub sessions: u64,
    /// Expired stream claims removed.
    pub claims: u64,
    /// Expired compound-operation locks removed.
    pub locks: u64,
    /// Expired client-request records removed.
    pub requests: u64,
    /// Expired server-request records removed.
    pub server_requests: u64,
    /// Queued messages orphaned by session expiry removed.
    pub orphaned_messages: u64,
}

/// Manager for the shared store connection pool.
///
/// `start` is idempotent with respect to configuration; `shutdown`
/// closes every pooled connection and discards the pool. The reaper
/// can be reconfigured before or after start.
pub struct PoolManager {
    datastore: DatastoreConfig,
    reaper: Mutex<ReaperConfig>,
    pool: Mutex<Option<SqlitePool>>,
    reaper_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    reap_cycles: AtomicU64,
}

impl PoolManager {
    /// Create a manager; no connections are opened until [`start`](Self::start).
    #[must_use]
    pub fn new(datastore: DatastoreConfig, reaper: ReaperConfig) -> Self {
        Self {
            datastore,
            reaper: Mutex::new(reaper),
            pool: Mutex::new(None),
            reaper_task: Mutex::new(None),
            reap_cycles: AtomicU64::new(0),
        }
    }

    /// Validate configuration, construct the pool, and start the
    /// reaper if enabled. Calling `start` on an already-started
    /// manager is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for invalid settings and
    /// `AppError::Db` if the pool cannot be constructed.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.datastore.path.is_empty() {
            return Err(AppError::Config("datastore path must not be empty".into()));
        }
        if self.datastore.pool_size == 0 {
            return Err(AppError::Config("pool size must be positive".into()));
        }
        if self.datastore.acquire_timeout_seconds == 0 {
            return Err(AppError::Config("acquire timeout must be positive".into()));
        }

        if self.lock_pool().is_some() {
            debug!("pool manager already started");
            return Ok(());
        }

        let reaper = self.reaper_config();
        let idle_timeout = reaper
            .enabled
            .then(|| Duration::from_secs(reaper.idle_timeout_seconds));
        let pool = db::connect(&self.datastore, idle_timeout).await?;
        *self.guard(&self.pool) = Some(pool);
        info!(
            path = %self.datastore.path,
            pool_size = self.datastore.pool_size,
            "shared store pool started"
        );

        if reaper.enabled {
            self.spawn_reaper(Duration::from_secs(reaper.interval_seconds));
        }
        Ok(())
    }

    /// Close every pooled connection and discard the pool.
    pub async fn shutdown(&self) {
        if let Some((cancel, handle)) = self.guard(&self.reaper_task).take() {
            cancel.cancel();
            let _ = handle.await;
        }
        let pool = self.guard(&self.pool).take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("shared store pool shut down");
        }
    }

    /// Replace the reaper configuration.
    ///
    /// When the manager is already started, the running reaper task is
    /// stopped or restarted to match the new settings.
    pub fn configure_reaper(self: &Arc<Self>, config: ReaperConfig) {
        *self.guard(&self.reaper) = config;

        let started = self.lock_pool().is_some();
        if let Some((cancel, _handle)) = self.guard(&self.reaper_task).take() {
            cancel.cancel();
        }
        if started && config.enabled {
            self.spawn_reaper(Duration::from_secs(config.interval_seconds));
        }
    }

    /// Borrow the live pool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the manager has not been started.
    pub fn pool(&self) -> Result<SqlitePool> {
        self.lock_pool()
            .ok_or_else(|| AppError::Db("pool manager not started".into()))
    }

    /// Point-in-time statistics; all zeros before `start`.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lock_pool().map_or_else(PoolStats::default, |pool| {
            let size = pool.size();
            let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
            PoolStats {
                size,
                available: self.datastore.pool_size.saturating_sub(size) + idle,
                idle,
            }
        })
    }

    /// Number of reap cycles attempted since start, successful or not.
    #[must_use]
    pub fn reap_cycles(&self) -> u64 {
        self.reap_cycles.load(Ordering::SeqCst)
    }

    /// Sweep TTL-expired rows from every bookkeeping table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the manager is not started or a
    /// delete fails.
    pub async fn reap_now(&self) -> Result<ReapReport> {
        let pool = self.pool()?;
        let now = now_rfc3339();

        let sessions = sqlx::query("DELETE FROM session WHERE expires_at < ?1")
            .bind(&now)
            .execute(&pool)
            .await?
            .rows_affected();
        let claims = sqlx::query("DELETE FROM stream_claim WHERE expires_at < ?1")
            .bind(&now)
            .execute(&pool)
            .await?
            .rows_affected();
        let locks = sqlx::query("DELETE FROM session_lock WHERE expires_at < ?1")
            .bind(&now)
            .execute(&pool)
            .await?
            .rows_affected();
        let requests = sqlx::query(
            "DELETE FROM active_request WHERE expires_at < ?1;",
        )
        .bind(&now)
        .execute(&pool)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM cancelled_request WHERE expires_at < ?1")
            .bind(&now)
            .execute(&pool)
            .await?;
        let server_requests = sqlx::query("DELETE FROM server_request WHERE expires_at < ?1")
            .bind(&now)
            .execute(&pool)
            .await?
            .rows_affected();
        let orphaned_messages = sqlx::query(
            "DELETE FROM session_message
             WHERE session_id NOT IN (SELECT id FROM session)",
        )
        .execute(&pool)
        .await?
        .rows_affected();

        Ok(ReapReport {
            sessions,
            claims,
            locks,
            requests,
            server_requests,
            orphaned_messages,
        })
    }

    fn reaper_config(&self) -> ReaperConfig {
        *self.guard(&self.reaper)
    }

    fn lock_pool(&self) -> Option<SqlitePool> {
        self.guard(&self.pool).clone()
    }

    fn guard<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawn the background reap loop. A failed cycle logs and the
    /// loop continues; nothing short of cancellation stops it.
    fn spawn_reaper(self: &Arc<Self>, interval: Duration) {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a reap never
            // races the caller that just started the manager.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => {
                        debug!("pool reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.reap_cycles.fetch_add(1, Ordering::SeqCst);
                        match manager.reap_now().await {
                            Ok(report) => {
                                debug!(?report, "reap cycle complete");
                            }
                            Err(err) => {
                                error!(%err, "reap cycle failed");
                            }
                        }
                    }
                }
            }
        });

        *self.guard(&self.reaper_task) = Some((cancel, handle));
    }
}
