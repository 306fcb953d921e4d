//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::{AppError, Result};

/// Shared-datastore connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DatastoreConfig {
    /// Path to the shared `SQLite` database file. Every instance in the
    /// fleet must point at the same file. `:memory:` is valid for tests
    /// but cannot be shared across processes.
    pub path: String,
    /// Maximum pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Seconds to wait for a pooled connection before failing checkout.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
}

fn default_pool_size() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    5
}

/// Background reaper settings for the pool manager.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReaperConfig {
    /// Whether the background reaper runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between reap cycles.
    #[serde(default = "default_reaper_interval")]
    pub interval_seconds: u64,
    /// Pooled connections idle longer than this are evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_reaper_interval(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    300
}

/// Session lifetime and queue bounds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Refreshable TTL applied to session records and queues.
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    /// Maximum queued messages per session; oldest dropped beyond this.
    #[serde(default = "default_queue_max_len")]
    pub queue_max_len: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
            queue_max_len: default_queue_max_len(),
        }
    }
}

fn default_session_ttl() -> u64 {
    300
}

fn default_queue_max_len() -> u32 {
    1000
}

/// Message poller cadence and batching.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PollerConfig {
    /// Milliseconds between poll cycles.
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Sessions processed per batch within one cycle.
    #[serde(default = "default_poll_batch")]
    pub batch_size: usize,
    /// Seconds after which an unanswered server-initiated ping is
    /// treated as a dead client.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_seconds: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            batch_size: default_poll_batch(),
            ping_timeout_seconds: default_ping_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    100
}

fn default_poll_batch() -> usize {
    100
}

fn default_ping_timeout() -> u64 {
    30
}

/// SSE stream keep-alive and claim heartbeat cadence.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Seconds between `: ping` keep-alive comments on open streams.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    /// Seconds a stream claim stays valid without a heartbeat refresh.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keep_alive_seconds: default_keep_alive(),
            claim_ttl_seconds: default_claim_ttl(),
        }
    }
}

fn default_keep_alive() -> u64 {
    15
}

fn default_claim_ttl() -> u64 {
    60
}

fn default_http_port() -> u16 {
    3000
}

fn default_instance_id() -> String {
    Uuid::new_v4().to_string()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Identifier for this server instance within the fleet. Defaults
    /// to a fresh v4 UUID per process.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// HTTP port for the streamable transport.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Shared-datastore connection settings.
    pub datastore: DatastoreConfig,
    /// Pool reaper settings.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Session TTL and queue bounds.
    #[serde(default)]
    pub session: SessionConfig,
    /// Delivery poller settings.
    #[serde(default)]
    pub poller: PollerConfig,
    /// Stream keep-alive settings.
    #[serde(default)]
    pub stream: StreamConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Session TTL as a [`Duration`].
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_seconds)
    }

    /// Poll cycle interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(AppError::Config("instance_id must not be empty".into()));
        }
        if self.datastore.path.is_empty() {
            return Err(AppError::Config("datastore.path must not be empty".into()));
        }
        if self.datastore.pool_size == 0 {
            return Err(AppError::Config(
                "datastore.pool_size must be greater than zero".into(),
            ));
        }
        if self.datastore.acquire_timeout_seconds == 0 {
            return Err(AppError::Config(
                "datastore.acquire_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.session.ttl_seconds == 0 {
            return Err(AppError::Config(
                "session.ttl_seconds must be greater than zero".into(),
            ));
        }
        if self.poller.batch_size == 0 {
            return Err(AppError::Config(
                "poller.batch_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
