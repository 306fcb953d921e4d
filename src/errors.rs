//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with the shared store.
    Db(String),
    /// JSON-RPC protocol violation (malformed body, unknown method).
    Rpc(String),
    /// Session is missing, expired, or the id is invalid.
    InvalidSession(String),
    /// Request handler raised an unexpected error.
    Handler(String),
    /// In-flight request was cancelled; carries the reason if one was given.
    Cancelled(Option<String>),
    /// Requested entity does not exist.
    NotFound(String),
    /// Compound-operation lock could not be acquired within the timeout.
    LockTimeout(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::InvalidSession(msg) => write!(f, "invalid session: {msg}"),
            Self::Handler(msg) => write!(f, "handler: {msg}"),
            Self::Cancelled(Some(reason)) => write!(f, "cancelled: {reason}"),
            Self::Cancelled(None) => write!(f, "cancelled"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::LockTimeout(msg) => write!(f, "lock timeout: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Rpc(err.to_string())
    }
}
