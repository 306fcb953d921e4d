//! Session model and handler-snapshot helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names of the handlers last advertised to a session's client, used
/// for `list_changed` diffing on subsequent catalog changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandlerSnapshot {
    /// Advertised prompt names.
    pub prompts: Vec<String>,
    /// Advertised resource names.
    pub resources: Vec<String>,
    /// Advertised tool names.
    pub tools: Vec<String>,
}

impl HandlerSnapshot {
    /// Categories whose name lists differ between `self` and `other`.
    #[must_use]
    pub fn changed_categories(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.prompts != other.prompts {
            changed.push("prompts");
        }
        if self.resources != other.resources {
            changed.push("resources");
        }
        if self.tools != other.tools {
            changed.push("tools");
        }
        changed
    }
}

/// Session entity persisted in the shared store.
///
/// A session is a logical client connection independent of which
/// instance currently serves it. `stream_server` is set exactly when
/// `active_stream` is true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Opaque unique identifier.
    pub id: String,
    /// Instance that created the session.
    pub server_instance: String,
    /// Arbitrary per-session context bag (JSON object, stored serialized).
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Whether a live SSE stream is currently open somewhere in the fleet.
    pub active_stream: bool,
    /// Instance holding the live stream, when `active_stream` is true.
    pub stream_server: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp; every mutation updates it.
    pub last_activity: DateTime<Utc>,
    /// Expiry deadline, refreshed on every mutation.
    pub expires_at: DateTime<Utc>,
    /// Handler names advertised at creation or last diff.
    pub handlers: HandlerSnapshot,
}
