//! Shared stream-claim model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared-store record stating which instance owns a session's live
/// stream. Auto-expires when the heartbeat stops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamClaim {
    /// Session whose stream is claimed.
    pub session_id: String,
    /// Instance holding the live handle.
    pub instance_id: String,
    /// Last heartbeat refresh.
    pub heartbeat_at: DateTime<Utc>,
    /// Claim expiry deadline.
    pub expires_at: DateTime<Utc>,
}
