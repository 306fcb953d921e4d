//! In-flight request tracking models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A client-initiated request currently being processed somewhere in
/// the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PendingRequest {
    /// JSON-RPC request id.
    pub id: String,
    /// Session the request belongs to, when one was supplied.
    pub session_id: Option<String>,
    /// Instance that registered the request.
    pub instance_id: String,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

/// Kind of a server-initiated request awaiting a client reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerRequestKind {
    /// Liveness ping.
    Ping,
    /// Sampling request (`sampling/createMessage`).
    CreateMessage,
    /// Roots listing request (`roots/list`).
    ListRoots,
    /// Elicitation request (`elicitation/create`).
    Elicit,
}

impl ServerRequestKind {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::CreateMessage => "create_message",
            Self::ListRoots => "list_roots",
            Self::Elicit => "elicit",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ping" => Some(Self::Ping),
            "create_message" => Some(Self::CreateMessage),
            "list_roots" => Some(Self::ListRoots),
            "elicit" => Some(Self::Elicit),
            _ => None,
        }
    }
}

/// A server-initiated request that has not yet been acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PendingServerRequest {
    /// JSON-RPC request id issued by the server.
    pub id: String,
    /// Session the request was sent to.
    pub session_id: String,
    /// Request kind.
    pub kind: ServerRequestKind,
    /// Send timestamp, compared against a timeout by the expiry sweep.
    pub created_at: DateTime<Utc>,
}
