//! Stream registry: local handles plus shared claims.
//!
//! Live SSE connections exist only in the memory of the instance that
//! accepted them; what crosses instances is the claim row in the
//! shared store. The registry keeps the two in step: registering a
//! stream writes both, heartbeat refreshes extend both, and local
//! handles whose shared claim silently lapsed are reaped so process
//! memory stays bounded.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::persistence::claim_repo::StreamClaimRepo;
use crate::persistence::session_store::SessionStore;
use crate::Result;

/// One event pushed down a live SSE connection.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Globally-unique event id (`{instance}-{n}`), absent for
    /// keep-alive-only frames.
    pub id: Option<String>,
    /// The JSON-RPC message to deliver.
    pub message: Value,
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The receiving side is gone; the client disconnected.
    Closed,
    /// The channel is full; the client is alive but not keeping up.
    Backpressure,
}

/// Local, non-serializable handle to a live SSE connection.
///
/// Never crosses instances — only the claim row does.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamHandle {
    /// Wrap a channel sender feeding a live SSE body.
    #[must_use]
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Attempt delivery without blocking the poll cycle.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] when the client is gone,
    /// [`DeliveryError::Backpressure`] when the channel is full.
    pub fn deliver(&self, event: StreamEvent) -> std::result::Result<(), DeliveryError> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
        })
    }

    /// Whether `other` feeds the same underlying channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Tracks which sessions have a live stream on this instance, mirrored
/// into the shared store for cross-instance visibility.
pub struct StreamRegistry {
    instance_id: String,
    local: RwLock<HashMap<String, StreamHandle>>,
    claims: StreamClaimRepo,
    sessions: SessionStore,
}

impl StreamRegistry {
    /// Create a registry for this instance.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        claims: StreamClaimRepo,
        sessions: SessionStore,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            local: RwLock::new(HashMap::new()),
            claims,
            sessions,
        }
    }

    /// This instance's identifier.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a live stream: local handle plus shared claim.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim write fails; the local
    /// handle is still registered so the caller can tear it down.
    pub async fn register(&self, session_id: &str, handle: StreamHandle) -> Result<()> {
        self.local
            .write()
            .await
            .insert(session_id.to_owned(), handle);
        self.claims.claim(session_id, &self.instance_id).await?;
        debug!(session_id, "stream registered");
        Ok(())
    }

    /// Drop the local handle and release the shared claim.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim delete fails.
    pub async fn unregister(&self, session_id: &str) -> Result<()> {
        self.local.write().await.remove(session_id);
        self.claims.release(session_id, &self.instance_id).await?;
        debug!(session_id, "stream unregistered");
        Ok(())
    }

    /// Drop the local handle and release the claim, but only while the
    /// registered handle is still `handle`. A stream that a reconnect
    /// already replaced leaves the replacement untouched.
    ///
    /// Returns `true` when this call removed the handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim delete fails.
    pub async fn unregister_matching(
        &self,
        session_id: &str,
        handle: &StreamHandle,
    ) -> Result<bool> {
        let mut local = self.local.write().await;
        let current = local
            .get(session_id)
            .is_some_and(|registered| registered.same_channel(handle));
        if current {
            local.remove(session_id);
        }
        drop(local);

        if current {
            self.claims.release(session_id, &self.instance_id).await?;
            debug!(session_id, "stream unregistered");
        } else {
            debug!(session_id, "stream already replaced, leaving registration");
        }
        Ok(current)
    }

    /// The local handle for a session, when this instance holds it.
    pub async fn local_handle(&self, session_id: &str) -> Option<StreamHandle> {
        self.local.read().await.get(session_id).cloned()
    }

    /// Whether this instance holds the session's live stream.
    pub async fn has_local(&self, session_id: &str) -> bool {
        self.local.read().await.contains_key(session_id)
    }

    /// Snapshot of all locally-held session ids.
    pub async fn all_local(&self) -> Vec<String> {
        self.local.read().await.keys().cloned().collect()
    }

    /// Extend the claim heartbeat and the session's own TTL, so an
    /// idle-but-open stream's session does not expire out from under it.
    ///
    /// Returns `false` when the claim was lost to expiry or takeover.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a store write fails.
    pub async fn refresh_heartbeat(&self, session_id: &str) -> Result<bool> {
        let owned = self.claims.refresh(session_id, &self.instance_id).await?;
        if owned {
            self.sessions.touch(session_id).await?;
        }
        Ok(owned)
    }

    /// Drop local handles whose shared claim disappeared and return
    /// the removed session ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim query fails.
    pub async fn reap_expired(&self) -> Result<Vec<String>> {
        let live = self.claims.live_sessions_for(&self.instance_id).await?;
        let mut removed = Vec::new();
        let mut local = self.local.write().await;
        local.retain(|session_id, _| {
            if live.contains(session_id) {
                true
            } else {
                removed.push(session_id.clone());
                false
            }
        });
        drop(local);
        for session_id in &removed {
            debug!(session_id, "local stream handle reaped, claim lapsed");
        }
        Ok(removed)
    }
}
