//! Queue-backed notification sink.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::persistence::session_store::SessionStore;
use crate::rpc::handler::NotificationSink;
use crate::rpc::message;
use crate::Result;

/// Routes notifications through the session's durable queue, so they
/// reach the client via whichever instance holds the live stream.
#[derive(Clone)]
pub struct QueueNotificationSink {
    sessions: SessionStore,
}

impl QueueNotificationSink {
    /// Create a sink over the session store.
    #[must_use]
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl NotificationSink for QueueNotificationSink {
    async fn send_notification(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<()> {
        let Some(session_id) = session_id else {
            debug!(method, "notification without session dropped");
            return Ok(());
        };
        let queued = self
            .sessions
            .queue_message(session_id, &message::notification(method, params))
            .await?;
        if !queued {
            debug!(method, session_id, "notification for unknown session dropped");
        }
        Ok(())
    }
}
