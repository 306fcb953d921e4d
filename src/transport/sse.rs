//! SSE stream construction for `GET /`.
//!
//! Opening a stream registers the local handle and the shared claim,
//! and flips the session's active-stream flag. Teardown happens when
//! the client disconnects (the response body is dropped) or when the
//! poller observes a delivery failure; both paths unregister and flip
//! the flag back.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::persistence::session_store::SessionStore;
use crate::Result;

use super::registry::{StreamEvent, StreamHandle, StreamRegistry};

/// Buffered events per stream before delivery reports backpressure.
pub const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Open a live stream for `session_id` and return the SSE response.
///
/// # Errors
///
/// Returns `AppError::Db` if registering the stream in the shared
/// store fails.
pub async fn open_stream(
    registry: Arc<StreamRegistry>,
    sessions: SessionStore,
    session_id: String,
    keep_alive: Duration,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
    let handle = StreamHandle::new(tx);

    registry.register(&session_id, handle.clone()).await?;
    sessions
        .mark_stream_active(&session_id, registry.instance_id())
        .await?;

    let guard = StreamGuard {
        registry,
        sessions,
        session_id,
        handle,
    };

    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|event| (Ok(to_sse_event(&event)), (rx, guard)))
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive).text("ping")))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    let mut sse_event = Event::default().data(event.message.to_string());
    if let Some(ref id) = event.id {
        sse_event = sse_event.id(id);
    }
    sse_event
}

/// Held inside the stream state; dropping it (client disconnect or
/// server teardown) schedules the unregister + flag flip.
///
/// A reconnect may already have replaced this stream, on this instance
/// or another one, by the time the stale body is dropped. The guard
/// therefore tears down only what it registered itself: the handle is
/// removed only while it is still the registered one, and the
/// fleet-wide flag is cleared only while the session's owning instance
/// is still this one.
struct StreamGuard {
    registry: Arc<StreamRegistry>,
    sessions: SessionStore,
    session_id: String,
    handle: StreamHandle,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let handle = self.handle.clone();

        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                debug!(session_id, "stream body dropped, tearing down");
                let removed = match registry.unregister_matching(&session_id, &handle).await {
                    Ok(removed) => removed,
                    Err(err) => {
                        debug!(session_id, %err, "stream unregister on drop failed");
                        return;
                    }
                };
                if !removed {
                    return;
                }
                match sessions.owning_instance(&session_id).await {
                    Ok(owner) if owner.as_deref() == Some(registry.instance_id()) => {
                        if let Err(err) = sessions.mark_stream_inactive(&session_id).await {
                            debug!(session_id, %err, "stream flag reset on drop failed");
                        }
                    }
                    Ok(_) => {
                        debug!(session_id, "stream taken over, leaving flag to the new owner");
                    }
                    Err(err) => {
                        debug!(session_id, %err, "stream owner lookup on drop failed");
                    }
                }
            });
        }
    }
}
