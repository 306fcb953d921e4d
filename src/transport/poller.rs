//! Background delivery poller.
//!
//! One loop per instance. Each cycle drains the durable queue of
//! every session whose live stream is held locally and pushes the
//! messages onto that stream, in fixed-size batches so a single cycle
//! stays bounded. Dead clients are detected here and reaped; a bad
//! cycle logs and the loop continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PollerConfig;
use crate::persistence::event_counter::EventCounter;
use crate::persistence::request_store::ServerRequestStore;
use crate::persistence::session_store::SessionStore;
use crate::Result;

use super::registry::{DeliveryError, StreamEvent, StreamRegistry};

/// Delivery poller for locally-held streams.
///
/// Started and stopped explicitly; `start` is idempotent against a
/// double call.
pub struct MessagePoller {
    inner: Arc<PollerInner>,
    running: AtomicBool,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct PollerInner {
    config: PollerConfig,
    registry: Arc<StreamRegistry>,
    sessions: SessionStore,
    server_requests: ServerRequestStore,
    counter: EventCounter,
}

impl MessagePoller {
    /// Create a poller; no work happens until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: PollerConfig,
        registry: Arc<StreamRegistry>,
        sessions: SessionStore,
        server_requests: ServerRequestStore,
        counter: EventCounter,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                config,
                registry,
                sessions,
                server_requests,
                counter,
            }),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Spawn the poll loop. A second call while running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("message poller already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_millis(inner.config.interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => {
                        info!("message poller shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // One bad cycle must never kill the loop.
                        if let Err(err) = inner.cycle().await {
                            error!(%err, "poll cycle failed");
                        }
                    }
                }
            }
        });

        *self.guard() = Some((cancel, handle));
        info!("message poller started");
    }

    /// Stop the poll loop and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.guard().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one poll cycle inline. Exposed for deterministic tests;
    /// the background loop calls exactly this.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if listing sessions fails; per-session
    /// delivery failures are handled inside the cycle.
    pub async fn poll_once(&self) -> Result<()> {
        self.inner.cycle().await
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PollerInner {
    async fn cycle(&self) -> Result<()> {
        // Local handles whose shared claim lapsed are dropped first so
        // we never deliver into a stream we no longer own.
        let reaped = self.registry.reap_expired().await?;
        for session_id in &reaped {
            // Clear the fleet-wide flag only while it still points at
            // us; after a takeover it belongs to the new owner.
            let owner = self.sessions.owning_instance(session_id).await?;
            if owner.as_deref() == Some(self.registry.instance_id()) {
                self.sessions.mark_stream_inactive(session_id).await?;
            }
        }

        self.sweep_expired_pings().await;

        let local = self.registry.all_local().await;
        if local.is_empty() {
            return Ok(());
        }

        for batch in local.chunks(self.config.batch_size) {
            for session_id in batch {
                // A dead client must never block the rest of the batch.
                if let Err(err) = self.deliver_session(session_id).await {
                    error!(session_id, %err, "session delivery failed");
                }
            }
        }
        Ok(())
    }

    /// Unanswered liveness pings past the timeout mean the client is
    /// gone even though the socket never errored; reap those streams.
    async fn sweep_expired_pings(&self) {
        let timeout = Duration::from_secs(self.config.ping_timeout_seconds);
        let expired = match self.server_requests.expired_requests(timeout).await {
            Ok(expired) => expired,
            Err(err) => {
                error!(%err, "expired request sweep failed");
                return;
            }
        };

        for request in expired {
            debug!(
                request_id = %request.id,
                session_id = %request.session_id,
                kind = request.kind.as_str(),
                "server request expired without reply"
            );
            if let Err(err) = self.server_requests.acknowledge(&request.id).await {
                error!(request_id = %request.id, %err, "failed to clear expired request");
            }
            if self.registry.has_local(&request.session_id).await {
                if let Err(err) = self.registry.unregister(&request.session_id).await {
                    error!(session_id = %request.session_id, %err, "failed to unregister stream");
                }
                if let Err(err) = self.sessions.mark_stream_inactive(&request.session_id).await {
                    error!(session_id = %request.session_id, %err, "failed to mark stream inactive");
                }
            }
        }
    }

    async fn deliver_session(&self, session_id: &str) -> Result<()> {
        let Some(handle) = self.registry.local_handle(session_id).await else {
            return Ok(());
        };

        let messages = self.sessions.drain_messages(session_id).await?;
        if messages.is_empty() {
            self.registry.refresh_heartbeat(session_id).await?;
            return Ok(());
        }

        let mut messages = messages;
        let mut delivered = 0;
        for message in &messages {
            let event_id = self.counter.next_id(self.registry.instance_id()).await?;
            match handle.deliver(StreamEvent {
                id: Some(event_id),
                message: message.clone(),
            }) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Closed) => {
                    // Expected: the client went away. Clean up quietly.
                    debug!(session_id, "stream closed by peer, unregistering");
                    self.registry.unregister(session_id).await?;
                    self.sessions.mark_stream_inactive(session_id).await?;
                    break;
                }
                Err(DeliveryError::Backpressure) => {
                    // May be transient; keep the stream and retry the
                    // remainder next cycle.
                    error!(session_id, "stream backpressure, re-queueing remainder");
                    break;
                }
            }
        }

        // Re-queueing appends, so a message pushed while this drain
        // was in flight ends up ahead of the remainder. Delivery is
        // at-least-once; strict cross-pop ordering is not guaranteed
        // across a backpressure event.
        let undelivered = messages.split_off(delivered);
        if !undelivered.is_empty() {
            self.sessions
                .queue()
                .push_bulk(session_id, &undelivered)
                .await?;
        }

        if self.registry.has_local(session_id).await {
            self.registry.refresh_heartbeat(session_id).await?;
        }
        Ok(())
    }
}
