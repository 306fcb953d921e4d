//! Cooperative cancellation and progress reporting.
//!
//! Both primitives take an explicit [`RequestContext`] and wrap a
//! future. Cancellation is poll-based: the flag in the shared store is
//! checked every `interval`, and detection aborts the wrapped future
//! at its next suspension point. A future that never yields cannot be
//! interrupted — cooperative cancellation cannot preempt code that
//! does not cooperate.

use std::future::Future;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::persistence::request_store::RequestStore;
use crate::{AppError, Result};

use super::context::RequestContext;

/// Run `fut` under cooperative cancellation.
///
/// With no request bound in `ctx`, the future runs directly with zero
/// overhead. Otherwise: an already-flagged request fails immediately;
/// else the future races a poll loop on the cancellation flag and is
/// dropped at its next await point once the flag is observed.
///
/// # Errors
///
/// Returns `AppError::Cancelled` on cancellation, or whatever error
/// `fut` produced.
pub async fn cancellable<T, F>(
    ctx: Option<&RequestContext>,
    interval: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some((request_id, requests)) = ctx.and_then(|ctx| {
        ctx.request_id
            .as_deref()
            .map(|id| (id.to_owned(), ctx.requests.clone()))
    }) else {
        return fut.await;
    };

    if requests.cancelled(&request_id).await? {
        let reason = requests.cancellation_reason(&request_id).await?;
        return Err(AppError::Cancelled(reason));
    }

    tokio::select! {
        result = fut => result,
        reason = watch_cancellation(&requests, &request_id, interval) => {
            Err(AppError::Cancelled(reason))
        }
    }
}

/// Resolve only once the request is flagged cancelled, with the reason.
async fn watch_cancellation(
    requests: &RequestStore,
    request_id: &str,
    interval: Duration,
) -> Option<String> {
    loop {
        tokio::time::sleep(interval).await;
        match requests.cancelled(request_id).await {
            Ok(true) => {
                return requests
                    .cancellation_reason(request_id)
                    .await
                    .ok()
                    .flatten();
            }
            Ok(false) => {}
            Err(err) => {
                // Transient store failure: keep polling.
                debug!(request_id, %err, "cancellation poll failed");
            }
        }
    }
}

/// Run `fut` while periodically reporting progress to the client.
///
/// With no progress token in `ctx`, the future runs directly. The
/// reporter emits `notifications/progress` with
/// `progress = elapsed / max_duration * 100` capped at 99 and stops on
/// its own once `max_duration` elapses or the request is flagged
/// cancelled. Whatever the future's outcome, one final notification
/// with `progress: 100` and message `"Completed"` is attempted before
/// returning. Notification delivery failures never affect the result.
///
/// # Errors
///
/// Returns whatever error `fut` produced; progress reporting adds none.
pub async fn progressable<T, F>(
    ctx: Option<&RequestContext>,
    max_duration: Duration,
    message: Option<String>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(ctx) = ctx else {
        return fut.await;
    };
    let Some(token) = ctx.progress_token.clone() else {
        return fut.await;
    };

    let reporter = tokio::spawn(report_progress(
        ctx.clone(),
        token.clone(),
        max_duration,
        message,
    ));

    let result = fut.await;
    reporter.abort();

    // Final notification is attempted regardless of how the future
    // finished; a failed send is logged and swallowed.
    let final_params = json!({
        "progressToken": token,
        "progress": 100,
        "total": 100,
        "message": "Completed",
    });
    if let Err(err) = ctx
        .sink
        .send_notification(
            "notifications/progress",
            final_params,
            ctx.session_id.as_deref(),
        )
        .await
    {
        warn!(%err, "failed to send final progress notification");
    }

    result
}

/// Periodic progress reporter, aborted by `progressable` when the
/// wrapped future settles.
async fn report_progress(
    ctx: RequestContext,
    token: serde_json::Value,
    max_duration: Duration,
    message: Option<String>,
) {
    let interval = (max_duration / 10)
        .max(Duration::from_millis(50))
        .min(Duration::from_secs(1));
    let started = tokio::time::Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let elapsed = started.elapsed();
        if elapsed >= max_duration {
            break;
        }

        if let Some(request_id) = ctx.request_id.as_deref() {
            if matches!(ctx.requests.cancelled(request_id).await, Ok(true)) {
                debug!(request_id, "request cancelled, stopping progress reporter");
                break;
            }
        }

        let percent = (elapsed.as_secs_f64() / max_duration.as_secs_f64() * 100.0).min(99.0);
        let mut params = json!({
            "progressToken": token,
            "progress": percent,
            "total": 100,
        });
        if let Some(ref message) = message {
            params["message"] = json!(message);
        }

        if let Err(err) = ctx
            .sink
            .send_notification("notifications/progress", params, ctx.session_id.as_deref())
            .await
        {
            // Delivery failure never interrupts the protected work.
            warn!(%err, "failed to send progress notification");
        }
    }
}
