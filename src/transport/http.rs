//! HTTP surface and request state machine.
//!
//! `POST /` carries JSON-RPC requests and notifications, `GET /`
//! opens the session's SSE stream, `DELETE /` tears the session down.
//! Any instance answers any request for any session; only delivery
//! through a live stream is instance-local.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::persistence::db::Database;
use crate::persistence::event_counter::EventCounter;
use crate::persistence::queue_repo::SessionMessageQueue;
use crate::persistence::request_store::{RequestStore, ServerRequestStore};
use crate::persistence::session_store::SessionStore;
use crate::rpc::handler::{HandlerCatalog, HandlerRegistry, NotificationSink};
use crate::rpc::message::{self, JsonRpcRequest, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::{AppError, Result};

use super::context::RequestContext;
use super::registry::StreamRegistry;
use super::sink::QueueNotificationSink;
use super::sse;

/// Session id header exchanged on every request after `initialize`.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// JSON-RPC error code for a cancelled request.
const REQUEST_CANCELLED: i64 = -32800;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Session store over the shared database.
    pub sessions: SessionStore,
    /// Stream registry for this instance.
    pub registry: Arc<StreamRegistry>,
    /// Client-request bookkeeping.
    pub requests: RequestStore,
    /// Server-request bookkeeping.
    pub server_requests: ServerRequestStore,
    /// Stream event id counter.
    pub counter: EventCounter,
    /// Method dispatch table.
    pub handlers: HandlerRegistry,
    /// Handler-name catalog for list-changed diffing.
    pub catalog: Arc<dyn HandlerCatalog>,
    /// Outbound notification sink.
    pub sink: Arc<dyn NotificationSink>,
}

impl AppState {
    /// Wire up all components over one shared database handle.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        handlers: HandlerRegistry,
        catalog: Arc<dyn HandlerCatalog>,
    ) -> Self {
        let queue = SessionMessageQueue::new(Arc::clone(&db), config.session.queue_max_len);
        let sessions = SessionStore::new(
            Arc::clone(&db),
            config.instance_id.clone(),
            config.session_ttl(),
            queue,
        );
        let claims = crate::persistence::claim_repo::StreamClaimRepo::new(
            Arc::clone(&db),
            std::time::Duration::from_secs(config.stream.claim_ttl_seconds),
        );
        let registry = Arc::new(StreamRegistry::new(
            config.instance_id.clone(),
            claims,
            sessions.clone(),
        ));
        let requests = RequestStore::new(
            Arc::clone(&db),
            config.instance_id.clone(),
            config.session_ttl(),
        );
        let server_requests = ServerRequestStore::new(Arc::clone(&db), config.session_ttl());
        let counter = EventCounter::new(Arc::clone(&db));
        let sink: Arc<dyn NotificationSink> = Arc::new(QueueNotificationSink::new(sessions.clone()));

        Self {
            config,
            sessions,
            registry,
            requests,
            server_requests,
            counter,
            handlers,
            catalog,
            sink,
        }
    }

    fn base_context(&self) -> RequestContext {
        RequestContext::new(self.requests.clone(), Arc::clone(&self.sink))
    }
}

/// Handler for `GET /health` — returns 200 OK with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

/// Build the transport router. Unmatched methods on `/` answer 405.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/",
            axum::routing::post(handle_post)
                .get(handle_get)
                .delete(handle_delete),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the transport on `config.http_port` until cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails to bind.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let port = state.config.http_port;
    let bind = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind on {bind}: {err}")))?;

    info!(%bind, "starting streamable HTTP transport");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
        })
        .await
        .map_err(|err| AppError::Config(format!("transport server error: {err}")))?;

    info!("streamable HTTP transport shut down");
    Ok(())
}

fn header_session(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn invalid_session_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Invalid or missing session ID" })),
    )
        .into_response()
}

fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn accepted_response() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
}

async fn handle_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match JsonRpcRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "rejected malformed POST body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid JSON" })),
            )
                .into_response();
        }
    };

    if request.method == "initialize" {
        return handle_initialize(&state, request).await;
    }

    let Some(session_id) = header_session(&headers) else {
        return invalid_session_response();
    };
    match state.sessions.exists(&session_id).await {
        Ok(true) => {}
        Ok(false) => return invalid_session_response(),
        Err(err) => {
            error!(%err, "session lookup failed");
            return internal_error_response();
        }
    }

    if request.is_notification() {
        return handle_client_notification(&state, &session_id, &request).await;
    }

    let request_id = request
        .id_key()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Err(err) = state
        .requests
        .register_request(&request_id, Some(&session_id))
        .await
    {
        error!(%err, request_id, "failed to register in-flight request");
        return internal_error_response();
    }

    notify_list_changed(&state, &session_id).await;

    let mut ctx = state
        .base_context()
        .with_session(session_id.clone())
        .with_request(request_id.clone());
    if let Some(token) = request.progress_token() {
        ctx = ctx.with_progress_token(token);
    }

    let streaming = state
        .sessions
        .has_active_stream(&session_id)
        .await
        .unwrap_or(false);

    if streaming {
        // Deferred path: the response travels through the live stream
        // (possibly held by another instance); accept immediately.
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let response = match dispatch(&state, &ctx, &request).await {
                Ok(result) => message::result_response(request.id.as_ref(), result),
                Err(err) => deferred_error_response(&request, &err),
            };
            if let Err(err) = state.sessions.queue_message(&session_id, &response).await {
                error!(session_id, %err, "failed to queue deferred response");
            }
            if let Err(err) = state.requests.unregister_request(&request_id).await {
                warn!(request_id, %err, "failed to unregister deferred request");
            }
        });
        return accepted_response();
    }

    let result = dispatch(&state, &ctx, &request).await;
    if let Err(err) = state.requests.unregister_request(&request_id).await {
        warn!(request_id, %err, "failed to unregister request");
    }

    match result {
        Ok(value) => Json(message::result_response(request.id.as_ref(), value)).into_response(),
        Err(AppError::Rpc(msg)) => {
            debug!(method = %request.method, %msg, "method dispatch rejected");
            Json(message::error_response(
                request.id.as_ref(),
                METHOD_NOT_FOUND,
                &msg,
            ))
            .into_response()
        }
        Err(AppError::Cancelled(reason)) => Json(message::error_response(
            request.id.as_ref(),
            REQUEST_CANCELLED,
            reason.as_deref().unwrap_or("Request cancelled"),
        ))
        .into_response(),
        Err(err) => {
            error!(method = %request.method, ?err, "handler failed");
            internal_error_response()
        }
    }
}

fn deferred_error_response(request: &JsonRpcRequest, err: &AppError) -> Value {
    match err {
        AppError::Rpc(msg) => message::error_response(request.id.as_ref(), METHOD_NOT_FOUND, msg),
        AppError::Cancelled(reason) => message::error_response(
            request.id.as_ref(),
            REQUEST_CANCELLED,
            reason.as_deref().unwrap_or("Request cancelled"),
        ),
        other => {
            error!(method = %request.method, %other, "deferred handler failed");
            message::error_response(request.id.as_ref(), INTERNAL_ERROR, "Internal server error")
        }
    }
}

async fn handle_initialize(state: &Arc<AppState>, request: JsonRpcRequest) -> Response {
    let session_id = Uuid::new_v4().to_string();
    let context = request
        .params
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Err(err) = state.sessions.create(&session_id, context).await {
        error!(%err, "failed to create session");
        return internal_error_response();
    }
    if let Err(err) = state
        .sessions
        .store_handler_snapshot(&session_id, &state.catalog.snapshot())
        .await
    {
        error!(%err, session_id, "failed to store initial handler snapshot");
    }

    let ctx = state.base_context().with_session(session_id.clone());
    let result = if state.handlers.get("initialize").is_some() {
        dispatch(state, &ctx, &request).await
    } else {
        Ok(default_initialize_result())
    };

    match result {
        Ok(value) => (
            [(SESSION_HEADER, session_id)],
            Json(message::result_response(request.id.as_ref(), value)),
        )
            .into_response(),
        Err(err) => {
            error!(?err, "initialize handler failed");
            internal_error_response()
        }
    }
}

fn default_initialize_result() -> Value {
    json!({
        "protocolVersion": "2025-03-26",
        "capabilities": {
            "prompts": { "listChanged": true },
            "resources": { "listChanged": true },
            "tools": { "listChanged": true },
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

async fn handle_client_notification(
    state: &Arc<AppState>,
    session_id: &str,
    request: &JsonRpcRequest,
) -> Response {
    if request.method == "notifications/cancelled" {
        let params = request.params.as_ref();
        let target = params
            .and_then(|p| p.get("requestId"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        let reason = params
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        if let Some(target) = target {
            let flagged = state
                .requests
                .mark_cancelled(&target, reason.as_deref())
                .await;
            debug!(request_id = %target, flagged, "cancellation notification processed");
        } else {
            debug!("cancellation notification without requestId ignored");
        }
    } else {
        debug!(method = %request.method, session_id, "client notification ignored");
    }
    accepted_response()
}

/// Queue `list_changed` notifications for every handler category whose
/// advertised names drifted since the session's last snapshot.
async fn notify_list_changed(state: &Arc<AppState>, session_id: &str) {
    let current = state.catalog.snapshot();
    let stored = match state.sessions.get_handler_snapshot(session_id).await {
        Ok(Some(stored)) => stored,
        Ok(None) => return,
        Err(err) => {
            debug!(session_id, %err, "handler snapshot lookup failed");
            return;
        }
    };

    let changed = stored.changed_categories(&current);
    if changed.is_empty() {
        return;
    }

    for category in changed {
        let method = format!("notifications/{category}/list_changed");
        if let Err(err) = state
            .sink
            .send_notification(&method, json!({}), Some(session_id))
            .await
        {
            debug!(session_id, category, %err, "failed to queue list_changed");
        }
    }
    if let Err(err) = state
        .sessions
        .store_handler_snapshot(session_id, &current)
        .await
    {
        debug!(session_id, %err, "failed to refresh handler snapshot");
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    request: &JsonRpcRequest,
) -> Result<Value> {
    let params = request.params.clone().unwrap_or(Value::Null);
    match state.handlers.get(&request.method) {
        Some(handler) => handler.handle(ctx, params).await,
        None => Err(AppError::Rpc(format!(
            "method not found: {}",
            request.method
        ))),
    }
}

async fn handle_get(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_session(&headers) else {
        return invalid_session_response();
    };
    match state.sessions.exists(&session_id).await {
        Ok(true) => {}
        Ok(false) => return invalid_session_response(),
        Err(err) => {
            error!(%err, "session lookup failed");
            return internal_error_response();
        }
    }

    let keep_alive = std::time::Duration::from_secs(state.config.stream.keep_alive_seconds);
    match sse::open_stream(
        Arc::clone(&state.registry),
        state.sessions.clone(),
        session_id,
        keep_alive,
    )
    .await
    {
        Ok(stream) => stream.into_response(),
        Err(err) => {
            error!(%err, "failed to open stream");
            internal_error_response()
        }
    }
}

async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_session(&headers) else {
        // Nothing to tear down; deletion is idempotent.
        return (StatusCode::OK, Json(json!({ "success": true }))).into_response();
    };

    if state.registry.has_local(&session_id).await {
        if let Err(err) = state.registry.unregister(&session_id).await {
            warn!(session_id, %err, "failed to unregister stream on delete");
        }
    }
    match teardown_session(&state, &session_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(err) => {
            error!(session_id, %err, "session teardown failed");
            internal_error_response()
        }
    }
}

async fn teardown_session(state: &Arc<AppState>, session_id: &str) -> Result<()> {
    let removed = state.requests.cleanup_session_requests(session_id).await?;
    if !removed.is_empty() {
        debug!(session_id, count = removed.len(), "in-flight requests removed");
    }
    let removed = state.server_requests.cleanup_session(session_id).await?;
    if !removed.is_empty() {
        debug!(session_id, count = removed.len(), "server requests removed");
    }
    state.sessions.cleanup(session_id).await?;
    Ok(())
}
