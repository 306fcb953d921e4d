//! Per-request context threaded through dispatch.
//!
//! An explicit value passed from transport to handler to helper — no
//! thread-local ambient state — so it composes with any task or
//! thread layout.

use std::sync::Arc;

use serde_json::Value;

use crate::persistence::request_store::RequestStore;
use crate::rpc::handler::NotificationSink;

/// Everything a handler invocation may need from the transport:
/// session identity, the in-flight request record, the progress token
/// the client supplied, and the outbound notification sink.
#[derive(Clone)]
pub struct RequestContext {
    /// Session the request belongs to, when one was resolved.
    pub session_id: Option<String>,
    /// In-flight JSON-RPC request id, absent for notifications.
    pub request_id: Option<String>,
    /// Client-supplied progress token, when progress was requested.
    pub progress_token: Option<Value>,
    /// Request bookkeeping store, polled for cancellation.
    pub requests: RequestStore,
    /// Outbound notification sink.
    pub sink: Arc<dyn NotificationSink>,
}

impl RequestContext {
    /// Context with no session or request bound yet.
    #[must_use]
    pub fn new(requests: RequestStore, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            session_id: None,
            request_id: None,
            progress_token: None,
            requests,
            sink,
        }
    }

    /// Bind a session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Bind an in-flight request id.
    #[must_use]
    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Bind the client's progress token.
    #[must_use]
    pub fn with_progress_token(mut self, token: Value) -> Self {
        self.progress_token = Some(token);
        self
    }
}
