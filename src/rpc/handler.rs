//! Dispatch seams between the transport and handler implementations.
//!
//! The transport knows nothing about what handlers do; it resolves a
//! method name to a [`RequestHandler`], executes it with an explicit
//! [`RequestContext`], and moves the result. Catalog contents and
//! schema validation live behind [`HandlerCatalog`] entirely.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::session::HandlerSnapshot;
use crate::transport::context::RequestContext;
use crate::Result;

/// A callable request handler for one JSON-RPC method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Execute the method and produce a serializable result.
    async fn handle(&self, ctx: &RequestContext, params: Value) -> Result<Value>;
}

/// Client-facing notification sink.
///
/// Implemented by the transport layer: a notification for a session is
/// queued for delivery through whichever instance holds the session's
/// live stream.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Send a JSON-RPC notification toward the client.
    async fn send_notification(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<()>;
}

/// Registry boundary exposing the current handler names per category,
/// used for `list_changed` diffing against the per-session snapshot.
pub trait HandlerCatalog: Send + Sync {
    /// Currently registered prompt names.
    fn prompt_names(&self) -> Vec<String>;
    /// Currently registered resource names.
    fn resource_names(&self) -> Vec<String>;
    /// Currently registered tool names.
    fn tool_names(&self) -> Vec<String>;

    /// Current names bundled as a snapshot.
    fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot {
            prompts: self.prompt_names(),
            resources: self.resource_names(),
            tools: self.tool_names(),
        }
    }
}

/// An empty catalog for deployments that wire handlers elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCatalog;

impl HandlerCatalog for EmptyCatalog {
    fn prompt_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn resource_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn tool_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Plain dispatch table mapping method name to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    routes: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with the built-in `ping` handler.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            routes: HashMap::new(),
        };
        registry.register("ping", Arc::new(PingHandler));
        registry
    }

    /// Register a handler for `method`, replacing any previous one.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.routes.insert(method.into(), handler);
    }

    /// Resolve the handler for `method`.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.routes.get(method).cloned()
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Built-in liveness handler; replies with an empty object.
struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    async fn handle(&self, _ctx: &RequestContext, _params: Value) -> Result<Value> {
        Ok(json!({}))
    }
}
