//! Distributed real-time transport.
//!
//! Routes server-to-client messages to whichever instance holds a
//! session's live SSE stream, drives cooperative cancellation and
//! progress reporting, and answers the POST/GET/DELETE request
//! state machine.

pub mod cancellation;
pub mod context;
pub mod http;
pub mod poller;
pub mod registry;
pub mod sink;
pub mod sse;
