#![forbid(unsafe_code)]

//! Distributed streamable-HTTP transport for MCP servers.
//!
//! Many stateless server instances share client sessions through one
//! datastore. Each instance serves any HTTP request for any session;
//! server-to-client messages are routed to whichever instance holds
//! the client's live SSE stream, via durable per-session queues and a
//! background delivery poller.

pub mod config;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod rpc;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
