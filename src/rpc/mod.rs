//! JSON-RPC protocol layer.
//!
//! Message parsing and formatting, the response-content variants, and
//! the dispatch seams ([`handler::RequestHandler`],
//! [`handler::NotificationSink`], [`handler::HandlerCatalog`]) the
//! transport hands delivered messages to.

pub mod handler;
pub mod message;
pub mod response;
