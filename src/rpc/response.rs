//! Response content variants.
//!
//! A closed set of content kinds a handler result may carry, each with
//! one serialization shape. Collaborating handler implementations
//! build these; the transport only moves them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One content item in a handler result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContent {
    /// Plain text.
    Text {
        /// The text body.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Encoded image bytes.
        data: String,
        /// Image MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64-encoded audio.
    Audio {
        /// Encoded audio bytes.
        data: String,
        /// Audio MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource reference.
    Resource {
        /// Resource URI.
        uri: String,
        /// Resource MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Inline text contents, when available.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Handler-level error surfaced to the client.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

impl ResponseContent {
    /// Whether this item is the error variant.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Wrap content items into a call-result payload.
///
/// Any error item marks the whole result as an error.
#[must_use]
pub fn call_result(contents: &[ResponseContent]) -> Value {
    let is_error = contents.iter().any(ResponseContent::is_error);
    json!({
        "content": contents,
        "isError": is_error,
    })
}
