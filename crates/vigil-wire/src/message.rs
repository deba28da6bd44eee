//! Wire protocol message types.
//!
//! A message is either a request (carries a `method` topic and optionally
//! a correlation `id`) or a response (always carries an `id` matching
//! some request). The presence of an `id` on a request means the sender
//! expects a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request routed by its `method` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Topic string used for subscription matching and handler dispatch.
    pub method: String,
    /// Correlation ID. Present iff a response is expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Opaque request body.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestMessage {
    /// Create a request with no correlation ID (fire-and-forget).
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            id: None,
            params: Value::Null,
        }
    }

    /// Attach a request body.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Attach a correlation ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A response correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Correlation ID of the request being answered.
    pub id: String,
    /// Opaque response body.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
}

impl ResponseMessage {
    /// Create a response answering the given request ID.
    pub fn reply_to(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result,
        }
    }

    /// The empty response delivered to callbacks whose request timed out.
    pub fn empty() -> Self {
        Self {
            id: String::new(),
            result: Value::Null,
        }
    }
}

/// A wire message: request or response.
///
/// Deserialization classifies by shape: a `method` member makes a
/// request; otherwise the body must be a response (and therefore carry
/// an `id`). Bodies that are neither fail to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Request variant.
    Request(RequestMessage),
    /// Response variant.
    Response(ResponseMessage),
}

impl Message {
    /// True if this message is a response.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    /// The correlation ID, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.id.as_deref(),
            Message::Response(resp) => Some(&resp.id),
        }
    }

    /// The request method, if this is a request.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Response(_) => None,
        }
    }
}

impl From<RequestMessage> for Message {
    fn from(req: RequestMessage) -> Self {
        Message::Request(req)
    }
}

impl From<ResponseMessage> for Message {
    fn from(resp: ResponseMessage) -> Self {
        Message::Response(resp)
    }
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a [`Message`].
pub fn decode_message(body: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(body)
}
