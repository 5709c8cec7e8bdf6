//! Wire-level message envelope.
//!
//! Every frame exchanged over a connection carries exactly one [`Envelope`]:
//! an application-chosen type tag, an opaque JSON payload, and the kind
//! discriminator that tells the dispatch loop whether the frame is a
//! fire-and-forget message, a fresh synchronous request, or the response to
//! an earlier request.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::failure::RemoteFailure;

/// Identifier linking a synchronous request to its response.
///
/// Identifiers are allocated per router, start at 1, increase monotonically,
/// and carry no meaning across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Classification of an envelope on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Fire-and-forget message; no reply is expected.
    Message,
    /// Fresh synchronous request awaiting exactly one response.
    Request {
        /// Identifier the response must echo.
        correlation_id: CorrelationId,
    },
    /// Response to an earlier request.
    Response {
        /// Identifier of the request being answered.
        correlation_id: CorrelationId,
        /// Failure raised by the remote handler, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<RemoteFailure>,
    },
}

/// One discrete message unit exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    content: Value,
    #[serde(flatten)]
    kind: EnvelopeKind,
}

impl Envelope {
    /// Builds a fire-and-forget message.
    #[must_use]
    pub fn message(message_type: impl Into<String>, content: Value) -> Self {
        Self {
            message_type: message_type.into(),
            content,
            kind: EnvelopeKind::Message,
        }
    }

    /// Builds a synchronous request.
    #[must_use]
    pub fn request(
        message_type: impl Into<String>,
        content: Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            content,
            kind: EnvelopeKind::Request { correlation_id },
        }
    }

    /// Builds a successful response.
    #[must_use]
    pub fn response(
        message_type: impl Into<String>,
        content: Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            content,
            kind: EnvelopeKind::Response {
                correlation_id,
                failure: None,
            },
        }
    }

    /// Builds a response carrying a remote failure instead of a result.
    #[must_use]
    pub fn failed_response(
        message_type: impl Into<String>,
        correlation_id: CorrelationId,
        failure: RemoteFailure,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            content: Value::Null,
            kind: EnvelopeKind::Response {
                correlation_id,
                failure: Some(failure),
            },
        }
    }

    /// Application-chosen type tag.
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Opaque payload.
    #[must_use]
    pub const fn content(&self) -> &Value {
        &self.content
    }

    /// Payload as a string, when it is one.
    #[must_use]
    pub fn string_content(&self) -> Option<&str> {
        self.content.as_str()
    }

    /// Payload as an integer, when it is one.
    #[must_use]
    pub fn integer_content(&self) -> Option<i64> {
        self.content.as_i64()
    }

    /// Wire classification.
    #[must_use]
    pub const fn kind(&self) -> &EnvelopeKind {
        &self.kind
    }

    /// Whether the envelope belongs to a request/response exchange.
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        !matches!(self.kind, EnvelopeKind::Message)
    }

    /// Correlation identifier of a request or response.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self.kind {
            EnvelopeKind::Message => None,
            EnvelopeKind::Request { correlation_id }
            | EnvelopeKind::Response { correlation_id, .. } => Some(correlation_id),
        }
    }

    /// Remote failure carried by a response.
    #[must_use]
    pub const fn failure(&self) -> Option<&RemoteFailure> {
        match &self.kind {
            EnvelopeKind::Response { failure, .. } => failure.as_ref(),
            EnvelopeKind::Message | EnvelopeKind::Request { .. } => None,
        }
    }

    /// Splits the envelope into its type tag, payload, and kind.
    #[must_use]
    pub fn into_parts(self) -> (String, Value, EnvelopeKind) {
        (self.message_type, self.content, self.kind)
    }
}
