//! Error types surfaced by the message bus.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::failure::RemoteFailure;

/// Errors raised while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Host name resolution failed.
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        /// Endpoint being resolved.
        endpoint: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },
    /// Resolution succeeded but yielded no addresses.
    #[error("no addresses resolved for {endpoint}")]
    ResolveEmpty {
        /// Endpoint being resolved.
        endpoint: String,
    },
    /// Every resolved address refused or timed out.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint being dialled.
        endpoint: String,
        /// Error reported for the last attempted address.
        #[source]
        source: io::Error,
    },
    /// The listening socket could not be bound.
    #[error("failed to bind listener on {host}: {source}")]
    Bind {
        /// Host being bound.
        host: String,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },
    /// The connected socket could not be configured for use.
    #[error("failed to configure connection to {endpoint}: {source}")]
    Configure {
        /// Peer the socket is connected to.
        endpoint: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// The dispatch thread could not be started.
    #[error("failed to start dispatch thread: {source}")]
    Spawn {
        /// Underlying thread builder error.
        #[source]
        source: io::Error,
    },
    /// Unix domain sockets are not available on this platform.
    #[cfg(not(unix))]
    #[error("unix domain sockets are not supported on this platform: {endpoint}")]
    UnsupportedUnix {
        /// Requested endpoint.
        endpoint: String,
    },
}

/// Errors raised while writing to an established connection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The stream failed mid-write.
    #[error("transport write failed: {0}")]
    Io(Arc<io::Error>),
    /// The envelope could not be framed.
    #[error("failed to encode envelope: {0}")]
    Codec(Arc<CodecError>),
    /// The connection has already been closed.
    #[error("connection is closed")]
    Closed,
}

impl From<CodecError> for TransportError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io(source) => Self::Io(Arc::new(source)),
            other => Self::Codec(Arc::new(other)),
        }
    }
}

impl TransportError {
    /// Whether the failure means the stream itself is unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed)
    }
}

/// Errors raised by synchronous calls.
#[derive(Debug, Error)]
pub enum CallError {
    /// No response arrived within the timeout.
    #[error("timeout occurred while calling {message_type} after {timeout:?}")]
    Timeout {
        /// Message type of the unanswered request.
        message_type: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The remote handler failed.
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteFailure),
    /// The request could not be written.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A proxy was asked to invoke a method its contract does not declare.
    #[error("interface {interface} declares no method named {method}")]
    UnknownMethod {
        /// Qualified interface name.
        interface: String,
        /// Requested method name.
        method: String,
    },
    /// The result could not be converted into the requested type.
    #[error("failed to decode result of {message_type}: {source}")]
    Decode {
        /// Message type of the call.
        message_type: String,
        /// Underlying conversion error.
        #[source]
        source: serde_json::Error,
    },
}

impl CallError {
    /// Whether the call ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Remote failure carried by the error, if any.
    #[must_use]
    pub const fn remote_failure(&self) -> Option<&RemoteFailure> {
        match self {
            Self::Remote(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Errors raised when registering callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A synchronous handler is already registered for the message type.
    #[error("a synchronous handler is already registered for {message_type}")]
    DuplicateHandler {
        /// Message type already claimed.
        message_type: String,
    },
}

/// Errors raised while waiting for an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// No peer connected within the timeout.
    #[error("no inbound connection within {timeout:?}")]
    Timeout {
        /// Timeout that elapsed.
        timeout: Duration,
    },
}
