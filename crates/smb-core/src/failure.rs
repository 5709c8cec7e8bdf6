//! Transport-safe representation of failures raised by remote handlers.
//!
//! A handler failure cannot cross the wire as a live error value, so the
//! serving side flattens it into a [`RemoteFailure`] chain: the reported type
//! name, the message, the captured stack lines, and the same information for
//! every error reachable through [`Error::source`]. The calling side receives
//! the chain as a single error value whose `source()` walks the reconstructed
//! causes.

use std::any::{self, Any};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Boxed error type accepted from listener callbacks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

const FALLBACK_TYPE_NAME: &str = "Error";
const IO_ERROR_TYPE_NAME: &str = "std::io::Error";
const NON_STRING_PANIC: &str = "non-string panic payload";

/// Failure returned by a synchronous handler.
///
/// Any error type converts into a `HandlerFailure` through `?`, recording the
/// concrete type name at the conversion site so the remote side can report
/// what actually went wrong.
pub struct HandlerFailure {
    type_name: String,
    error: BoxError,
}

impl HandlerFailure {
    /// Wraps a concrete error, recording its type name.
    #[must_use]
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            type_name: any::type_name::<E>().to_owned(),
            error: Box::new(error),
        }
    }

    /// Converts a panic payload caught around a handler into a failure.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(HandlerPanic(panic_message(payload)))
    }

    /// Reported type name of the wrapped error.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Borrow the wrapped error.
    #[must_use]
    pub fn error(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.error.as_ref()
    }
}

impl<E> From<E> for HandlerFailure
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for HandlerFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HandlerFailure")
            .field("type_name", &self.type_name)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.type_name, self.error)
    }
}

/// Error recorded when a handler panics instead of returning.
#[derive(Debug, thiserror::Error)]
#[error("handler panicked: {0}")]
pub struct HandlerPanic(String);

/// Serialisable failure chain raised by a remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    origin_type: String,
    message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stack_trace: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<RemoteFailure>>,
}

impl RemoteFailure {
    /// Builds a failure with no stack trace and no cause.
    #[must_use]
    pub fn new(origin_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin_type: origin_type.into(),
            message: message.into(),
            stack_trace: Vec::new(),
            cause: None,
        }
    }

    /// Attaches a cause to the failure.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attaches stack lines to the failure.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    /// Flattens a handler failure and its `source()` chain.
    ///
    /// A handler that forwards a [`RemoteFailure`] it received from a further
    /// peer keeps the original chain intact.
    ///
    /// Stack lines are recorded only when backtraces are enabled for the
    /// process (`RUST_BACKTRACE` or `RUST_LIB_BACKTRACE`). They are captured
    /// here, on the worker that wraps the failure after the handler returned,
    /// so they show where the failure was converted rather than where the
    /// handler error was raised. Causes carry no stack lines.
    #[must_use]
    pub fn capture(failure: &HandlerFailure) -> Self {
        let error = failure.error();
        if let Some(remote) = error.downcast_ref::<Self>() {
            return remote.clone();
        }
        Self {
            origin_type: failure.type_name().to_owned(),
            message: error.to_string(),
            stack_trace: capture_stack_trace(),
            cause: error.source().map(|source| Box::new(Self::from_error(source))),
        }
    }

    /// Flattens an arbitrary error and its `source()` chain.
    #[must_use]
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        if let Some(remote) = error.downcast_ref::<Self>() {
            return remote.clone();
        }
        Self {
            origin_type: reported_type_name(error),
            message: error.to_string(),
            stack_trace: Vec::new(),
            cause: error.source().map(|source| Box::new(Self::from_error(source))),
        }
    }

    /// Type name reported by the failing side.
    #[must_use]
    pub fn origin_type(&self) -> &str {
        &self.origin_type
    }

    /// Message reported by the failing side.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack lines captured on the failing side, if any.
    #[must_use]
    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }

    /// Next failure in the chain.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }

    /// Iterates over this failure and every cause below it.
    pub fn chain(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |failure| Self::cause(failure))
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.origin_type, self.message)
    }
}

impl Error for RemoteFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

fn capture_stack_trace() -> Vec<String> {
    let backtrace = Backtrace::capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    backtrace
        .to_string()
        .lines()
        .map(|line| line.trim_end().to_owned())
        .collect()
}

fn reported_type_name(error: &(dyn Error + 'static)) -> String {
    if error.is::<io::Error>() {
        return IO_ERROR_TYPE_NAME.to_owned();
    }
    if error.is::<HandlerPanic>() {
        return any::type_name::<HandlerPanic>().to_owned();
    }
    let rendered = format!("{error:?}");
    let identifier: String = rendered
        .chars()
        .take_while(|character| character.is_alphanumeric() || *character == '_')
        .collect();
    if identifier.is_empty() {
        FALLBACK_TYPE_NAME.to_owned()
    } else {
        identifier
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| NON_STRING_PANIC.to_owned())
}
