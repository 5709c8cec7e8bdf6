//! Per-connection router.
//!
//! A [`Router`] owns one connected stream. A dedicated dispatch thread reads
//! envelopes in arrival order and classifies each one:
//!
//! - responses complete the matching pending call, or are dropped when the
//!   caller already gave up;
//! - requests run the registered synchronous handler on the worker pool,
//!   which always writes exactly one response;
//! - messages fan out to every type-specific and catch-all listener on the
//!   worker pool.
//!
//! All writes share one mutex-guarded writer so frames never interleave.

use std::fmt;
use std::io::{self, BufReader, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{Span, debug, info, warn};

use smb_config::Config;

use crate::codec::{Codec, CodecError, FramedJsonCodec};
use crate::correlation::{CallOutcome, CorrelationTable};
use crate::envelope::{CorrelationId, Envelope, EnvelopeKind};
use crate::errors::{CallError, ConnectionError, RegistrationError, TransportError};
use crate::failure::{HandlerFailure, RemoteFailure};
use crate::observer::{ConnectionObserver, DisconnectReason, StructuredConnectionReporter};
use crate::pool::WorkerPool;
use crate::registry::{HandlerRegistry, ListenerRegistry, MessageListener, SynchronousHandler};
use crate::telemetry::connection_span;
use crate::transport::ConnectionStream;

const ROUTER_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::router");
const DISPATCH_THREAD_NAME: &str = "smb-dispatch";
const WORKER_THREAD_PREFIX: &str = "smb";

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// Lifecycle state of a connection.
///
/// Moves to `Disconnected` exactly once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The router is being set up.
    Connecting,
    /// The dispatch loop is running.
    Connected,
    /// The connection has ended.
    Disconnected,
}

impl ConnectionState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_CONNECTING => Self::Connecting,
            STATE_CONNECTED => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Settings applied to every router built by a connection helper.
#[derive(Clone)]
pub struct RouterOptions {
    worker_threads: usize,
    call_timeout: Duration,
    connect_timeout: Duration,
    listen_host: String,
    codec: Arc<dyn Codec>,
    observer: Arc<dyn ConnectionObserver>,
}

impl RouterOptions {
    /// Derives options from resolved configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_threads: config.worker_threads(),
            call_timeout: config.call_timeout(),
            connect_timeout: config.connect_timeout(),
            listen_host: config.listen_host().to_owned(),
            codec: Arc::new(FramedJsonCodec::new(config.max_frame_bytes())),
            observer: Arc::new(StructuredConnectionReporter::new()),
        }
    }

    /// Replaces the connection observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replaces the envelope codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Overrides the default call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Overrides the worker pool size; zero is raised to one.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Number of worker threads per router.
    #[must_use]
    pub const fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Timeout used by [`Router::call_default`].
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Timeout applied when dialling a TCP peer.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Host bound when waiting for an inbound connection.
    #[must_use]
    pub fn listen_host(&self) -> &str {
        &self.listen_host
    }
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl fmt::Debug for RouterOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RouterOptions")
            .field("worker_threads", &self.worker_threads)
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("listen_host", &self.listen_host)
            .finish_non_exhaustive()
    }
}

/// Handle to one live connection.
///
/// Clones share the connection. Dropping the last handle closes it.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    peer: String,
    span: Span,
    codec: Arc<dyn Codec>,
    call_timeout: Duration,
    writer: Mutex<BufWriter<ConnectionStream>>,
    control: ConnectionStream,
    correlations: CorrelationTable,
    listeners: ListenerRegistry,
    handlers: HandlerRegistry,
    pool: WorkerPool,
    state: AtomicU8,
    observer: Arc<dyn ConnectionObserver>,
}

impl Router {
    /// Takes ownership of a connected stream and starts its dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the stream cannot be duplicated or
    /// the router threads cannot be spawned.
    pub fn start(stream: ConnectionStream, options: &RouterOptions) -> Result<Self, ConnectionError> {
        let peer = stream.peer_description();
        let configure = |source: io::Error| ConnectionError::Configure {
            endpoint: peer.clone(),
            source,
        };
        let reader = stream.try_clone().map_err(configure)?;
        let control = stream.try_clone().map_err(configure)?;
        let pool = WorkerPool::start(WORKER_THREAD_PREFIX, options.worker_threads)
            .map_err(|source| ConnectionError::Spawn { source })?;
        let span = connection_span(&peer);

        let inner = Arc::new(RouterInner {
            peer: peer.clone(),
            span: span.clone(),
            codec: Arc::clone(&options.codec),
            call_timeout: options.call_timeout,
            writer: Mutex::new(BufWriter::new(stream)),
            control,
            correlations: CorrelationTable::new(),
            listeners: ListenerRegistry::new(),
            handlers: HandlerRegistry::new(),
            pool,
            state: AtomicU8::new(STATE_CONNECTING),
            observer: Arc::clone(&options.observer),
        });

        let weak = Arc::downgrade(&inner);
        let codec = Arc::clone(&options.codec);
        inner.state.store(STATE_CONNECTED, Ordering::SeqCst);
        inner.observer.connected(&peer);
        thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_owned())
            .spawn(move || {
                span.in_scope(|| run_dispatch_loop(&weak, BufReader::new(reader), codec.as_ref()));
            })
            .map_err(|source| ConnectionError::Spawn { source })?;

        inner.span.in_scope(|| info!(target: ROUTER_TARGET, "router started"));
        Ok(Self { inner })
    }

    /// Description of the remote end.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Closes the connection.
    ///
    /// Idempotent. Pending calls are left to their own timeouts.
    pub fn close(&self) {
        self.inner.disconnect(DisconnectReason::Closed);
    }

    /// Sends a fire-and-forget message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the envelope cannot be written.
    pub fn send_message(
        &self,
        message_type: &str,
        content: Value,
    ) -> Result<(), TransportError> {
        self.inner.write(&Envelope::message(message_type, content))
    }

    /// Sends a message with no content.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the envelope cannot be written.
    pub fn send_signal(&self, message_type: &str) -> Result<(), TransportError> {
        self.send_message(message_type, Value::Null)
    }

    /// Sends a request and blocks until its response arrives or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// - [`CallError::Remote`] when the remote handler failed.
    /// - [`CallError::Timeout`] when no response arrived in time, including
    ///   when the connection was lost while waiting.
    /// - [`CallError::Transport`] when the request could not be written.
    pub fn call(
        &self,
        message_type: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let correlations = &self.inner.correlations;
        let (correlation_id, completion) = correlations.register(message_type);
        let request = Envelope::request(message_type, content, correlation_id);
        if let Err(error) = self.inner.write(&request) {
            correlations.abandon(correlation_id);
            return Err(CallError::Transport(error));
        }

        match completion.recv_timeout(timeout) {
            Ok(CallOutcome::Completed(value)) => Ok(value),
            Ok(CallOutcome::Failed(failure)) => Err(CallError::Remote(failure)),
            Err(_) => {
                correlations.abandon(correlation_id);
                debug!(
                    target: ROUTER_TARGET,
                    message_type,
                    correlation_id = %correlation_id,
                    "call timed out"
                );
                Err(CallError::Timeout {
                    message_type: message_type.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Sends a request using the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`Router::call`].
    pub fn call_default(&self, message_type: &str, content: Value) -> Result<Value, CallError> {
        self.call(message_type, content, self.inner.call_timeout)
    }

    /// Sends a request and decodes the result into `T`.
    ///
    /// # Errors
    ///
    /// See [`Router::call`]; additionally [`CallError::Decode`] when the
    /// result does not fit `T`.
    pub fn call_as<T>(
        &self,
        message_type: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<T, CallError>
    where
        T: DeserializeOwned,
    {
        let value = self.call(message_type, content, timeout)?;
        serde_json::from_value(value).map_err(|source| CallError::Decode {
            message_type: message_type.to_owned(),
            source,
        })
    }

    /// Adds a listener for messages of `message_type`.
    pub fn register_permanent_listener(
        &self,
        message_type: &str,
        listener: Arc<dyn MessageListener>,
    ) {
        self.inner.listeners.register(message_type, listener);
    }

    /// Adds a listener for every message.
    pub fn register_permanent_listener_for_all_messages(&self, listener: Arc<dyn MessageListener>) {
        self.inner.listeners.register_for_all(listener);
    }

    /// Removes the first registration of `listener` for `message_type`.
    pub fn unregister_permanent_listener(
        &self,
        message_type: &str,
        listener: &Arc<dyn MessageListener>,
    ) -> bool {
        self.inner.listeners.unregister(message_type, listener)
    }

    /// Removes the first catch-all registration of `listener`.
    pub fn unregister_permanent_listener_for_all_messages(
        &self,
        listener: &Arc<dyn MessageListener>,
    ) -> bool {
        self.inner.listeners.unregister_for_all(listener)
    }

    /// Registers the handler answering requests of `message_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateHandler`] when a handler is
    /// already registered; the existing one stays active.
    pub fn register_synchronous_handler<H>(
        &self,
        message_type: &str,
        handler: H,
    ) -> Result<(), RegistrationError>
    where
        H: SynchronousHandler + 'static,
    {
        self.inner.handlers.register(message_type, Arc::new(handler))
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Router")
            .field("peer", &self.inner.peer)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl RouterInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::SeqCst))
    }

    fn write(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(TransportError::Closed);
        }
        let written = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            self.codec
                .write_envelope(&mut *writer, envelope)
                .and_then(|()| writer.flush().map_err(CodecError::from))
        };
        written.map_err(|codec_error| {
            let error = TransportError::from(codec_error);
            if error.is_fatal() {
                self.disconnect(DisconnectReason::Transport(error.to_string()));
            }
            error
        })
    }

    /// Writes a handler's response, replacing it with a failure when the
    /// response itself cannot be framed so the caller is never left waiting.
    fn send_response(&self, correlation_id: CorrelationId, response: &Envelope) {
        let unframed = match self.write(response) {
            Ok(()) => return,
            Err(TransportError::Codec(codec_error)) => codec_error,
            Err(error) => {
                debug!(
                    target: ROUTER_TARGET,
                    message_type = response.message_type(),
                    correlation_id = %correlation_id,
                    error = %error,
                    "failed to send response"
                );
                return;
            }
        };
        warn!(
            target: ROUTER_TARGET,
            message_type = response.message_type(),
            correlation_id = %correlation_id,
            error = %unframed,
            "response could not be framed; reporting failure to caller"
        );
        let failure = RemoteFailure::from_error(&*unframed);
        let fallback = Envelope::failed_response(response.message_type(), correlation_id, failure);
        if let Err(error) = self.write(&fallback) {
            debug!(
                target: ROUTER_TARGET,
                message_type = response.message_type(),
                correlation_id = %correlation_id,
                error = %error,
                "failed to send failure response"
            );
        }
    }

    fn disconnect(&self, reason: DisconnectReason) {
        if self.state.swap(STATE_DISCONNECTED, Ordering::SeqCst) == STATE_DISCONNECTED {
            return;
        }
        let _entered = self.span.enter();
        if let Err(error) = self.control.shutdown()
            && error.kind() != io::ErrorKind::NotConnected
        {
            debug!(target: ROUTER_TARGET, error = %error, "socket shutdown failed");
        }
        self.pool.shutdown();
        info!(
            target: ROUTER_TARGET,
            reason = %reason,
            pending_calls = self.correlations.len(),
            "router disconnected"
        );
        self.observer.disconnected(&self.peer, &reason);
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope.kind() {
            EnvelopeKind::Response { .. } => self.complete_call(envelope),
            EnvelopeKind::Request { correlation_id } => {
                let request_id = *correlation_id;
                self.serve_request(request_id, envelope);
            }
            EnvelopeKind::Message => self.deliver_message(envelope),
        }
    }

    fn complete_call(&self, envelope: Envelope) {
        let (message_type, content, kind) = envelope.into_parts();
        let EnvelopeKind::Response {
            correlation_id,
            failure,
        } = kind
        else {
            return;
        };
        let outcome = failure.map_or(CallOutcome::Completed(content), CallOutcome::Failed);
        if self.correlations.complete(correlation_id, outcome).is_none() {
            debug!(
                target: ROUTER_TARGET,
                message_type = %message_type,
                correlation_id = %correlation_id,
                "dropping response with no pending call"
            );
        }
    }

    fn serve_request(self: &Arc<Self>, correlation_id: CorrelationId, envelope: Envelope) {
        let Some(handler) = self.handlers.handler_for(envelope.message_type()) else {
            debug!(
                target: ROUTER_TARGET,
                message_type = envelope.message_type(),
                correlation_id = %correlation_id,
                "dropping request with no registered handler"
            );
            return;
        };
        let responder = Arc::clone(self);
        let submitted = self.pool.submit(move || {
            responder.span.in_scope(|| {
                let response = answer_request(handler.as_ref(), correlation_id, &envelope);
                responder.send_response(correlation_id, &response);
            });
        });
        if !submitted {
            debug!(
                target: ROUTER_TARGET,
                correlation_id = %correlation_id,
                "worker pool stopped; request not served"
            );
        }
    }

    fn deliver_message(&self, envelope: Envelope) {
        let listeners = self.listeners.listeners_for(envelope.message_type());
        if listeners.is_empty() {
            debug!(
                target: ROUTER_TARGET,
                message_type = envelope.message_type(),
                "no listener for message"
            );
            return;
        }
        let shared = Arc::new(envelope);
        for listener in listeners {
            let delivered = Arc::clone(&shared);
            let span = self.span.clone();
            let submitted = self.pool.submit(move || {
                let _entered = span.enter();
                if let Err(error) = listener.on_message(&delivered) {
                    warn!(
                        target: ROUTER_TARGET,
                        message_type = delivered.message_type(),
                        error = %error,
                        "listener failed"
                    );
                }
            });
            if !submitted {
                return;
            }
        }
    }
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        self.disconnect(DisconnectReason::Closed);
    }
}

fn answer_request(
    handler: &dyn SynchronousHandler,
    correlation_id: CorrelationId,
    request: &Envelope,
) -> Envelope {
    let message_type = request.message_type();
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(request)))
        .unwrap_or_else(|payload| Err(HandlerFailure::from_panic(payload.as_ref())));
    match result {
        Ok(value) => Envelope::response(message_type, value, correlation_id),
        Err(failure) => {
            debug!(
                target: ROUTER_TARGET,
                message_type,
                correlation_id = %correlation_id,
                failure = %failure,
                "handler failed"
            );
            Envelope::failed_response(message_type, correlation_id, RemoteFailure::capture(&failure))
        }
    }
}

fn run_dispatch_loop(
    router: &Weak<RouterInner>,
    mut reader: BufReader<ConnectionStream>,
    codec: &dyn Codec,
) {
    loop {
        let next = codec.read_envelope(&mut reader);
        let Some(inner) = router.upgrade() else {
            return;
        };
        match next {
            Ok(Some(envelope)) => inner.dispatch(envelope),
            Ok(None) => {
                inner.disconnect(DisconnectReason::EndOfStream);
                return;
            }
            Err(error) => {
                inner.disconnect(DisconnectReason::Transport(error.to_string()));
                return;
            }
        }
    }
}
