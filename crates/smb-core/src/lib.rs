//! Bidirectional message bus over a single stream socket.
//!
//! A controller and a remote agent share one persistent connection and use
//! it in three ways: fire-and-forget messages, synchronous request/response
//! calls matched by correlation identifier, and interface-shaped remote
//! procedure calls layered on the synchronous mode. Either side may dial the
//! other, or the controller may bind an ephemeral port and wait for the
//! agent to dial back.
//!
//! Each connection is owned by a [`Router`]. A dedicated dispatch thread
//! reads envelopes in arrival order; listener and handler callbacks run on a
//! small worker pool so a slow callback never stalls the connection.
//! Failures raised by remote handlers travel back as [`RemoteFailure`]
//! chains and surface to callers as [`CallError::Remote`].
//!
//! Configuration comes from [`smb_config::Config`], and [`bootstrap()`] wires
//! it into structured telemetry and router defaults.

mod bootstrap;
pub mod codec;
mod connection;
mod correlation;
mod envelope;
mod errors;
mod failure;
mod observer;
mod pool;
mod registry;
mod router;
pub mod rpc;
pub mod telemetry;
mod transport;

pub use bootstrap::{
    BootstrapError, Bus, ConfigLoader, StaticConfigLoader, SystemConfigLoader, bootstrap,
    bootstrap_with,
};
pub use codec::{Codec, CodecError, FramedJsonCodec};
pub use connection::{IncomingConnection, connect, dial};
pub use envelope::{CorrelationId, Envelope, EnvelopeKind};
pub use errors::{CallError, ConnectionError, RegistrationError, TransportError, WaitError};
pub use failure::{BoxError, HandlerFailure, HandlerPanic, RemoteFailure};
pub use observer::{ConnectionObserver, DisconnectReason, StructuredConnectionReporter};
pub use registry::{ListenerError, MessageListener, SynchronousHandler};
pub use router::{ConnectionState, Router, RouterOptions};
pub use rpc::{
    InterfaceContract, InterfaceContractBuilder, InterfaceImplementation, MethodSignature, Proxy,
    RpcDispatchError, ValueShape,
};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use transport::ConnectionStream;

#[cfg(test)]
mod tests;
