//! Connection establishment in either direction.
//!
//! The controller either dials a known endpoint or binds an ephemeral port,
//! publishes it out of band, and waits for the agent to dial back. Both
//! paths end with exactly one [`Router`] owning the connected stream.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use smb_config::Endpoint;

use crate::errors::{ConnectionError, WaitError};
use crate::router::{Router, RouterOptions};
use crate::transport::ConnectionStream;

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(unix)]
use socket2::{Domain, SockAddr, Socket, Type};

const CONNECTION_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::connection");
const ACCEPT_THREAD_NAME: &str = "smb-accept";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

/// Dials `endpoint` and starts a router on the connected stream.
///
/// # Errors
///
/// Returns [`ConnectionError`] when the endpoint cannot be resolved or
/// reached, or the router cannot be started.
pub fn dial(endpoint: &Endpoint, options: &RouterOptions) -> Result<Router, ConnectionError> {
    let stream = match endpoint {
        Endpoint::Tcp { host, port } => {
            connect_tcp(host, *port, options.connect_timeout()).map(ConnectionStream::Tcp)?
        }
        Endpoint::Unix { path } => {
            #[cfg(unix)]
            {
                connect_unix(path.as_str(), options.connect_timeout())
                    .map(ConnectionStream::Unix)
                    .map_err(|source| ConnectionError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    })?
            }

            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(ConnectionError::UnsupportedUnix {
                    endpoint: endpoint.to_string(),
                });
            }
        }
    };
    info!(
        target: CONNECTION_TARGET,
        endpoint = %endpoint,
        "connected to peer"
    );
    Router::start(stream, options)
}

/// Dials a TCP peer by host and port.
///
/// # Errors
///
/// See [`dial`].
pub fn connect(host: &str, port: u16, options: &RouterOptions) -> Result<Router, ConnectionError> {
    dial(&Endpoint::tcp(host, port), options)
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let endpoint = Endpoint::tcp(host, port).to_string();
    let addresses: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectionError::Resolve {
            endpoint: endpoint.clone(),
            source,
        })?
        .collect();
    if addresses.is_empty() {
        return Err(ConnectionError::ResolveEmpty { endpoint });
    }

    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                if let Err(error) = stream.set_nodelay(true) {
                    debug!(
                        target: CONNECTION_TARGET,
                        error = %error,
                        "failed to disable Nagle's algorithm"
                    );
                }
                return Ok(stream);
            }
            Err(error) => {
                debug!(
                    target: CONNECTION_TARGET,
                    address = %address,
                    error = %error,
                    "connection attempt failed"
                );
                last_error = Some(error);
            }
        }
    }
    Err(ConnectionError::Connect {
        endpoint,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address")),
    })
}

#[cfg(unix)]
fn connect_unix(path: &str, timeout: Duration) -> io::Result<UnixStream> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, timeout)?;
    Ok(UnixStream::from(OwnedFd::from(socket)))
}

#[derive(Default)]
struct AcceptSlot {
    router: Mutex<Option<Router>>,
    ready: Condvar,
}

/// Listening socket waiting for exactly one inbound connection.
///
/// The port is bound and published before the peer is asked to dial back.
/// A background thread accepts the first connection, builds its router, and
/// closes the listening socket. Dropping the handle stops that thread.
pub struct IncomingConnection {
    local_addr: SocketAddr,
    slot: Arc<AcceptSlot>,
    shutdown: Arc<AtomicBool>,
}

impl IncomingConnection {
    /// Binds an ephemeral port on the configured listen host and starts
    /// accepting.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the host cannot be bound or the
    /// accept thread cannot be started.
    pub fn prepare(options: &RouterOptions) -> Result<Self, ConnectionError> {
        let host = options.listen_host();
        let bind_error = |source: io::Error| ConnectionError::Bind {
            host: host.to_owned(),
            source,
        };
        let listener = TcpListener::bind((host, 0)).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        let slot = Arc::new(AcceptSlot::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_slot = Arc::clone(&slot);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_options = options.clone();
        thread::Builder::new()
            .name(ACCEPT_THREAD_NAME.to_owned())
            .spawn(move || {
                accept_once(&listener, &thread_shutdown, &thread_slot, &thread_options);
            })
            .map_err(|source| ConnectionError::Spawn { source })?;

        info!(
            target: CONNECTION_TARGET,
            address = %local_addr,
            "waiting for inbound connection"
        );
        Ok(Self {
            local_addr,
            slot,
            shutdown,
        })
    }

    /// Port the peer should dial.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Full address of the listening socket.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks until the peer connects or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] when no connection was established in
    /// time, including when the accept itself failed.
    pub fn wait_for_connection(&self, timeout: Duration) -> Result<Router, WaitError> {
        let locked = self
            .slot
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut accepted, _) = self
            .slot
            .ready
            .wait_timeout_while(locked, timeout, |router| router.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        accepted.take().ok_or(WaitError::Timeout { timeout })
    }
}

impl Drop for IncomingConnection {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn accept_once(
    listener: &TcpListener,
    shutdown: &AtomicBool,
    slot: &AcceptSlot,
    options: &RouterOptions,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, address)) => {
                debug!(
                    target: CONNECTION_TARGET,
                    peer = %address,
                    "accepted inbound connection"
                );
                let connection = ConnectionStream::Tcp(stream);
                let started = connection
                    .set_nonblocking(false)
                    .map_err(|source| ConnectionError::Configure {
                        endpoint: address.to_string(),
                        source,
                    })
                    .and_then(|()| Router::start(connection, options));
                match started {
                    Ok(router) => {
                        *slot.router.lock().unwrap_or_else(PoisonError::into_inner) = Some(router);
                        slot.ready.notify_all();
                    }
                    Err(error) => warn!(
                        target: CONNECTION_TARGET,
                        error = %error,
                        "failed to start router for inbound connection"
                    ),
                }
                return;
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(error) => {
                warn!(
                    target: CONNECTION_TARGET,
                    error = %error,
                    "accept failed; no connection will be established"
                );
                return;
            }
        }
    }
    debug!(target: CONNECTION_TARGET, "accept abandoned");
}
