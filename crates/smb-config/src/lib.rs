//! Shared configuration for the smb message bus.
//!
//! Configuration is layered with `ortho_config`: built-in defaults are
//! overridden by a TOML file named via `--config-path`, then by `SMB_*`
//! environment variables, and finally by command-line flags. Both ends of a
//! connection read the same structure so that timeouts, frame limits and
//! logging behave identically on the controller and the agent.

mod defaults;
mod endpoint;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_AGENT_PORT, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_LISTEN_HOST,
    DEFAULT_LOG_FILTER, DEFAULT_MAX_FRAME_BYTES, DEFAULT_WORKER_THREADS, default_agent_endpoint,
    default_listen_host, default_log_filter, default_log_filter_string, default_log_format,
};
pub use endpoint::{Endpoint, EndpointParseError};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved configuration for a message bus peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SMB")]
pub struct Config {
    /// Endpoint dialled when the controller connects to an agent.
    #[ortho_config(default = default_agent_endpoint())]
    pub agent: Endpoint,
    /// Host bound when waiting for an agent to dial back.
    #[ortho_config(default = default_listen_host())]
    pub listen_host: String,
    /// `tracing` filter expression applied to the global subscriber.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format of the global subscriber.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Timeout applied to synchronous calls that do not name one.
    #[ortho_config(default = DEFAULT_CALL_TIMEOUT_MS)]
    pub call_timeout_ms: u64,
    /// Timeout applied when dialling a TCP peer.
    #[ortho_config(default = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,
    /// Number of threads running listener and handler callbacks.
    #[ortho_config(default = DEFAULT_WORKER_THREADS)]
    pub worker_threads: usize,
    /// Largest frame accepted from or written to the wire.
    #[ortho_config(default = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: default_agent_endpoint(),
            listen_host: default_listen_host(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            worker_threads: DEFAULT_WORKER_THREADS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments and environment.
    ///
    /// # Errors
    ///
    /// Returns the aggregated loader error when a layer fails to parse.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        Self::load_from_iter(std::env::args_os())
    }

    /// Loads configuration from an explicit argument list.
    ///
    /// The first item is treated as the program name, as with
    /// [`std::env::args_os`].
    ///
    /// # Errors
    ///
    /// Returns the aggregated loader error when a layer fails to parse.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Endpoint dialled when connecting to an agent.
    #[must_use]
    pub const fn agent(&self) -> &Endpoint {
        &self.agent
    }

    /// Host bound when waiting for an inbound connection.
    #[must_use]
    pub fn listen_host(&self) -> &str {
        self.listen_host.as_str()
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Default timeout for synchronous calls.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Timeout for dialling a TCP peer.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Worker pool size, never lower than one.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }

    /// Upper bound for a single encoded frame.
    #[must_use]
    pub const fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}
