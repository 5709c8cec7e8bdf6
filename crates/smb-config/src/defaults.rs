use crate::endpoint::Endpoint;
use crate::logging::LogFormat;

/// Default TCP port an agent listens on when none is configured.
pub const DEFAULT_AGENT_PORT: u16 = 9780;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default timeout, in milliseconds, applied to synchronous calls.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

/// Default timeout, in milliseconds, applied when dialling a TCP peer.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default number of worker threads running listener callbacks.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default upper bound for a single encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default host the controller binds when waiting for an agent to dial back.
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Default log filter expression used by the binaries.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default agent endpoint dialled by the controller.
#[must_use]
pub fn default_agent_endpoint() -> Endpoint {
    Endpoint::tcp("127.0.0.1", DEFAULT_AGENT_PORT)
}

/// Owned listen host used where allocation is required (e.g. serde).
#[must_use]
pub fn default_listen_host() -> String {
    DEFAULT_LISTEN_HOST.to_owned()
}
