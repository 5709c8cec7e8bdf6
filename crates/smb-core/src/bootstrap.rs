//! Peer bootstrap: configuration, telemetry, and connection defaults.

use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;

use smb_config::Config;

use crate::connection::{self, IncomingConnection};
use crate::errors::ConnectionError;
use crate::observer::{ConnectionObserver, StructuredConnectionReporter};
use crate::router::{Router, RouterOptions};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the peer configuration.
    ///
    /// # Errors
    ///
    /// Returns the aggregated loader error when a layer fails to parse.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already resolved configuration.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
}

/// Bootstrapped peer ready to open connections.
#[derive(Debug)]
pub struct Bus {
    config: Config,
    options: RouterOptions,
    telemetry: TelemetryHandle,
}

impl Bus {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Router options derived from the configuration.
    #[must_use]
    pub const fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Dials the configured agent endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the agent cannot be reached.
    pub fn dial_agent(&self) -> Result<Router, ConnectionError> {
        connection::dial(self.config.agent(), &self.options)
    }

    /// Binds an ephemeral port and waits for an agent to dial back.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the listen host cannot be bound.
    pub fn listen(&self) -> Result<IncomingConnection, ConnectionError> {
        IncomingConnection::prepare(&self.options)
    }
}

/// Bootstraps a peer from process arguments and environment.
///
/// # Errors
///
/// See [`bootstrap_with`].
pub fn bootstrap() -> Result<Bus, BootstrapError> {
    bootstrap_with(&SystemConfigLoader, Arc::new(StructuredConnectionReporter::new()))
}

/// Bootstraps a peer using the supplied collaborators.
///
/// # Errors
///
/// Returns [`BootstrapError`] when configuration fails to load or telemetry
/// cannot be installed.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    observer: Arc<dyn ConnectionObserver>,
) -> Result<Bus, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    let options = RouterOptions::from_config(&config).with_observer(observer);
    tracing::info!(
        target: concat!(env!("CARGO_CRATE_NAME"), "::bootstrap"),
        agent = %config.agent(),
        worker_threads = options.worker_threads(),
        call_timeout_ms = config.call_timeout_ms,
        "message bus bootstrapped"
    );
    Ok(Bus {
        config,
        options,
        telemetry,
    })
}
