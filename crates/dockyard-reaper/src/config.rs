//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use dockyard::reaper::REAPER_PORT;

/// Default delay between a client disconnecting and its resources being swept.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default time to wait for the first client before exiting.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle time (no clients, no pending sweeps) before exiting.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for the reaper server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Time a filter stays registered after its last connection closes.
    /// A client reconnecting within this window cancels the sweep.
    pub grace_period: Duration,
    /// Exit if no client connects within this time.
    pub connection_timeout: Duration,
    /// Exit after being idle this long.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// Configuration listening on `listen` with default timeouts.
    #[must_use]
    pub const fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            grace_period: DEFAULT_GRACE_PERIOD,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the first-connection timeout.
    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle shutdown timeout.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message if any timeout is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.connection_timeout.is_zero() {
            return Err("connection_timeout must be greater than 0".to_string());
        }
        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            REAPER_PORT,
        ))
    }
}
