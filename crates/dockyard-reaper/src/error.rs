//! Error types for the reaper server.

use std::net::SocketAddr;

use dockyard::engine::EngineError;
use thiserror::Error;

/// Errors that can occur in the reaper server.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Invalid server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine rejected a sweep request.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result type for reaper server operations.
pub type ReaperResult<T> = Result<T, ReaperError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_bind_failed_error_display() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = ReaperError::BindFailed(addr, io_err);

        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:8080"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_engine_error_is_transparent() {
        let err = ReaperError::from(EngineError::ConnectionFailed("daemon down".to_string()));
        assert!(err.to_string().contains("daemon down"));
    }
}
