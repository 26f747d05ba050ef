//! Engine error types and resource identifiers.

use std::fmt;
use thiserror::Error;

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to reach the engine.
    #[error("failed to connect to container engine: {0}")]
    ConnectionFailed(String),

    /// Container or network not found.
    #[error("resource not found: {id}")]
    NotFound {
        /// Container or network ID.
        id: String,
    },

    /// Image not found.
    #[error("image not found: {image}")]
    ImageNotFound {
        /// Image reference.
        image: String,
    },

    /// A resource with the same name already exists.
    #[error("resource already exists: {0}")]
    Conflict(String),

    /// Container creation failed.
    #[error("container creation failed: {0}")]
    CreateFailed(String),

    /// Container start failed.
    #[error("container start failed: {id}: {reason}")]
    StartFailed {
        /// Container ID.
        id: String,
        /// Failure reason.
        reason: String,
    },

    /// Container stop failed.
    #[error("container stop failed: {id}: {reason}")]
    StopFailed {
        /// Container ID.
        id: String,
        /// Failure reason.
        reason: String,
    },

    /// Container or network removal failed.
    #[error("remove failed: {id}: {reason}")]
    RemoveFailed {
        /// Container or network ID.
        id: String,
        /// Failure reason.
        reason: String,
    },

    /// File upload into a container failed.
    #[error("copy into container failed: {id}: {reason}")]
    CopyFailed {
        /// Container ID.
        id: String,
        /// Failure reason.
        reason: String,
    },

    /// Command execution inside a container failed.
    #[error("exec failed: {id}: {reason}")]
    ExecFailed {
        /// Container ID.
        id: String,
        /// Failure reason.
        reason: String,
    },

    /// Network operation failed.
    #[error("network operation failed: {0}")]
    Network(String),

    /// Invalid request.
    #[error("invalid engine request: {0}")]
    InvalidConfig(String),

    /// Operation timeout.
    #[error("engine operation timed out after {seconds} seconds")]
    Timeout {
        /// Timeout duration in seconds.
        seconds: u64,
    },

    /// Internal engine error.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error means the target no longer exists.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Container ID wrapper for type safety.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a new container ID from a string.
    ///
    /// # Errors
    ///
    /// Returns error if ID is empty or contains invalid characters.
    pub fn new(id: impl Into<String>) -> EngineResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(EngineError::InvalidConfig(
                "container ID cannot be empty".to_string(),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(EngineError::InvalidConfig(format!(
                "invalid container ID: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Create a container ID without validation (IDs handed back by an engine).
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the short form (first 12 chars) of the container ID.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Network ID as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(String);

impl NetworkId {
    /// Wrap an engine-issued network ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}
