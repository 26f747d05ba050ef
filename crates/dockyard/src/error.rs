//! Error types for the orchestration layer.

use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum DockyardError {
    /// The container spec was rejected before reaching the engine.
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine refused to create the container.
    #[error("failed to create container from {image}: {source}")]
    CreationFailure {
        /// Image reference.
        image: String,
        /// Underlying engine error.
        source: EngineError,
    },

    /// The container started but exited or vanished before readiness.
    #[error("container {id} is not running after start: state {state}")]
    NotRunning {
        /// Container ID.
        id: String,
        /// Observed engine state.
        state: String,
    },

    /// A readiness strategy ran out of time.
    #[error(
        "container {id} not ready after {elapsed:?} (strategy {strategy}, attempt {attempt}): {detail}"
    )]
    ReadinessTimeout {
        /// Container ID.
        id: String,
        /// Strategy that timed out.
        strategy: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Startup attempt (1-based).
        attempt: u32,
        /// Last observation from the strategy.
        detail: String,
    },

    /// A readiness strategy hit an error it cannot recover from.
    #[error("readiness check {strategy} failed for container {id}: {reason}")]
    ReadinessFailed {
        /// Container ID.
        id: String,
        /// Strategy that failed.
        strategy: String,
        /// Failure reason.
        reason: String,
    },

    /// Every startup attempt failed.
    #[error("container failed to start after {attempts} attempt(s): {last_error}")]
    StartupFailure {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: Box<DockyardError>,
    },

    /// The reaper could not be reached; cleanup after a crash is not guaranteed.
    #[error("reaper unavailable: {0}")]
    ReaperUnavailable(String),

    /// More than one running container carries the same reuse fingerprint.
    #[error("{candidates} running containers share reuse fingerprint {fingerprint}")]
    ReuseAmbiguous {
        /// Fingerprint that matched.
        fingerprint: String,
        /// Number of matching containers.
        candidates: usize,
    },

    /// A container or network could not be removed.
    #[error("failed to remove {id}: {reason}")]
    RemovalFailure {
        /// Container or network ID.
        id: String,
        /// Failure reason.
        reason: String,
    },

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Other engine errors.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Reading staged files failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DockyardError {
    /// Whether this error came out of readiness waiting.
    #[must_use]
    pub const fn is_readiness(&self) -> bool {
        matches!(
            self,
            Self::ReadinessTimeout { .. } | Self::ReadinessFailed { .. }
        )
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, DockyardError>;
