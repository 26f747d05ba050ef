//! Container engine trait definition.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::error::{ContainerId, EngineResult, NetworkId};
use super::status::{ContainerState, ContainerStatus, ContainerSummary, NetworkSummary};
use crate::labels::LabelFilter;
use crate::spec::ContainerSpec;

/// Boxed future returned by engine operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Options for listing containers.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Include stopped containers.
    pub all: bool,

    /// Every filter must match.
    pub label_filters: Vec<LabelFilter>,

    /// Filter by state.
    pub status_filter: Option<ContainerState>,
}

impl ListOptions {
    /// List containers in any state.
    #[must_use]
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    /// List only running containers.
    #[must_use]
    pub fn running() -> Self {
        Self {
            all: false,
            status_filter: Some(ContainerState::Running),
            ..Default::default()
        }
    }

    /// Require a label.
    #[must_use]
    pub fn with_label(mut self, filter: LabelFilter) -> Self {
        self.label_filters.push(filter);
        self
    }

    /// Whether a container matches these options.
    #[must_use]
    pub fn matches(&self, state: ContainerState, labels: &HashMap<String, String>) -> bool {
        let state_ok = match self.status_filter {
            Some(wanted) => state == wanted,
            None => self.all || state == ContainerState::Running,
        };
        state_ok && self.label_filters.iter().all(|f| f.matches(labels))
    }
}

/// Options for stopping a container.
#[derive(Debug, Clone)]
pub struct StopOptions {
    /// Seconds to wait before killing.
    pub timeout_secs: Option<u32>,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout_secs: Some(10),
        }
    }
}

impl StopOptions {
    /// Create options with custom timeout.
    #[must_use]
    pub fn with_timeout(secs: u32) -> Self {
        Self {
            timeout_secs: Some(secs),
        }
    }
}

/// Options for removing a container.
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Force removal of running container.
    pub force: bool,

    /// Remove associated anonymous volumes.
    pub volumes: bool,
}

impl RemoveOptions {
    /// Kill if running and drop anonymous volumes.
    #[must_use]
    pub fn force() -> Self {
        Self {
            force: true,
            volumes: true,
        }
    }
}

/// Log retrieval options.
#[derive(Debug, Clone)]
pub struct LogsOptions {
    /// Include stdout.
    pub stdout: bool,

    /// Include stderr.
    pub stderr: bool,

    /// Number of lines to tail.
    pub tail: Option<usize>,
}

impl Default for LogsOptions {
    fn default() -> Self {
        Self::all()
    }
}

impl LogsOptions {
    /// Both streams, full history.
    #[must_use]
    pub fn all() -> Self {
        Self {
            stdout: true,
            stderr: true,
            tail: None,
        }
    }

    /// Tail last N lines.
    #[must_use]
    pub fn tail(n: usize) -> Self {
        Self {
            tail: Some(n),
            ..Self::all()
        }
    }
}

/// Exec options for running commands in containers.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Command to run.
    pub cmd: Vec<String>,

    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,

    /// Working directory.
    pub working_dir: Option<String>,

    /// User to run as.
    pub user: Option<String>,
}

impl ExecOptions {
    /// Exec options for a command vector.
    #[must_use]
    pub fn cmd<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            working_dir: None,
            user: None,
        }
    }

    /// Run a command line through `/bin/sh -c`.
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self::cmd(["/bin/sh".to_string(), "-c".to_string(), command.into()])
    }

    /// Set environment variable.
    #[must_use]
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env.push(env.into());
        self
    }

    /// Set user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Exec result.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code.
    pub exit_code: i64,

    /// Stdout output.
    pub stdout: Vec<u8>,

    /// Stderr output.
    pub stderr: Vec<u8>,
}

impl ExecResult {
    /// Check if command succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get stdout as string.
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string.
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// A single file placed into a container's filesystem.
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// Absolute path inside the container.
    pub target: String,

    /// File contents.
    pub contents: Vec<u8>,

    /// Unix permission bits.
    pub mode: u32,
}

/// Narrow facade over the container engine.
///
/// Implementations must be safe to share across tasks. The orchestrator and
/// reaper only ever talk to the engine through this trait, so tests can swap
/// in [`MemoryEngine`](super::MemoryEngine).
pub trait ContainerEngine: Send + Sync {
    /// Create a container from a fully labelled spec.
    ///
    /// # Errors
    ///
    /// Returns error if container creation fails.
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> EngineFuture<'a, ContainerId>;

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns error if container start fails.
    fn start<'a>(&'a self, id: &'a ContainerId) -> EngineFuture<'a, ()>;

    /// Stop a container. Stopping a stopped container succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if container stop fails.
    fn stop<'a>(&'a self, id: &'a ContainerId, options: &'a StopOptions) -> EngineFuture<'a, ()>;

    /// Remove a container.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`](super::EngineError::NotFound) if the
    /// container is already gone.
    fn remove<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a RemoveOptions,
    ) -> EngineFuture<'a, ()>;

    /// Inspect a container.
    ///
    /// # Errors
    ///
    /// Returns error if the container cannot be inspected.
    fn inspect<'a>(&'a self, id: &'a ContainerId) -> EngineFuture<'a, ContainerStatus>;

    /// List containers.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list<'a>(&'a self, options: &'a ListOptions) -> EngineFuture<'a, Vec<ContainerSummary>>;

    /// Fetch container logs (stdout and stderr interleaved).
    ///
    /// # Errors
    ///
    /// Returns error if log retrieval fails.
    fn logs<'a>(&'a self, id: &'a ContainerId, options: &'a LogsOptions)
    -> EngineFuture<'a, Vec<u8>>;

    /// Execute a command in a running container.
    ///
    /// # Errors
    ///
    /// Returns error if the exec could not be run. A non-zero exit code is
    /// not an error.
    fn exec<'a>(&'a self, id: &'a ContainerId, options: &'a ExecOptions)
    -> EngineFuture<'a, ExecResult>;

    /// Upload files into a created container.
    ///
    /// # Errors
    ///
    /// Returns error if the upload fails.
    fn copy_to_container<'a>(
        &'a self,
        id: &'a ContainerId,
        files: &'a [FileUpload],
    ) -> EngineFuture<'a, ()>;

    /// Create a network.
    ///
    /// # Errors
    ///
    /// Returns error if the network cannot be created.
    fn create_network<'a>(
        &'a self,
        name: &'a str,
        labels: &'a HashMap<String, String>,
    ) -> EngineFuture<'a, NetworkId>;

    /// Remove a network.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`](super::EngineError::NotFound) if the
    /// network is already gone.
    fn remove_network<'a>(&'a self, id: &'a NetworkId) -> EngineFuture<'a, ()>;

    /// List networks carrying every given label.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list_networks<'a>(
        &'a self,
        filters: &'a [LabelFilter],
    ) -> EngineFuture<'a, Vec<NetworkSummary>>;

    /// Check the engine is reachable.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is not available.
    fn ping(&self) -> EngineFuture<'_, ()>;

    /// Host name or address where published ports are reachable.
    fn host(&self) -> String;
}
