//! Declarative description of a container to run.
//!
//! A [`ContainerSpec`] is built up front and frozen once handed to the
//! orchestrator. System labels in the `testcontainers.` namespace are added
//! by the orchestrator and reaper; user code may not set them.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DockyardError, Result};
use crate::labels::RESERVED_LABEL_PREFIX;

/// Default file mode for files copied into a container.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Resource limits applied at container creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes (0 = unlimited).
    pub memory_bytes: u64,

    /// Memory reservation (soft limit) in bytes.
    pub memory_reservation_bytes: u64,

    /// CPU quota in billionths of a CPU (0 = unlimited).
    pub nano_cpus: u64,

    /// CPUs the container may run on (e.g. "0-3").
    pub cpuset_cpus: Option<String>,
}

impl ResourceLimits {
    /// Limit memory in megabytes.
    #[must_use]
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_bytes = mb * 1024 * 1024;
        self
    }

    /// Set a memory reservation in megabytes.
    #[must_use]
    pub fn with_memory_reservation_mb(mut self, mb: u64) -> Self {
        self.memory_reservation_bytes = mb * 1024 * 1024;
        self
    }

    /// Limit to a number of CPUs (can be fractional).
    #[must_use]
    pub fn with_cpus(mut self, count: f64) -> Self {
        self.nano_cpus = (count * 1_000_000_000.0) as u64;
        self
    }

    /// Pin to specific CPUs by core list.
    #[must_use]
    pub fn pinned(mut self, cpuset: impl Into<String>) -> Self {
        self.cpuset_cpus = Some(cpuset.into());
        self
    }
}

/// Network mode for containers that are not attached to named networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkMode {
    /// Default bridge network.
    #[default]
    Bridge,

    /// Host network namespace.
    Host,

    /// No networking.
    None,

    /// Share another container's network namespace.
    Container(String),
}

impl NetworkMode {
    /// Mode string understood by the engine.
    #[must_use]
    pub fn as_engine_mode(&self) -> String {
        match self {
            Self::Bridge => "bridge".to_string(),
            Self::Host => "host".to_string(),
            Self::None => "none".to_string(),
            Self::Container(id) => format!("container:{id}"),
        }
    }
}

/// Attachment to a user-defined network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name.
    pub network: String,

    /// DNS aliases on that network.
    pub aliases: Vec<String>,
}

/// Mount type for volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum MountType {
    /// Bind mount from host path.
    #[default]
    Bind,

    /// Named volume.
    Volume,

    /// Temporary filesystem.
    Tmpfs,
}

/// Volume mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Source path on host or volume name.
    pub source: String,

    /// Target path in container.
    pub target: String,

    /// Whether mount is read-only.
    pub read_only: bool,

    /// Mount type.
    pub mount_type: MountType,
}

impl VolumeMount {
    /// Create a bind mount.
    #[must_use]
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
            mount_type: MountType::Bind,
        }
    }

    /// Create a named volume mount.
    #[must_use]
    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: name.into(),
            target: target.into(),
            read_only: false,
            mount_type: MountType::Volume,
        }
    }

    /// Create a tmpfs mount.
    #[must_use]
    pub fn tmpfs(target: impl Into<String>) -> Self {
        Self {
            source: String::new(),
            target: target.into(),
            read_only: false,
            mount_type: MountType::Tmpfs,
        }
    }

    /// Make mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Where the contents of a staged file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// In-memory contents.
    Bytes(Vec<u8>),

    /// A file on the host, read when the container is created.
    HostPath(PathBuf),
}

/// A file staged into the container between create and start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyToContainer {
    /// Absolute path inside the container.
    pub target: String,

    /// File contents.
    pub source: CopySource,

    /// Unix permission bits.
    pub mode: u32,
}

impl CopyToContainer {
    /// Stage in-memory bytes at `target`.
    #[must_use]
    pub fn bytes(target: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            target: target.into(),
            source: CopySource::Bytes(contents.into()),
            mode: DEFAULT_FILE_MODE,
        }
    }

    /// Stage a host file at `target`.
    #[must_use]
    pub fn host_file(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: CopySource::HostPath(source.into()),
            mode: DEFAULT_FILE_MODE,
        }
    }

    /// Set the file mode.
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Read the file contents.
    pub async fn contents(&self) -> std::io::Result<Vec<u8>> {
        match &self.source {
            CopySource::Bytes(bytes) => Ok(bytes.clone()),
            CopySource::HostPath(path) => tokio::fs::read(path).await,
        }
    }
}

/// Container health check evaluated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Command to run, in engine form (e.g. `["CMD-SHELL", "pg_isready"]`).
    pub test: Vec<String>,

    /// Interval between checks in seconds.
    pub interval_secs: u32,

    /// Timeout for a single check in seconds.
    pub timeout_secs: u32,

    /// Consecutive failures before unhealthy.
    pub retries: u32,

    /// Grace period before failures count, in seconds.
    pub start_period_secs: u32,
}

impl HealthCheck {
    /// Health check running a shell command.
    #[must_use]
    pub fn shell(cmd: impl Into<String>) -> Self {
        Self::cmd(vec!["CMD-SHELL".to_string(), cmd.into()])
    }

    /// Health check with an explicit test vector.
    #[must_use]
    pub fn cmd(test: Vec<String>) -> Self {
        Self {
            test,
            interval_secs: 1,
            timeout_secs: 5,
            retries: 3,
            start_period_secs: 0,
        }
    }

    /// Set check interval.
    #[must_use]
    pub fn with_interval(mut self, secs: u32) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Set retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,

    /// Fixed container name. Random when absent.
    pub name: Option<String>,

    /// Ports to publish on random host ports, in declaration order.
    pub exposed_ports: Vec<u16>,

    /// Ports published on fixed host ports (container port -> host port).
    pub port_bindings: BTreeMap<u16, u16>,

    /// Environment variables.
    pub env: HashMap<String, String>,

    /// Volume mounts.
    pub mounts: Vec<VolumeMount>,

    /// Command override.
    pub command: Option<Vec<String>>,

    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,

    /// Working directory.
    pub working_dir: Option<String>,

    /// User to run as.
    pub user: Option<String>,

    /// Hostname.
    pub hostname: Option<String>,

    /// Labels.
    pub labels: HashMap<String, String>,

    /// Network mode when no named networks are attached.
    pub network_mode: NetworkMode,

    /// Named networks with aliases.
    pub networks: Vec<NetworkAttachment>,

    /// Resource limits.
    pub resources: ResourceLimits,

    /// Files copied in before start.
    pub files: Vec<CopyToContainer>,

    /// Engine-side health check.
    pub healthcheck: Option<HealthCheck>,

    /// Privileged mode.
    pub privileged: bool,

    /// Remove the container when it exits.
    pub auto_remove: bool,
}

impl ContainerSpec {
    /// Create a spec for an image.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set a fixed container name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Expose a container port on a random host port.
    #[must_use]
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        if !self.exposed_ports.contains(&port) {
            self.exposed_ports.push(port);
        }
        self
    }

    /// Expose several container ports.
    #[must_use]
    pub fn with_exposed_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        ports.into_iter().fold(self, Self::with_exposed_port)
    }

    /// Publish a container port on a fixed host port.
    #[must_use]
    pub fn with_port_binding(mut self, container_port: u16, host_port: u16) -> Self {
        self.port_bindings.insert(container_port, host_port);
        self.with_exposed_port(container_port)
    }

    /// Set environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    #[must_use]
    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Add a volume mount.
    #[must_use]
    pub fn with_mount(mut self, mount: VolumeMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Set command.
    #[must_use]
    pub fn with_command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    /// Set entrypoint.
    #[must_use]
    pub fn with_entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    /// Set working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Add a user label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set network mode.
    #[must_use]
    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    /// Attach to a named network with aliases.
    #[must_use]
    pub fn with_network<I, S>(mut self, network: impl Into<String>, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks.push(NetworkAttachment {
            network: network.into(),
            aliases: aliases.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Set resource limits.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    /// Stage a file to copy in before start.
    #[must_use]
    pub fn with_file(mut self, file: CopyToContainer) -> Self {
        self.files.push(file);
        self
    }

    /// Configure an engine-side health check.
    #[must_use]
    pub fn with_healthcheck(mut self, healthcheck: HealthCheck) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    /// Run privileged.
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Remove the container when it exits.
    #[must_use]
    pub fn auto_remove(mut self) -> Self {
        self.auto_remove = true;
        self
    }

    /// Validate a user-supplied spec.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::InvalidSpec`] when the spec cannot be created.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(DockyardError::InvalidSpec(
                "image cannot be empty".to_string(),
            ));
        }

        if let Some(name) = &self.name {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
            if !valid {
                return Err(DockyardError::InvalidSpec(format!(
                    "invalid container name: {name:?}"
                )));
            }
        }

        if let Some(key) = self
            .labels
            .keys()
            .find(|key| key.starts_with(RESERVED_LABEL_PREFIX))
        {
            return Err(DockyardError::InvalidSpec(format!(
                "label {key:?} uses the reserved {RESERVED_LABEL_PREFIX} namespace"
            )));
        }

        if self.exposed_ports.contains(&0) || self.port_bindings.contains_key(&0) {
            return Err(DockyardError::InvalidSpec(
                "container port 0 is not valid".to_string(),
            ));
        }

        if let Some(file) = self.files.iter().find(|f| !f.target.starts_with('/')) {
            return Err(DockyardError::InvalidSpec(format!(
                "copy target must be absolute: {}",
                file.target
            )));
        }

        if self.resources.memory_reservation_bytes > self.resources.memory_bytes
            && self.resources.memory_bytes > 0
        {
            return Err(DockyardError::InvalidSpec(
                "memory reservation cannot exceed limit".to_string(),
            ));
        }

        Ok(())
    }
}
