//! Container status and state types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{ContainerId, NetworkId};

/// Engine-reported container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ContainerState {
    /// Created but not started.
    Created,

    /// Running.
    Running,

    /// Paused.
    Paused,

    /// Restarting after an exit.
    Restarting,

    /// Exited.
    Exited,

    /// Dead (removal failed or daemon gave up on it).
    Dead,

    /// Removal in progress.
    Removing,

    /// State the engine did not report or we could not parse.
    #[default]
    Unknown,
}

impl ContainerState {
    /// Check if container is active (running or paused).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Check if container can be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Exited)
    }

    /// Check if container will not run again without intervention.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead | Self::Removing)
    }

    /// Get state name as the engine spells it.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Removing => "removing",
            Self::Unknown => "unknown",
        }
    }

    /// Parse the engine's state name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "removing" => Self::Removing,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Container health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HealthStatus {
    /// No health check configured.
    #[default]
    None,

    /// Health check is starting up.
    Starting,

    /// Container is healthy.
    Healthy,

    /// Container is unhealthy.
    Unhealthy,
}

impl HealthStatus {
    /// Get status name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Port binding information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Container port.
    pub container_port: u16,

    /// Protocol (tcp/udp).
    pub protocol: String,

    /// Host IP the port is bound on.
    pub host_ip: Option<String>,

    /// Host port.
    pub host_port: Option<u16>,
}

impl PortBinding {
    /// TCP binding from a container port to a host port.
    #[must_use]
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            protocol: "tcp".to_string(),
            host_ip: None,
            host_port: Some(host_port),
        }
    }
}

/// Inspection result for a single container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container ID.
    pub id: String,

    /// Container name.
    pub name: String,

    /// Container image.
    pub image: String,

    /// Current state.
    pub state: ContainerState,

    /// Health status (if health check configured).
    pub health: HealthStatus,

    /// Exit code (if exited).
    pub exit_code: Option<i64>,

    /// Error message reported by the engine.
    pub error: Option<String>,

    /// Published ports.
    pub ports: Vec<PortBinding>,

    /// Container labels.
    pub labels: HashMap<String, String>,

    /// Names of attached networks.
    pub networks: Vec<String>,
}

impl ContainerStatus {
    /// Get container ID.
    #[must_use]
    pub fn container_id(&self) -> ContainerId {
        ContainerId::new_unchecked(&self.id)
    }

    /// Check if container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Host port published for a TCP container port.
    #[must_use]
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .filter(|p| p.container_port == container_port && p.protocol == "tcp")
            .find_map(|p| p.host_port)
    }
}

/// Summary of a container for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Container ID.
    pub id: String,

    /// Container name.
    pub name: String,

    /// Image name.
    pub image: String,

    /// Current state.
    pub state: ContainerState,

    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// Get container ID.
    #[must_use]
    pub fn container_id(&self) -> ContainerId {
        ContainerId::new_unchecked(&self.id)
    }
}

/// Summary of a network for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummary {
    /// Network ID.
    pub id: String,

    /// Network name.
    pub name: String,

    /// Network labels.
    pub labels: HashMap<String, String>,
}

impl NetworkSummary {
    /// Get network ID.
    #[must_use]
    pub fn network_id(&self) -> NetworkId {
        NetworkId::new(&self.id)
    }
}
