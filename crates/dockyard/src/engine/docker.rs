//! Docker engine implementation using bollard.

use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions as BollardLogsOptions, NetworkingConfig, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerState as BollardState, ContainerStateStatusEnum, EndpointSettings, HealthConfig,
    HealthStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding as BollardPortBinding,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::error::{ContainerId, EngineError, EngineResult, NetworkId};
use super::runtime::{
    ContainerEngine, EngineFuture, ExecOptions, ExecResult, FileUpload, ListOptions, LogsOptions,
    RemoveOptions, StopOptions,
};
use super::status::{
    ContainerState, ContainerStatus, ContainerSummary, HealthStatus, NetworkSummary, PortBinding,
};
use crate::labels::LabelFilter;
use crate::spec::{ContainerSpec, MountType, VolumeMount};

/// Overrides the host published ports are reached on.
pub const HOST_OVERRIDE_ENV: &str = "TESTCONTAINERS_HOST_OVERRIDE";

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Docker engine backed by the local daemon.
pub struct DockerEngine {
    client: Docker,
    host: String,
}

impl DockerEngine {
    /// Connect to Docker using `DOCKER_HOST` or the platform default socket.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails.
    pub fn connect() -> EngineResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::ConnectionFailed(format!("failed to connect to Docker: {e}"))
        })?;

        Ok(Self {
            client,
            host: resolve_host(
                std::env::var(HOST_OVERRIDE_ENV).ok().as_deref(),
                std::env::var("DOCKER_HOST").ok().as_deref(),
            ),
        })
    }

    /// Connect to Docker at a specific HTTP URL.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails.
    pub fn connect_with_url(url: &str) -> EngineResult<Self> {
        let client = Docker::connect_with_http(url, 120, bollard::API_DEFAULT_VERSION).map_err(
            |e| EngineError::ConnectionFailed(format!("failed to connect to Docker at {url}: {e}")),
        )?;

        Ok(Self {
            client,
            host: resolve_host(None, Some(url)),
        })
    }

    /// Override the host published ports are reached on.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        info!(image = %image, "pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image = %image, status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(EngineError::ImageNotFound {
                        image: format!("{image}: {e}"),
                    });
                }
            }
        }

        Ok(())
    }

    async fn create_once(&self, spec: &ContainerSpec) -> EngineResult<ContainerId> {
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .client
            .create_container(options, build_config(spec))
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::ImageNotFound {
                    image: spec.image.clone(),
                },
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409,
                    message,
                } => EngineError::Conflict(message),
                _ => EngineError::CreateFailed(e.to_string()),
            })?;

        for warning in &response.warnings {
            warn!(id = %response.id, warning = %warning, "engine warning on create");
        }

        Ok(ContainerId::new_unchecked(response.id))
    }
}

fn resolve_host(override_host: Option<&str>, docker_host: Option<&str>) -> String {
    if let Some(host) = override_host.filter(|h| !h.is_empty()) {
        return host.to_string();
    }

    docker_host
        .and_then(|url| {
            let rest = url
                .strip_prefix("tcp://")
                .or_else(|| url.strip_prefix("http://"))
                .or_else(|| url.strip_prefix("https://"))?;
            let authority = rest.split('/').next()?;
            let host = authority.rsplit_once(':').map_or(authority, |(h, _)| h);
            (!host.is_empty()).then(|| host.to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn map_not_found(id: &str, e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound { id: id.to_string() },
        _ => EngineError::Internal(e.to_string()),
    }
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports
        .iter()
        .map(|port| (format!("{port}/tcp"), HashMap::new()))
        .collect();

    let networking_config = (!spec.networks.is_empty()).then(|| NetworkingConfig {
        endpoints_config: spec
            .networks
            .iter()
            .map(|attachment| {
                (
                    attachment.network.clone(),
                    EndpointSettings {
                        aliases: (!attachment.aliases.is_empty())
                            .then(|| attachment.aliases.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect(),
    });

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        entrypoint: spec.entrypoint.clone(),
        env: (!env.is_empty()).then_some(env),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        hostname: spec.hostname.clone(),
        labels: Some(spec.labels.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        healthcheck: spec.healthcheck.as_ref().map(|hc| HealthConfig {
            test: Some(hc.test.clone()),
            interval: Some(i64::from(hc.interval_secs) * NANOS_PER_SEC),
            timeout: Some(i64::from(hc.timeout_secs) * NANOS_PER_SEC),
            retries: Some(i64::from(hc.retries)),
            start_period: Some(i64::from(hc.start_period_secs) * NANOS_PER_SEC),
            ..Default::default()
        }),
        host_config: Some(build_host_config(spec)),
        networking_config,
        ..Default::default()
    }
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut host_config = HostConfig::default();

    if spec.resources.memory_bytes > 0 {
        host_config.memory = Some(spec.resources.memory_bytes as i64);
    }
    if spec.resources.memory_reservation_bytes > 0 {
        host_config.memory_reservation = Some(spec.resources.memory_reservation_bytes as i64);
    }
    if spec.resources.nano_cpus > 0 {
        host_config.nano_cpus = Some(spec.resources.nano_cpus as i64);
    }
    host_config.cpuset_cpus.clone_from(&spec.resources.cpuset_cpus);

    host_config.network_mode = Some(
        spec.networks
            .first()
            .map_or_else(|| spec.network_mode.as_engine_mode(), |n| n.network.clone()),
    );

    let mounts: Vec<Mount> = spec.mounts.iter().map(volume_to_mount).collect();
    if !mounts.is_empty() {
        host_config.mounts = Some(mounts);
    }

    if !spec.exposed_ports.is_empty() {
        host_config.publish_all_ports = Some(true);
    }
    if !spec.port_bindings.is_empty() {
        let bindings: HashMap<String, Option<Vec<BollardPortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|(container_port, host_port)| {
                (
                    format!("{container_port}/tcp"),
                    Some(vec![BollardPortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host_port.to_string()),
                    }]),
                )
            })
            .collect();
        host_config.port_bindings = Some(bindings);
    }

    host_config.privileged = Some(spec.privileged);
    host_config.auto_remove = Some(spec.auto_remove);

    host_config
}

fn volume_to_mount(volume: &VolumeMount) -> Mount {
    Mount {
        target: Some(volume.target.clone()),
        source: (volume.mount_type != MountType::Tmpfs).then(|| volume.source.clone()),
        typ: Some(match volume.mount_type {
            MountType::Bind => MountTypeEnum::BIND,
            MountType::Volume => MountTypeEnum::VOLUME,
            MountType::Tmpfs => MountTypeEnum::TMPFS,
        }),
        read_only: Some(volume.read_only),
        ..Default::default()
    }
}

fn state_from_bollard(state: Option<&BollardState>) -> ContainerState {
    let Some(s) = state else {
        return ContainerState::Unknown;
    };

    match &s.status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Removing,
        _ if s.running == Some(true) => ContainerState::Running,
        _ => ContainerState::Unknown,
    }
}

fn health_from_bollard(health: Option<&bollard::models::Health>) -> HealthStatus {
    match health.and_then(|h| h.status.as_ref()) {
        Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
        _ => HealthStatus::None,
    }
}

fn label_filters(filters: &[LabelFilter]) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    if !filters.is_empty() {
        map.insert(
            "label".to_string(),
            filters.iter().map(ToString::to_string).collect(),
        );
    }
    map
}

/// Pack files into an uncompressed tar archive rooted at `/`.
pub(crate) fn build_tar(files: &[FileUpload]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(
            &mut header,
            file.target.trim_start_matches('/'),
            file.contents.as_slice(),
        )?;
    }
    builder.into_inner()
}

impl ContainerEngine for DockerEngine {
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> EngineFuture<'a, ContainerId> {
        Box::pin(async move {
            debug!(image = %spec.image, name = ?spec.name, "creating container");

            let id = match self.create_once(spec).await {
                Err(EngineError::ImageNotFound { .. }) => {
                    self.pull_image(&spec.image).await?;
                    self.create_once(spec).await?
                }
                other => other?,
            };

            info!(id = %id, image = %spec.image, "container created");
            Ok(id)
        })
    }

    fn start<'a>(&'a self, id: &'a ContainerId) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            debug!(id = %id, "starting container");

            self.client
                .start_container::<String>(id.as_str(), None)
                .await
                .map_err(|e| match e {
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    } => EngineError::NotFound {
                        id: id.as_str().to_string(),
                    },
                    _ => EngineError::StartFailed {
                        id: id.as_str().to_string(),
                        reason: e.to_string(),
                    },
                })?;

            info!(id = %id, "container started");
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a ContainerId, options: &'a StopOptions) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            debug!(id = %id, "stopping container");

            let stop_options = StopContainerOptions {
                t: options.timeout_secs.map_or(10, i64::from),
            };

            match self
                .client
                .stop_container(id.as_str(), Some(stop_options))
                .await
            {
                // 304: already stopped
                Ok(())
                | Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => {
                    info!(id = %id, "container stopped");
                    Ok(())
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => Err(EngineError::NotFound {
                    id: id.as_str().to_string(),
                }),
                Err(e) => Err(EngineError::StopFailed {
                    id: id.as_str().to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    fn remove<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a RemoveOptions,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            debug!(id = %id, force = options.force, "removing container");

            let remove_options = RemoveContainerOptions {
                force: options.force,
                v: options.volumes,
                ..Default::default()
            };

            self.client
                .remove_container(id.as_str(), Some(remove_options))
                .await
                .map_err(|e| match e {
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    } => EngineError::NotFound {
                        id: id.as_str().to_string(),
                    },
                    _ => EngineError::RemoveFailed {
                        id: id.as_str().to_string(),
                        reason: e.to_string(),
                    },
                })?;

            info!(id = %id, "container removed");
            Ok(())
        })
    }

    fn inspect<'a>(&'a self, id: &'a ContainerId) -> EngineFuture<'a, ContainerStatus> {
        Box::pin(async move {
            let inspect = self
                .client
                .inspect_container(id.as_str(), Some(InspectContainerOptions { size: false }))
                .await
                .map_err(|e| map_not_found(id.as_str(), e))?;

            let mut ports = Vec::new();
            let mut networks = Vec::new();
            if let Some(settings) = inspect.network_settings {
                networks = settings
                    .networks
                    .map(|n| n.into_keys().collect())
                    .unwrap_or_default();

                for (port_spec, bindings) in settings.ports.unwrap_or_default() {
                    let (port, protocol) = port_spec
                        .split_once('/')
                        .unwrap_or((port_spec.as_str(), "tcp"));
                    let Ok(container_port) = port.parse::<u16>() else {
                        continue;
                    };
                    for binding in bindings.unwrap_or_default() {
                        ports.push(PortBinding {
                            container_port,
                            protocol: protocol.to_string(),
                            host_ip: binding.host_ip,
                            host_port: binding.host_port.and_then(|p| p.parse().ok()),
                        });
                    }
                }
            }

            let state = inspect.state.as_ref();
            Ok(ContainerStatus {
                id: inspect.id.unwrap_or_default(),
                name: inspect
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: inspect
                    .config
                    .as_ref()
                    .and_then(|c| c.image.clone())
                    .unwrap_or_default(),
                state: state_from_bollard(state),
                health: health_from_bollard(state.and_then(|s| s.health.as_ref())),
                exit_code: state.and_then(|s| s.exit_code),
                error: state.and_then(|s| s.error.clone()).filter(|e| !e.is_empty()),
                ports,
                labels: inspect
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default(),
                networks,
            })
        })
    }

    fn list<'a>(&'a self, options: &'a ListOptions) -> EngineFuture<'a, Vec<ContainerSummary>> {
        Box::pin(async move {
            let mut filters = label_filters(&options.label_filters);
            if let Some(state) = options.status_filter {
                filters.insert("status".to_string(), vec![state.name().to_string()]);
            }

            let list_options = ListContainersOptions {
                all: options.all,
                filters,
                ..Default::default()
            };

            let containers = self
                .client
                .list_containers(Some(list_options))
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;

            Ok(containers
                .into_iter()
                .map(|c| ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .and_then(|n| n.first().cloned())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    state: c
                        .state
                        .as_deref()
                        .map_or(ContainerState::Unknown, ContainerState::from_name),
                    labels: c.labels.unwrap_or_default(),
                })
                .collect())
        })
    }

    fn logs<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a LogsOptions,
    ) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let log_options = BollardLogsOptions {
                stdout: options.stdout,
                stderr: options.stderr,
                timestamps: false,
                tail: options
                    .tail
                    .map_or_else(|| "all".to_string(), |n| n.to_string()),
                follow: false,
                ..Default::default()
            };

            let mut stream = self.client.logs(id.as_str(), Some(log_options));
            let mut output = Vec::new();

            while let Some(result) = stream.next().await {
                match result {
                    Ok(chunk) => output.extend_from_slice(&chunk.into_bytes()),
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    }) => {
                        return Err(EngineError::NotFound {
                            id: id.as_str().to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "error reading logs");
                        break;
                    }
                }
            }

            Ok(output)
        })
    }

    fn exec<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a ExecOptions,
    ) -> EngineFuture<'a, ExecResult> {
        Box::pin(async move {
            let exec_options = CreateExecOptions {
                cmd: Some(options.cmd.clone()),
                env: (!options.env.is_empty()).then(|| options.env.clone()),
                working_dir: options.working_dir.clone(),
                user: options.user.clone(),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            };

            let exec = self
                .client
                .create_exec(id.as_str(), exec_options)
                .await
                .map_err(|e| match e {
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    } => EngineError::NotFound {
                        id: id.as_str().to_string(),
                    },
                    _ => EngineError::ExecFailed {
                        id: id.as_str().to_string(),
                        reason: format!("failed to create exec: {e}"),
                    },
                })?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            let started = self
                .client
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| EngineError::ExecFailed {
                    id: id.as_str().to_string(),
                    reason: format!("failed to start exec: {e}"),
                })?;

            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(result) = output.next().await {
                    match result {
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(chunk) => stdout.extend_from_slice(&chunk.into_bytes()),
                        Err(e) => {
                            warn!(id = %id, error = %e, "error reading exec output");
                            break;
                        }
                    }
                }
            }

            let inspect = self
                .client
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| EngineError::ExecFailed {
                    id: id.as_str().to_string(),
                    reason: format!("failed to inspect exec: {e}"),
                })?;

            Ok(ExecResult {
                exit_code: inspect.exit_code.unwrap_or(-1),
                stdout,
                stderr,
            })
        })
    }

    fn copy_to_container<'a>(
        &'a self,
        id: &'a ContainerId,
        files: &'a [FileUpload],
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            if files.is_empty() {
                return Ok(());
            }

            let archive = build_tar(files).map_err(|e| EngineError::CopyFailed {
                id: id.as_str().to_string(),
                reason: format!("failed to build archive: {e}"),
            })?;

            let options = UploadToContainerOptions {
                path: "/".to_string(),
                ..Default::default()
            };

            self.client
                .upload_to_container(id.as_str(), Some(options), bytes::Bytes::from(archive))
                .await
                .map_err(|e| match e {
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    } => EngineError::NotFound {
                        id: id.as_str().to_string(),
                    },
                    _ => EngineError::CopyFailed {
                        id: id.as_str().to_string(),
                        reason: e.to_string(),
                    },
                })?;

            debug!(id = %id, files = files.len(), "files copied into container");
            Ok(())
        })
    }

    fn create_network<'a>(
        &'a self,
        name: &'a str,
        labels: &'a HashMap<String, String>,
    ) -> EngineFuture<'a, NetworkId> {
        Box::pin(async move {
            let options = CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                labels: labels.clone(),
                ..Default::default()
            };

            let response = self.client.create_network(options).await.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409,
                    message,
                } => EngineError::Conflict(message),
                _ => EngineError::Network(format!("failed to create network {name}: {e}")),
            })?;

            if response.id.is_empty() {
                return Err(EngineError::Network(format!(
                    "engine returned no ID for network {name}"
                )));
            }

            info!(network = %name, id = %response.id, "network created");
            Ok(NetworkId::new(response.id))
        })
    }

    fn remove_network<'a>(&'a self, id: &'a NetworkId) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .remove_network(id.as_str())
                .await
                .map_err(|e| match e {
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 404, ..
                    } => EngineError::NotFound {
                        id: id.as_str().to_string(),
                    },
                    _ => EngineError::RemoveFailed {
                        id: id.as_str().to_string(),
                        reason: e.to_string(),
                    },
                })?;

            info!(id = %id, "network removed");
            Ok(())
        })
    }

    fn list_networks<'a>(
        &'a self,
        filters: &'a [LabelFilter],
    ) -> EngineFuture<'a, Vec<NetworkSummary>> {
        Box::pin(async move {
            let options = ListNetworksOptions {
                filters: label_filters(filters),
            };

            let networks = self
                .client
                .list_networks(Some(options))
                .await
                .map_err(|e| EngineError::Network(e.to_string()))?;

            Ok(networks
                .into_iter()
                .map(|n| NetworkSummary {
                    id: n.id.unwrap_or_default(),
                    name: n.name.unwrap_or_default(),
                    labels: n.labels.unwrap_or_default(),
                })
                .collect())
        })
    }

    fn ping(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .ping()
                .await
                .map_err(|e| EngineError::ConnectionFailed(e.to_string()))?;

            Ok(())
        })
    }

    fn host(&self) -> String {
        self.host.clone()
    }
}
