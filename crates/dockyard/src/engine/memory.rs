//! In-process engine for tests and dry runs.
//!
//! [`MemoryEngine`] keeps containers and networks in a map and lets tests
//! script what the "daemon" does: logs and health per image, exec exit
//! codes, and injected create/start/remove failures. Every call is counted
//! so tests can assert exactly what the orchestrator or reaper asked for.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;

use super::error::{ContainerId, EngineError, EngineResult, NetworkId};
use super::runtime::{
    ContainerEngine, EngineFuture, ExecOptions, ExecResult, FileUpload, ListOptions, LogsOptions,
    RemoveOptions, StopOptions,
};
use super::status::{
    ContainerState, ContainerStatus, ContainerSummary, HealthStatus, NetworkSummary, PortBinding,
};
use crate::labels::LabelFilter;
use crate::spec::ContainerSpec;

const FIRST_HOST_PORT: u16 = 32768;

/// Scripted behaviour applied to containers of one image when they start.
#[derive(Debug, Clone, Default)]
pub struct ImageBehavior {
    /// Log output present right after start.
    pub logs: String,

    /// Health reported after start.
    pub health: HealthStatus,

    /// Exit immediately after start with this code.
    pub exit_on_start: Option<i64>,

    /// Exit code returned by exec unless a queued code overrides it.
    pub exec_exit_code: i64,
}

impl ImageBehavior {
    /// Behaviour with the given startup logs.
    #[must_use]
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    /// Report this health after start.
    #[must_use]
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    /// Exit right after start.
    #[must_use]
    pub fn exits_on_start(mut self, code: i64) -> Self {
        self.exit_on_start = Some(code);
        self
    }

    /// Default exec exit code.
    #[must_use]
    pub fn with_exec_exit_code(mut self, code: i64) -> Self {
        self.exec_exit_code = code;
        self
    }
}

/// A container held by [`MemoryEngine`].
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    /// Container ID.
    pub id: String,

    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Current state.
    pub state: ContainerState,

    /// Health status.
    pub health: HealthStatus,

    /// Exit code once exited.
    pub exit_code: Option<i64>,

    /// Labels.
    pub labels: HashMap<String, String>,

    /// Ports requested at create time.
    pub exposed_ports: Vec<u16>,

    /// Fixed host ports requested at create time.
    pub port_bindings: BTreeMap<u16, u16>,

    /// Ports assigned at start.
    pub ports: Vec<PortBinding>,

    /// Attached networks.
    pub networks: Vec<String>,

    /// Files uploaded into the container (path -> (contents, mode)).
    pub files: BTreeMap<String, (Vec<u8>, u32)>,

    /// Accumulated log output.
    pub logs: String,

    /// Exit codes handed out by the next execs, in order.
    pub exec_exit_codes: VecDeque<i64>,

    /// Exit code once the queue is drained.
    pub exec_default_exit_code: i64,

    /// Commands executed so far.
    pub execs: Vec<Vec<String>>,
}

impl MemoryContainer {
    fn status(&self) -> ContainerStatus {
        ContainerStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            state: self.state,
            health: self.health,
            exit_code: self.exit_code,
            error: None,
            ports: self.ports.clone(),
            labels: self.labels.clone(),
            networks: self.networks.clone(),
        }
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            state: self.state,
            labels: self.labels.clone(),
        }
    }
}

/// Per-operation call counters.
#[derive(Debug, Clone, Default)]
pub struct EngineCalls {
    /// `create` calls, including failed ones.
    pub create: usize,
    /// `start` calls.
    pub start: usize,
    /// `stop` calls.
    pub stop: usize,
    /// `remove` calls.
    pub remove: usize,
    /// IDs passed to `remove`, in call order.
    pub removed_ids: Vec<String>,
    /// `copy_to_container` calls.
    pub copy: usize,
    /// `exec` calls.
    pub exec: usize,
    /// `create_network` calls.
    pub create_network: usize,
    /// IDs passed to `remove_network`, in call order.
    pub removed_networks: Vec<String>,
}

#[derive(Debug, Default)]
struct Faults {
    creates: u32,
    starts: u32,
    removes: u32,
    unreachable: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    networks: BTreeMap<String, NetworkSummary>,
    images: HashMap<String, ImageBehavior>,
    next_id: u64,
    next_host_port: u16,
    faults: Faults,
    calls: EngineCalls,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:060x}", self.next_id)
    }

    fn next_host_port(&mut self) -> u16 {
        if self.next_host_port < FIRST_HOST_PORT {
            self.next_host_port = FIRST_HOST_PORT;
        }
        let port = self.next_host_port;
        self.next_host_port = self.next_host_port.wrapping_add(1);
        port
    }

    fn container_mut(&mut self, id: &str) -> EngineResult<&mut MemoryContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    fn check_reachable(&self) -> EngineResult<()> {
        if self.faults.unreachable {
            return Err(EngineError::ConnectionFailed(
                "engine marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// Container engine that lives entirely in memory.
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
    host: String,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Create an empty engine reachable on `127.0.0.1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            host: "127.0.0.1".to_string(),
        }
    }

    /// Script the behaviour of containers created from `image`.
    #[must_use]
    pub fn with_image(self, image: impl Into<String>, behavior: ImageBehavior) -> Self {
        self.state.lock().images.insert(image.into(), behavior);
        self
    }

    /// Use a fixed first host port for published ports.
    #[must_use]
    pub fn with_first_host_port(self, port: u16) -> Self {
        self.state.lock().next_host_port = port;
        self
    }

    /// Fail the next `n` create calls.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().faults.creates = n;
    }

    /// Fail the next `n` start calls.
    pub fn fail_next_starts(&self, n: u32) {
        self.state.lock().faults.starts = n;
    }

    /// Fail the next `n` container or network removals with a transient error.
    pub fn fail_next_removes(&self, n: u32) {
        self.state.lock().faults.removes = n;
    }

    /// Make every call fail as if the daemon were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().faults.unreachable = unreachable;
    }

    /// Append to a container's logs.
    pub fn append_logs(&self, id: &ContainerId, text: &str) {
        if let Some(container) = self.state.lock().containers.get_mut(id.as_str()) {
            container.logs.push_str(text);
        }
    }

    /// Set a container's health.
    pub fn set_health(&self, id: &ContainerId, health: HealthStatus) {
        if let Some(container) = self.state.lock().containers.get_mut(id.as_str()) {
            container.health = health;
        }
    }

    /// Force a container into a state, as if it crashed or was stopped externally.
    pub fn set_state(&self, id: &ContainerId, state: ContainerState, exit_code: Option<i64>) {
        if let Some(container) = self.state.lock().containers.get_mut(id.as_str()) {
            container.state = state;
            container.exit_code = exit_code;
        }
    }

    /// Queue exit codes for the next execs in a container.
    pub fn queue_exec_exit_codes(&self, id: &ContainerId, codes: impl IntoIterator<Item = i64>) {
        if let Some(container) = self.state.lock().containers.get_mut(id.as_str()) {
            container.exec_exit_codes.extend(codes);
        }
    }

    /// Add a container directly, bypassing create/start.
    pub fn seed_container(
        &self,
        image: &str,
        labels: HashMap<String, String>,
        state: ContainerState,
    ) -> ContainerId {
        let mut inner = self.state.lock();
        let id = inner.next_id("c");
        let container = MemoryContainer {
            id: id.clone(),
            name: format!("seeded-{}", &id[id.len() - 6..]),
            image: image.to_string(),
            state,
            health: HealthStatus::None,
            exit_code: None,
            labels,
            exposed_ports: Vec::new(),
            port_bindings: BTreeMap::new(),
            ports: Vec::new(),
            networks: Vec::new(),
            files: BTreeMap::new(),
            logs: String::new(),
            exec_exit_codes: VecDeque::new(),
            exec_default_exit_code: 0,
            execs: Vec::new(),
        };
        inner.containers.insert(id.clone(), container);
        ContainerId::new_unchecked(id)
    }

    /// Add a network directly.
    pub fn seed_network(&self, name: &str, labels: HashMap<String, String>) -> NetworkId {
        let mut inner = self.state.lock();
        let id = inner.next_id("n");
        inner.networks.insert(
            id.clone(),
            NetworkSummary {
                id: id.clone(),
                name: name.to_string(),
                labels,
            },
        );
        NetworkId::new(id)
    }

    /// Snapshot of one container.
    #[must_use]
    pub fn container(&self, id: &ContainerId) -> Option<MemoryContainer> {
        self.state.lock().containers.get(id.as_str()).cloned()
    }

    /// Snapshot of all containers.
    #[must_use]
    pub fn containers(&self) -> Vec<MemoryContainer> {
        self.state.lock().containers.values().cloned().collect()
    }

    /// Number of containers currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .count()
    }

    /// Snapshot of all networks.
    #[must_use]
    pub fn networks(&self) -> Vec<NetworkSummary> {
        self.state.lock().networks.values().cloned().collect()
    }

    /// Snapshot of the call counters.
    #[must_use]
    pub fn calls(&self) -> EngineCalls {
        self.state.lock().calls.clone()
    }

    fn do_create(&self, spec: &ContainerSpec) -> EngineResult<ContainerId> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.create += 1;

        if take_fault(&mut inner.faults.creates) {
            return Err(EngineError::CreateFailed("injected create failure".to_string()));
        }

        if let Some(name) = &spec.name {
            if inner.containers.values().any(|c| &c.name == name) {
                return Err(EngineError::Conflict(format!(
                    "container name {name} already in use"
                )));
            }
        }

        let behavior = inner.images.get(&spec.image).cloned().unwrap_or_default();
        let id = inner.next_id("c");
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("memory-{}", &id[id.len() - 8..]));

        inner.containers.insert(
            id.clone(),
            MemoryContainer {
                id: id.clone(),
                name,
                image: spec.image.clone(),
                state: ContainerState::Created,
                health: HealthStatus::None,
                exit_code: None,
                labels: spec.labels.clone(),
                exposed_ports: spec.exposed_ports.clone(),
                port_bindings: spec.port_bindings.clone(),
                ports: Vec::new(),
                networks: spec.networks.iter().map(|n| n.network.clone()).collect(),
                files: BTreeMap::new(),
                logs: String::new(),
                exec_exit_codes: VecDeque::new(),
                exec_default_exit_code: behavior.exec_exit_code,
                execs: Vec::new(),
            },
        );

        Ok(ContainerId::new_unchecked(id))
    }

    fn do_start(&self, id: &ContainerId) -> EngineResult<()> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.start += 1;

        if take_fault(&mut inner.faults.starts) {
            return Err(EngineError::StartFailed {
                id: id.as_str().to_string(),
                reason: "injected start failure".to_string(),
            });
        }

        let image = inner.container_mut(id.as_str())?.image.clone();
        let behavior = inner.images.get(&image).cloned().unwrap_or_default();

        let (exposed, fixed) = {
            let container = inner.container_mut(id.as_str())?;
            (container.exposed_ports.clone(), container.port_bindings.clone())
        };
        let mut ports = Vec::with_capacity(exposed.len());
        for port in exposed {
            let host_port = match fixed.get(&port) {
                Some(host_port) => *host_port,
                None => inner.next_host_port(),
            };
            ports.push(PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                ..PortBinding::tcp(port, host_port)
            });
        }

        let container = inner.container_mut(id.as_str())?;
        container.ports = ports;
        container.logs.push_str(&behavior.logs);
        container.health = behavior.health;
        match behavior.exit_on_start {
            Some(code) => {
                container.state = ContainerState::Exited;
                container.exit_code = Some(code);
            }
            None => {
                container.state = ContainerState::Running;
                container.exit_code = None;
            }
        }
        Ok(())
    }

    fn do_stop(&self, id: &ContainerId) -> EngineResult<()> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.stop += 1;
        let container = inner.container_mut(id.as_str())?;
        if container.state.is_active() || container.state == ContainerState::Restarting {
            container.state = ContainerState::Exited;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    fn do_remove(&self, id: &ContainerId, options: &RemoveOptions) -> EngineResult<()> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.remove += 1;
        inner.calls.removed_ids.push(id.as_str().to_string());

        if take_fault(&mut inner.faults.removes) {
            return Err(EngineError::RemoveFailed {
                id: id.as_str().to_string(),
                reason: "injected remove failure".to_string(),
            });
        }

        let container = inner.container_mut(id.as_str())?;
        if container.state.is_active() && !options.force {
            return Err(EngineError::RemoveFailed {
                id: id.as_str().to_string(),
                reason: "container is running".to_string(),
            });
        }
        inner.containers.remove(id.as_str());
        Ok(())
    }

    fn do_exec(&self, id: &ContainerId, options: &ExecOptions) -> EngineResult<ExecResult> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.exec += 1;
        let container = inner.container_mut(id.as_str())?;
        if container.state != ContainerState::Running {
            return Err(EngineError::ExecFailed {
                id: id.as_str().to_string(),
                reason: format!("container is {}", container.state),
            });
        }
        container.execs.push(options.cmd.clone());
        let exit_code = container
            .exec_exit_codes
            .pop_front()
            .unwrap_or(container.exec_default_exit_code);
        Ok(ExecResult {
            exit_code,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    fn do_copy(&self, id: &ContainerId, files: &[FileUpload]) -> EngineResult<()> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.copy += 1;
        let container = inner.container_mut(id.as_str())?;
        for file in files {
            container
                .files
                .insert(file.target.clone(), (file.contents.clone(), file.mode));
        }
        Ok(())
    }

    fn do_create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> EngineResult<NetworkId> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.create_network += 1;
        if inner.networks.values().any(|n| n.name == name) {
            return Err(EngineError::Conflict(format!(
                "network {name} already exists"
            )));
        }
        let id = inner.next_id("n");
        inner.networks.insert(
            id.clone(),
            NetworkSummary {
                id: id.clone(),
                name: name.to_string(),
                labels: labels.clone(),
            },
        );
        Ok(NetworkId::new(id))
    }

    fn do_remove_network(&self, id: &NetworkId) -> EngineResult<()> {
        let mut inner = self.state.lock();
        inner.check_reachable()?;
        inner.calls.removed_networks.push(id.as_str().to_string());
        if take_fault(&mut inner.faults.removes) {
            return Err(EngineError::RemoveFailed {
                id: id.as_str().to_string(),
                reason: "injected remove failure".to_string(),
            });
        }
        inner
            .networks
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound {
                id: id.as_str().to_string(),
            })
    }
}

impl ContainerEngine for MemoryEngine {
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> EngineFuture<'a, ContainerId> {
        Box::pin(async move { self.do_create(spec) })
    }

    fn start<'a>(&'a self, id: &'a ContainerId) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.do_start(id) })
    }

    fn stop<'a>(&'a self, id: &'a ContainerId, _options: &'a StopOptions) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.do_stop(id) })
    }

    fn remove<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a RemoveOptions,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.do_remove(id, options) })
    }

    fn inspect<'a>(&'a self, id: &'a ContainerId) -> EngineFuture<'a, ContainerStatus> {
        Box::pin(async move {
            let mut inner = self.state.lock();
            inner.check_reachable()?;
            Ok(inner.container_mut(id.as_str())?.status())
        })
    }

    fn list<'a>(&'a self, options: &'a ListOptions) -> EngineFuture<'a, Vec<ContainerSummary>> {
        Box::pin(async move {
            let inner = self.state.lock();
            inner.check_reachable()?;
            Ok(inner
                .containers
                .values()
                .filter(|c| options.matches(c.state, &c.labels))
                .map(MemoryContainer::summary)
                .collect())
        })
    }

    fn logs<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a LogsOptions,
    ) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut inner = self.state.lock();
            inner.check_reachable()?;
            let logs = &inner.container_mut(id.as_str())?.logs;
            let text = match options.tail {
                Some(n) => {
                    let lines: Vec<&str> = logs.lines().collect();
                    let start = lines.len().saturating_sub(n);
                    lines[start..].join("\n")
                }
                None => logs.clone(),
            };
            Ok(text.into_bytes())
        })
    }

    fn exec<'a>(
        &'a self,
        id: &'a ContainerId,
        options: &'a ExecOptions,
    ) -> EngineFuture<'a, ExecResult> {
        Box::pin(async move { self.do_exec(id, options) })
    }

    fn copy_to_container<'a>(
        &'a self,
        id: &'a ContainerId,
        files: &'a [FileUpload],
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.do_copy(id, files) })
    }

    fn create_network<'a>(
        &'a self,
        name: &'a str,
        labels: &'a HashMap<String, String>,
    ) -> EngineFuture<'a, NetworkId> {
        Box::pin(async move { self.do_create_network(name, labels) })
    }

    fn remove_network<'a>(&'a self, id: &'a NetworkId) -> EngineFuture<'a, ()> {
        Box::pin(async move { self.do_remove_network(id) })
    }

    fn list_networks<'a>(
        &'a self,
        filters: &'a [LabelFilter],
    ) -> EngineFuture<'a, Vec<NetworkSummary>> {
        Box::pin(async move {
            let inner = self.state.lock();
            inner.check_reachable()?;
            Ok(inner
                .networks
                .values()
                .filter(|n| filters.iter().all(|f| f.matches(&n.labels)))
                .cloned()
                .collect())
        })
    }

    fn ping(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move { self.state.lock().check_reachable() })
    }

    fn host(&self) -> String {
        self.host.clone()
    }
}
