//! Handles to managed containers and networks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::state::{Lifecycle, LifecycleState};
use crate::engine::{
    ContainerEngine, ContainerId, ContainerStatus, ExecOptions, ExecResult, LogsOptions,
    NetworkId, PortBinding, RemoveOptions, StopOptions,
};
use crate::error::{DockyardError, Result};
use crate::reuse::ReuseFingerprint;

struct HandleInner {
    id: ContainerId,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    reused: bool,
    fingerprint: Option<ReuseFingerprint>,
    host: String,
    ports: Vec<PortBinding>,
    engine: Arc<dyn ContainerEngine>,
    lifecycle: Mutex<Lifecycle>,
}

/// A container created (or attached to) by the orchestrator.
///
/// Clones share state; removing through one clone removes for all.
#[derive(Clone)]
pub struct ContainerHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("image", &self.inner.image)
            .field("reused", &self.inner.reused)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    pub(crate) fn new(
        engine: Arc<dyn ContainerEngine>,
        status: &ContainerStatus,
        fingerprint: Option<ReuseFingerprint>,
        reused: bool,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: status.container_id(),
                name: status.name.clone(),
                image: status.image.clone(),
                labels: status.labels.clone(),
                reused,
                fingerprint,
                host: engine.host(),
                ports: status.ports.clone(),
                engine,
                lifecycle: Mutex::new(lifecycle),
            }),
        }
    }

    /// Engine-assigned container ID.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Image the container runs.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.inner.image
    }

    /// Labels, including the session labels.
    #[must_use]
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.inner.labels
    }

    /// Whether this handle attached to an existing container.
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.inner.reused
    }

    /// Reuse fingerprint, when reuse was enabled.
    #[must_use]
    pub fn fingerprint(&self) -> Option<&ReuseFingerprint> {
        self.inner.fingerprint.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.lock().state()
    }

    /// Every lifecycle state visited, including failed attempts.
    #[must_use]
    pub fn history(&self) -> Vec<LifecycleState> {
        self.inner.lifecycle.lock().history().to_vec()
    }

    /// Host published ports are reachable on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Host port published for a TCP container port.
    #[must_use]
    pub fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.inner
            .ports
            .iter()
            .filter(|p| p.container_port == container_port && p.protocol == "tcp")
            .find_map(|p| p.host_port)
    }

    /// Published ports.
    #[must_use]
    pub fn ports(&self) -> &[PortBinding] {
        &self.inner.ports
    }

    /// Fresh engine view of the container.
    ///
    /// # Errors
    ///
    /// Returns engine errors, including `NotFound` once removed.
    pub async fn status(&self) -> Result<ContainerStatus> {
        Ok(self.inner.engine.inspect(&self.inner.id).await?)
    }

    /// Combined stdout and stderr so far.
    ///
    /// # Errors
    ///
    /// Returns engine errors.
    pub async fn logs(&self) -> Result<String> {
        let bytes = self
            .inner
            .engine
            .logs(&self.inner.id, &LogsOptions::all())
            .await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Run a command inside the container.
    ///
    /// # Errors
    ///
    /// Returns engine errors; a non-zero exit code is not an error.
    pub async fn exec<I, S>(&self, cmd: I) -> Result<ExecResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self
            .inner
            .engine
            .exec(&self.inner.id, &ExecOptions::cmd(cmd))
            .await?)
    }

    /// Stop the container. Stopping an already stopped or removed handle is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than the container being gone.
    pub async fn stop(&self) -> Result<()> {
        if !self.begin(LifecycleState::Stopping) {
            return Ok(());
        }

        match self
            .inner
            .engine
            .stop(&self.inner.id, &StopOptions::default())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(id = %self.inner.id, "container already gone"),
            Err(e) => {
                self.rollback(LifecycleState::Stopping);
                return Err(e.into());
            }
        }

        self.set_state(LifecycleState::Stopped)?;
        info!(id = %self.inner.id, "container stopped");
        Ok(())
    }

    /// Remove the container and its anonymous volumes.
    ///
    /// Idempotent: a second call, or a container that is already gone,
    /// succeeds. Other failures are retried once.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::RemovalFailure`] if the engine refuses twice.
    pub async fn remove(&self) -> Result<()> {
        if self.state() == LifecycleState::Removed {
            debug!(id = %self.inner.id, "already removed");
            return Ok(());
        }
        if let Err(e) = self.stop().await {
            debug!(id = %self.inner.id, error = %e, "stop before remove failed, forcing");
        }

        remove_container(self.inner.engine.as_ref(), &self.inner.id).await?;
        self.force_state(LifecycleState::Removed);
        info!(id = %self.inner.id, "container removed");
        Ok(())
    }

    /// Claim a transition. Returns false when another caller already moved
    /// the handle past it.
    fn begin(&self, target: LifecycleState) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.transition_to(target).is_ok()
    }

    fn set_state(&self, target: LifecycleState) -> Result<()> {
        self.inner.lifecycle.lock().transition_to(target)
    }

    fn rollback(&self, from: LifecycleState) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state() == from {
            lifecycle.pop();
        }
    }

    fn force_state(&self, target: LifecycleState) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state() != target {
            lifecycle.force(target);
        }
    }
}

/// Remove a container, tolerating "already gone" and retrying once.
pub(crate) async fn remove_container(engine: &dyn ContainerEngine, id: &ContainerId) -> Result<()> {
    let options = RemoveOptions::force();
    let mut last = None;
    for attempt in 1..=2u32 {
        match engine.remove(id, &options).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(id = %id, "container already removed");
                return Ok(());
            }
            Err(e) => {
                warn!(id = %id, attempt, error = %e, "container removal failed");
                last = Some(e);
            }
        }
    }
    Err(DockyardError::RemovalFailure {
        id: id.to_string(),
        reason: last.map_or_else(|| "unknown".to_string(), |e| e.to_string()),
    })
}

/// A network created by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    id: NetworkId,
    name: String,
}

impl NetworkHandle {
    pub(crate) fn new(id: NetworkId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Engine-assigned network ID.
    #[must_use]
    pub fn id(&self) -> &NetworkId {
        &self.id
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
