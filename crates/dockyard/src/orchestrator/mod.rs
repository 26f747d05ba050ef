//! Lifecycle orchestration.
//!
//! [`Orchestrator::start`] drives one container from request to a running,
//! ready handle:
//!
//! ```text
//! Configured ─(reuse match)─> Attached
//!     │
//!     └─> Creating ─> Created ─> Starting ─> AwaitingReady ─> Running
//!            ▲          │           │             │
//!            │          └───────────┴──> Failed <─┘
//!            └──────── (attempts left) ────┘  └─> FatallyFailed
//! ```
//!
//! Every failed attempt force-removes what it created before the next one
//! begins. The container is registered with the reaper before the readiness
//! wait, so a crash while waiting still gets cleaned up.

mod handle;
mod request;
mod state;

pub use handle::{ContainerHandle, NetworkHandle};
pub use request::ContainerRequest;
pub use state::{Lifecycle, LifecycleState};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::config::DockyardConfig;
use crate::engine::{ContainerEngine, ContainerId, DockerEngine, FileUpload};
use crate::error::{DockyardError, Result};
use crate::labels::{
    LABEL_COPIED_FILES_HASH, LABEL_REUSE_HASH, LabelFilter, SessionId, system_labels,
};
use crate::reaper::{Reaper, ResourceKind};
use crate::reuse::{ReuseFingerprint, copied_files_hash, find_reusable};
use crate::spec::ContainerSpec;
use crate::wait::{WaitError, WaitStrategy, WaitTarget, effective_timeout};

/// Starts, tracks and tears down containers for one process.
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    config: DockyardConfig,
    reaper: Arc<Reaper>,
    session: SessionId,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("host", &self.engine.host())
            .field("config", &self.config)
            .field("reaper", &self.reaper)
            .field("session", &self.session)
            .finish()
    }
}

/// Everything one startup attempt needs.
struct StartPlan<'a> {
    spec: ContainerSpec,
    wait: &'a dyn WaitStrategy,
    default_timeout: Duration,
    fingerprint: Option<ReuseFingerprint>,
}

impl Orchestrator {
    /// Orchestrator over `engine`, registering through the process-wide
    /// reaper client for `config` (see [`Reaper::shared`]).
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, config: DockyardConfig) -> Self {
        let reaper = Reaper::shared(engine.clone(), config.reaper.clone());
        Self {
            engine,
            config,
            reaper,
            session: SessionId::current(),
        }
    }

    /// Connect to the local Docker daemon with configuration from files and
    /// the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or Docker is unreachable.
    pub fn connect_docker() -> Result<Self> {
        let config = DockyardConfig::load()?;
        let engine = DockerEngine::connect()?;
        Ok(Self::new(Arc::new(engine), config))
    }

    /// Share an existing reaper client.
    #[must_use]
    pub fn with_reaper(mut self, reaper: Arc<Reaper>) -> Self {
        self.reaper = reaper;
        self
    }

    /// Label resources with another session ID.
    #[must_use]
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &DockyardConfig {
        &self.config
    }

    /// The reaper client.
    #[must_use]
    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// Session every created resource is labelled with.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Start a container and wait until it is ready.
    ///
    /// # Errors
    ///
    /// - [`DockyardError::InvalidSpec`] before anything is created.
    /// - [`DockyardError::ReadinessTimeout`] / [`DockyardError::ReadinessFailed`]
    ///   when readiness fails and readiness retries are off.
    /// - [`DockyardError::StartupFailure`] once every attempt has failed.
    pub async fn start(&self, request: ContainerRequest) -> Result<ContainerHandle> {
        request.spec.validate()?;

        let attempts = request
            .startup_attempts
            .unwrap_or(self.config.startup.attempts)
            .max(1);
        let retry_readiness = request
            .retry_on_readiness_failure
            .unwrap_or(self.config.startup.retry_on_readiness_failure);

        let files_hash = copied_files_hash(&request.spec).await?;
        let fingerprint = if request.reuse && self.config.reuse.enabled {
            Some(ReuseFingerprint::compute(&request.spec, files_hash.as_deref())?)
        } else {
            if request.reuse {
                debug!(image = %request.spec.image, "reuse requested but disabled by configuration");
            }
            None
        };

        if let Some(fingerprint) = &fingerprint {
            if let Some(handle) = self.try_attach(fingerprint).await? {
                return Ok(handle);
            }
        }

        let plan = StartPlan {
            spec: self.frozen_spec(&request.spec, fingerprint.as_ref(), files_hash),
            wait: request.wait.as_ref(),
            default_timeout: request
                .startup_timeout
                .unwrap_or_else(|| self.config.startup.timeout()),
            fingerprint,
        };

        let mut lifecycle = Lifecycle::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            lifecycle.transition_to(LifecycleState::Creating)?;

            let mut created = None;
            let err = match self
                .attempt(&plan, attempt, &mut lifecycle, &mut created)
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(err) => err,
            };

            lifecycle.transition_to(LifecycleState::Failed)?;
            if let Some(id) = created {
                self.discard(&id).await;
            }

            let retryable = !err.is_readiness() || retry_readiness;
            warn!(
                image = %plan.spec.image,
                attempt,
                attempts,
                retryable,
                error = %err,
                "startup attempt failed"
            );

            if !retryable {
                lifecycle.transition_to(LifecycleState::FatallyFailed)?;
                return Err(err);
            }
            if attempt >= attempts {
                lifecycle.transition_to(LifecycleState::FatallyFailed)?;
                return Err(DockyardError::StartupFailure {
                    attempts,
                    last_error: Box::new(err),
                });
            }
        }
    }

    /// Stop a container. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than the container being gone.
    pub async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        handle.stop().await
    }

    /// Remove a container. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::RemovalFailure`] if the engine refuses twice.
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        handle.remove().await
    }

    /// Start a container, run `f` with it, then remove it.
    ///
    /// Removal also happens when `f` panics, whether while building its future
    /// or while it runs; the panic is resumed afterwards.
    /// Reused containers are left running.
    ///
    /// # Errors
    ///
    /// Returns startup errors, or the removal error when `f` returned normally.
    pub async fn scoped<F, Fut, T>(&self, request: ContainerRequest, f: F) -> Result<T>
    where
        F: FnOnce(ContainerHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.start(request).await?;
        let body = handle.clone();
        let outcome = AssertUnwindSafe(async move { f(body).await })
            .catch_unwind()
            .await;

        let cleanup = if handle.is_reused() {
            debug!(id = %handle.id(), "leaving reused container running");
            Ok(())
        } else {
            handle.remove().await
        };

        match outcome {
            Ok(value) => cleanup.map(|()| value),
            Err(panic) => {
                if let Err(e) = cleanup {
                    warn!(id = %handle.id(), error = %e, "cleanup after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Create a labelled network and register it with the reaper.
    ///
    /// # Errors
    ///
    /// Returns engine errors.
    pub async fn create_network(&self, name: &str) -> Result<NetworkHandle> {
        let labels = system_labels(self.session);
        let id = self.engine.create_network(name, &labels).await?;
        info!(network = name, id = %id, "network created");
        self.register(ResourceKind::Network).await;
        Ok(NetworkHandle::new(id, name))
    }

    /// Remove a network. Idempotent; other failures are retried once.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::RemovalFailure`] if the engine refuses twice.
    pub async fn remove_network(&self, network: &NetworkHandle) -> Result<()> {
        let mut last = None;
        for attempt in 1..=2u32 {
            match self.engine.remove_network(network.id()).await {
                Ok(()) => {
                    info!(network = network.name(), "network removed");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => {
                    warn!(network = network.name(), attempt, error = %e, "network removal failed");
                    last = Some(e);
                }
            }
        }
        Err(DockyardError::RemovalFailure {
            id: network.id().to_string(),
            reason: last.map_or_else(|| "unknown".to_string(), |e| e.to_string()),
        })
    }

    async fn try_attach(&self, fingerprint: &ReuseFingerprint) -> Result<Option<ContainerHandle>> {
        let summary = match find_reusable(self.engine.as_ref(), fingerprint).await {
            Ok(Some(summary)) => summary,
            Ok(None) => return Ok(None),
            Err(e @ DockyardError::ReuseAmbiguous { .. }) => {
                warn!(error = %e, "not guessing between reuse candidates, creating a new container");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let status = self.engine.inspect(&summary.container_id()).await?;
        if !status.is_running() {
            debug!(id = %summary.id, "reuse candidate stopped before attach");
            return Ok(None);
        }

        let mut lifecycle = Lifecycle::new();
        lifecycle.transition_to(LifecycleState::Attached)?;
        info!(id = %status.id, %fingerprint, "reusing running container");
        Ok(Some(ContainerHandle::new(
            self.engine.clone(),
            &status,
            Some(fingerprint.clone()),
            true,
            lifecycle,
        )))
    }

    /// Copy of `spec` with session, reuse and file labels added.
    fn frozen_spec(
        &self,
        spec: &ContainerSpec,
        fingerprint: Option<&ReuseFingerprint>,
        files_hash: Option<String>,
    ) -> ContainerSpec {
        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.extend(system_labels(self.session));
        if let Some(fingerprint) = fingerprint {
            labels.insert(LABEL_REUSE_HASH.to_string(), fingerprint.to_string());
        }
        if let Some(hash) = files_hash {
            labels.insert(LABEL_COPIED_FILES_HASH.to_string(), hash);
        }

        let mut frozen = spec.clone();
        frozen.labels = labels;
        frozen
    }

    async fn attempt(
        &self,
        plan: &StartPlan<'_>,
        attempt: u32,
        lifecycle: &mut Lifecycle,
        created: &mut Option<ContainerId>,
    ) -> Result<ContainerHandle> {
        let id = self
            .engine
            .create(&plan.spec)
            .await
            .map_err(|source| DockyardError::CreationFailure {
                image: plan.spec.image.clone(),
                source,
            })?;
        *created = Some(id.clone());
        lifecycle.transition_to(LifecycleState::Created)?;
        debug!(id = %id, image = %plan.spec.image, attempt, "container created");

        self.copy_files(&id, &plan.spec).await?;
        self.register(ResourceKind::Container).await;

        lifecycle.transition_to(LifecycleState::Starting)?;
        self.engine.start(&id).await?;

        let status = self.engine.inspect(&id).await?;
        if !status.is_running() {
            return Err(DockyardError::NotRunning {
                id: id.to_string(),
                state: status.state.to_string(),
            });
        }

        lifecycle.transition_to(LifecycleState::AwaitingReady)?;
        let target = WaitTarget::new(self.engine.clone(), &status, plan.spec.exposed_ports.clone())
            .with_default_timeout(plan.default_timeout);
        let timeout = effective_timeout(plan.wait, &target);
        debug!(id = %id, strategy = plan.wait.name(), ?timeout, "waiting for readiness");

        plan.wait
            .wait_until_ready(&target, timeout)
            .await
            .map_err(|e| readiness_error(e, &id, attempt))?;

        lifecycle.transition_to(LifecycleState::Running)?;
        info!(id = %id, image = %plan.spec.image, attempt, "container ready");
        Ok(ContainerHandle::new(
            self.engine.clone(),
            &status,
            plan.fingerprint.clone(),
            false,
            std::mem::take(lifecycle),
        ))
    }

    async fn copy_files(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<()> {
        if spec.files.is_empty() {
            return Ok(());
        }
        let mut uploads = Vec::with_capacity(spec.files.len());
        for file in &spec.files {
            uploads.push(FileUpload {
                target: file.target.clone(),
                contents: file.contents().await?,
                mode: file.mode,
            });
        }
        self.engine.copy_to_container(id, &uploads).await?;
        debug!(id = %id, files = uploads.len(), "staged files copied");
        Ok(())
    }

    /// Register this session's filter. Failure only degrades crash cleanup.
    async fn register(&self, kind: ResourceKind) {
        let filter: LabelFilter = self.session.filter();
        if let Err(e) = self.reaper.register(kind, &filter).await {
            warn!(%kind, error = %e, "resource not covered by crash cleanup");
        }
    }

    /// Best-effort removal of a half-started container.
    async fn discard(&self, id: &ContainerId) {
        if let Err(e) = handle::remove_container(self.engine.as_ref(), id).await {
            warn!(id = %id, error = %e, "failed to clean up after startup attempt");
        }
    }
}

fn readiness_error(err: WaitError, id: &ContainerId, attempt: u32) -> DockyardError {
    match err {
        WaitError::Timeout {
            strategy,
            elapsed,
            detail,
        } => DockyardError::ReadinessTimeout {
            id: id.to_string(),
            strategy,
            elapsed,
            attempt,
            detail,
        },
        WaitError::Failed { strategy, reason } => DockyardError::ReadinessFailed {
            id: id.to_string(),
            strategy,
            reason,
        },
        WaitError::InvalidConfig(reason) => DockyardError::Config(reason),
    }
}
