//! Crash-safe cleanup through the reaper sidecar.
//!
//! The first registration lazily finds or starts the sidecar and opens a
//! [`ReaperSession`] to it. Every later registration reuses that session.
//! [`Reaper::shared`] hands out one client per engine daemon and sidecar, so
//! every orchestrator in a process registers through the same connection.
//! A session that loses its connection is replaced on the next registration
//! and the filters it held are registered again.
//! When the process dies the connection drops, and after a grace period the
//! sidecar removes everything matching the registered filters.
//!
//! Failing to reach the reaper is a degraded condition: callers log it and
//! carry on, since explicit removal still works in the non-crash path.

pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use protocol::REAPER_PORT;
pub use session::ReaperSession;

use crate::config::ReaperConfig;
use crate::engine::{ContainerEngine, ContainerId, EngineError, ListOptions};
use crate::error::{DockyardError, Result};
use crate::labels::{LABEL_MANAGED, LABEL_REAPER, LabelFilter};
use crate::spec::{ContainerSpec, VolumeMount};
use crate::wait::{HostPortWaitStrategy, WaitStrategy, WaitTarget};

/// Fixed name of the sidecar container, one per engine daemon.
pub const REAPER_CONTAINER_NAME: &str = "dockyard-reaper";

/// Engine socket mounted into the sidecar.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Kind of resource being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A container.
    Container,
    /// A network.
    Network,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Process-wide reaper clients, keyed by [`shared_key`].
static SHARED: Lazy<parking_lot::Mutex<HashMap<String, Arc<Reaper>>>> =
    Lazy::new(|| parking_lot::Mutex::new(HashMap::new()));

/// Lazily connected reaper client, shared by everything one process creates.
pub struct Reaper {
    engine: Arc<dyn ContainerEngine>,
    config: ReaperConfig,
    session: parking_lot::Mutex<Option<Arc<ReaperSession>>>,
    init: Mutex<()>,
    degraded: AtomicBool,
}

impl fmt::Debug for Reaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaper")
            .field("config", &self.config)
            .field("connected", &self.session.lock().is_some())
            .field("degraded", &self.degraded.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Reaper {
    /// Create a reaper client. Nothing is contacted until the first
    /// registration.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ReaperConfig) -> Self {
        Self {
            engine,
            config,
            session: parking_lot::Mutex::new(None),
            init: Mutex::new(()),
            degraded: AtomicBool::new(false),
        }
    }

    /// The process-wide client for this engine daemon and reaper.
    ///
    /// Calls with the same engine host and the same reaper endpoint (or image,
    /// when the sidecar is provisioned) return the same client, and so share
    /// one session. The first caller's timeouts win. A disabled config gets a
    /// private client.
    #[must_use]
    pub fn shared(engine: Arc<dyn ContainerEngine>, config: ReaperConfig) -> Arc<Self> {
        if config.disabled {
            return Arc::new(Self::new(engine, config));
        }
        let key = shared_key(engine.as_ref(), &config);
        SHARED
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Self::new(engine, config)))
            .clone()
    }

    /// A reaper that never registers anything.
    #[must_use]
    pub fn disabled(engine: Arc<dyn ContainerEngine>) -> Self {
        Self::new(
            engine,
            ReaperConfig {
                disabled: true,
                ..ReaperConfig::default()
            },
        )
    }

    /// Whether registration is switched off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    /// Whether a previous connection attempt failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// The open session, if one has been established.
    #[must_use]
    pub fn session(&self) -> Option<Arc<ReaperSession>> {
        self.session.lock().clone()
    }

    /// Register a filter covering a resource.
    ///
    /// No-op when disabled. Duplicate filters are acknowledged locally.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::ReaperUnavailable`] if the sidecar cannot be
    /// reached or provisioned.
    pub async fn register(&self, kind: ResourceKind, filter: &LabelFilter) -> Result<()> {
        if self.config.disabled {
            debug!(%kind, %filter, "reaper disabled, skipping registration");
            return Ok(());
        }

        let session = self.ensure_session().await?;
        session.register(filter).await?;
        debug!(%kind, %filter, "registered with reaper");
        Ok(())
    }

    async fn ensure_session(&self) -> Result<Arc<ReaperSession>> {
        if let Some(session) = self.session().filter(|s| s.is_alive()) {
            return Ok(session);
        }
        if self.is_degraded() {
            return Err(DockyardError::ReaperUnavailable(
                "earlier connection attempt failed".to_string(),
            ));
        }

        let _guard = self.init.lock().await;
        let carried = match self.session() {
            Some(session) if session.is_alive() => return Ok(session),
            Some(lost) => {
                warn!(endpoint = lost.endpoint(), "reaper connection lost, reconnecting");
                lost.filters()
            }
            None => Vec::new(),
        };

        match self.reconnect(&carried).await {
            Ok(session) => {
                *self.session.lock() = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                warn!(error = %e, "reaper unavailable, crash cleanup disabled for this process");
                Err(e)
            }
        }
    }

    /// Open a new session and register `carried` on it before handing it out.
    async fn reconnect(&self, carried: &[LabelFilter]) -> Result<Arc<ReaperSession>> {
        let session = Arc::new(self.connect().await?);
        for filter in carried {
            session.register(filter).await?;
        }
        if !carried.is_empty() {
            info!(
                endpoint = session.endpoint(),
                filters = carried.len(),
                "re-registered filters with reaper"
            );
        }
        Ok(session)
    }

    async fn connect(&self) -> Result<ReaperSession> {
        let endpoint = match &self.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.provision().await?,
        };
        ReaperSession::connect(
            &endpoint,
            self.config.connect_timeout(),
            self.config.ack_timeout(),
        )
        .await
    }

    /// Find the running sidecar, or start one, and return its endpoint.
    async fn provision(&self) -> Result<String> {
        if let Some(endpoint) = self.discover().await? {
            return Ok(endpoint);
        }

        let id = match self.engine.create(&self.sidecar_spec()).await {
            Ok(id) => id,
            Err(EngineError::Conflict(reason)) => {
                debug!(reason = %reason, "reaper created concurrently, rediscovering");
                return self.discover().await?.ok_or_else(|| {
                    DockyardError::ReaperUnavailable(format!(
                        "{REAPER_CONTAINER_NAME} exists but is not running"
                    ))
                });
            }
            Err(e) => return Err(unavailable(&e)),
        };
        self.engine.start(&id).await.map_err(|e| unavailable(&e))?;
        info!(id = %id, image = %self.config.image, "started reaper sidecar");

        self.endpoint_for(&id).await
    }

    async fn discover(&self) -> Result<Option<String>> {
        let running = self
            .engine
            .list(&ListOptions::running().with_label(LabelFilter::new(LABEL_REAPER, "true")))
            .await
            .map_err(|e| unavailable(&e))?;

        match running.first() {
            Some(summary) => {
                debug!(id = %summary.id, "found running reaper");
                self.endpoint_for(&summary.container_id()).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn endpoint_for(&self, id: &ContainerId) -> Result<String> {
        let status = self.engine.inspect(id).await.map_err(|e| unavailable(&e))?;
        let port = status.host_port(REAPER_PORT).ok_or_else(|| {
            DockyardError::ReaperUnavailable(format!("reaper {id} publishes no port {REAPER_PORT}"))
        })?;

        let target = WaitTarget::new(self.engine.clone(), &status, vec![REAPER_PORT]);
        HostPortWaitStrategy::ports([REAPER_PORT])
            .wait_until_ready(&target, self.config.connect_timeout())
            .await
            .map_err(|e| DockyardError::ReaperUnavailable(e.to_string()))?;

        Ok(format!("{}:{port}", self.engine.host()))
    }

    fn sidecar_spec(&self) -> ContainerSpec {
        let mut spec = ContainerSpec::new(&self.config.image)
            .with_name(REAPER_CONTAINER_NAME)
            .with_exposed_port(REAPER_PORT)
            .with_mount(VolumeMount::bind(DOCKER_SOCKET, DOCKER_SOCKET))
            .auto_remove();
        if self.config.privileged {
            spec = spec.privileged();
        }
        spec.labels = HashMap::from([
            (LABEL_REAPER.to_string(), "true".to_string()),
            (LABEL_MANAGED.to_string(), "true".to_string()),
        ]);
        spec
    }
}

fn shared_key(engine: &dyn ContainerEngine, config: &ReaperConfig) -> String {
    let target = config.endpoint.as_deref().unwrap_or(&config.image);
    format!("{}|{target}", engine.host())
}

fn unavailable(e: &EngineError) -> DockyardError {
    DockyardError::ReaperUnavailable(e.to_string())
}
