//! Readiness checks for started containers.
//!
//! A [`WaitStrategy`] answers one question per poll: is the container usable
//! yet? [`poll_until_ready`] drives that check against a deadline. Every
//! strategy has its own timeout and poll interval; composites live in
//! [`all`].

pub mod all;
pub mod health;
pub mod http;
pub mod log;
pub mod port;
pub mod shell;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::{
    ContainerEngine, ContainerId, ContainerState, ContainerStatus, EngineResult, ExecOptions,
    ExecResult, LogsOptions, PortBinding,
};

pub use all::{WaitAllMode, WaitAllStrategy};
pub use health::HealthCheckWaitStrategy;
pub use http::HttpWaitStrategy;
pub use log::LogMessageWaitStrategy;
pub use port::HostPortWaitStrategy;
pub use shell::ShellWaitStrategy;

/// Startup timeout used when neither the strategy nor the configuration sets one.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between two readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised while waiting for readiness.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The strategy did not observe readiness before its deadline.
    #[error("{strategy} not ready after {elapsed:?}: {detail}")]
    Timeout {
        /// Strategy name.
        strategy: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Last reason the check gave for not being ready.
        detail: String,
    },

    /// The strategy hit an error that more polling cannot fix.
    #[error("{strategy} failed: {reason}")]
    Failed {
        /// Strategy name.
        strategy: String,
        /// Failure reason.
        reason: String,
    },

    /// The strategy was configured with invalid parameters.
    #[error("invalid wait strategy: {0}")]
    InvalidConfig(String),
}

impl WaitError {
    /// Name of the strategy that raised the error.
    #[must_use]
    pub fn strategy(&self) -> &str {
        match self {
            Self::Timeout { strategy, .. } | Self::Failed { strategy, .. } => strategy,
            Self::InvalidConfig(_) => "unknown",
        }
    }
}

/// Outcome of a single readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The container is usable.
    Ready,

    /// Not yet; keep polling. Carries the reason for diagnostics.
    NotReady(String),

    /// Give up now.
    Failed(String),
}

/// Boxed future returned by [`WaitStrategy::wait_until_ready`].
pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = Result<(), WaitError>> + Send + 'a>>;

/// Boxed future returned by [`WaitStrategy::check_ready`].
pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = Readiness> + Send + 'a>>;

/// A readiness predicate evaluated against a started container.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Timeout configured on this strategy, if any.
    fn startup_timeout(&self) -> Option<Duration>;

    /// Delay between checks.
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Run one check.
    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a>;

    /// Poll until ready, failed, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] or [`WaitError::Failed`].
    fn wait_until_ready<'a>(&'a self, target: &'a WaitTarget, timeout: Duration) -> WaitFuture<'a> {
        Box::pin(poll_until_ready(self, target, timeout))
    }
}

/// Timeout a strategy runs with against `target`.
#[must_use]
pub fn effective_timeout(strategy: &dyn WaitStrategy, target: &WaitTarget) -> Duration {
    strategy
        .startup_timeout()
        .unwrap_or_else(|| target.default_timeout())
}

/// Call `check_ready` until it succeeds, fails, or the deadline passes.
///
/// The deadline is checked between polls; an in-flight check is never
/// interrupted.
///
/// # Errors
///
/// Returns [`WaitError::Timeout`] when the deadline passes and
/// [`WaitError::Failed`] as soon as a check reports failure.
pub async fn poll_until_ready<S>(
    strategy: &S,
    target: &WaitTarget,
    timeout: Duration,
) -> Result<(), WaitError>
where
    S: WaitStrategy + ?Sized,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        match strategy.check_ready(target).await {
            Readiness::Ready => {
                debug!(
                    id = %target.id(),
                    strategy = strategy.name(),
                    polls,
                    elapsed = ?started.elapsed(),
                    "container ready"
                );
                return Ok(());
            }
            Readiness::Failed(reason) => {
                return Err(WaitError::Failed {
                    strategy: strategy.name().to_string(),
                    reason,
                });
            }
            Readiness::NotReady(reason) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(WaitError::Timeout {
                        strategy: strategy.name().to_string(),
                        elapsed: now - started,
                        detail: reason,
                    });
                }
                trace!(id = %target.id(), strategy = strategy.name(), reason = %reason, "not ready");
                tokio::time::sleep(strategy.poll_interval().min(deadline - now)).await;
            }
        }
    }
}

/// Everything a strategy needs to probe one container.
#[derive(Clone)]
pub struct WaitTarget {
    engine: Arc<dyn ContainerEngine>,
    id: ContainerId,
    host: String,
    exposed_ports: Vec<u16>,
    ports: Vec<PortBinding>,
    default_timeout: Duration,
}

impl fmt::Debug for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTarget")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("exposed_ports", &self.exposed_ports)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl WaitTarget {
    /// Target a started container, using the ports from its inspection.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        status: &ContainerStatus,
        exposed_ports: Vec<u16>,
    ) -> Self {
        Self {
            host: engine.host(),
            engine,
            id: status.container_id(),
            exposed_ports,
            ports: status.ports.clone(),
            default_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Timeout for strategies that do not set their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Container being probed.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Host where published ports are reachable.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Container ports the spec exposed, in declaration order.
    #[must_use]
    pub fn exposed_ports(&self) -> &[u16] {
        &self.exposed_ports
    }

    /// Host port published for a container port.
    #[must_use]
    pub fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .filter(|p| p.container_port == container_port && p.protocol == "tcp")
            .find_map(|p| p.host_port)
    }

    /// Timeout for strategies that do not set their own.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Current engine view of the container.
    pub async fn inspect(&self) -> EngineResult<ContainerStatus> {
        self.engine.inspect(&self.id).await
    }

    /// Full stdout and stderr so far.
    pub async fn logs(&self) -> EngineResult<String> {
        let bytes = self.engine.logs(&self.id, &LogsOptions::all()).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Run a command inside the container.
    pub async fn exec(&self, options: &ExecOptions) -> EngineResult<ExecResult> {
        self.engine.exec(&self.id, options).await
    }

    /// Reason to stop waiting if the container is no longer alive.
    pub(crate) async fn exit_reason(&self) -> Option<String> {
        match self.inspect().await {
            Ok(status) => match status.state {
                ContainerState::Exited | ContainerState::Dead | ContainerState::Removing => {
                    Some(match status.exit_code {
                        Some(code) => format!("container exited with code {code}"),
                        None => format!("container is {}", status.state),
                    })
                }
                _ => None,
            },
            Err(e) if e.is_not_found() => Some("container no longer exists".to_string()),
            Err(_) => None,
        }
    }
}

/// Factory for the built-in strategies.
pub struct Wait;

impl Wait {
    /// Ready when the engine reports the container healthy.
    #[must_use]
    pub fn healthcheck() -> HealthCheckWaitStrategy {
        HealthCheckWaitStrategy::new()
    }

    /// Ready when the logs match `pattern` once.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::InvalidConfig`] if the pattern does not compile.
    pub fn log_message(pattern: &str) -> Result<LogMessageWaitStrategy, WaitError> {
        LogMessageWaitStrategy::new(pattern)
    }

    /// Ready when the logs contain `text` literally.
    #[must_use]
    pub fn log_contains(text: &str) -> LogMessageWaitStrategy {
        LogMessageWaitStrategy::literal(text)
    }

    /// Ready when every exposed port accepts a TCP connection.
    #[must_use]
    pub fn ports() -> HostPortWaitStrategy {
        HostPortWaitStrategy::all_exposed()
    }

    /// Ready when the given container ports accept a TCP connection.
    #[must_use]
    pub fn port(ports: impl IntoIterator<Item = u16>) -> HostPortWaitStrategy {
        HostPortWaitStrategy::ports(ports)
    }

    /// Ready when an HTTP request to `path` returns 200.
    #[must_use]
    pub fn http(path: impl Into<String>) -> HttpWaitStrategy {
        HttpWaitStrategy::new(path)
    }

    /// Ready when a shell command exits 0 inside the container.
    #[must_use]
    pub fn shell(command: impl Into<String>) -> ShellWaitStrategy {
        ShellWaitStrategy::new(command)
    }

    /// Composite strategy evaluated in order.
    #[must_use]
    pub fn all(mode: WaitAllMode) -> WaitAllStrategy {
        WaitAllStrategy::new(mode)
    }
}

/// Strategy applied when a request does not name one.
#[must_use]
pub fn default_strategy() -> Box<dyn WaitStrategy> {
    Box::new(HostPortWaitStrategy::all_exposed())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::spec::ContainerSpec;

    /// Create and start a container on a fresh memory engine.
    pub(crate) async fn started(spec: ContainerSpec) -> (Arc<MemoryEngine>, WaitTarget) {
        let engine = Arc::new(MemoryEngine::new());
        let target = start_on(&engine, spec).await;
        (engine, target)
    }

    /// Create and start a container on `engine`.
    pub(crate) async fn start_on(engine: &Arc<MemoryEngine>, spec: ContainerSpec) -> WaitTarget {
        let id = engine.create(&spec).await.expect("create");
        engine.start(&id).await.expect("start");
        let status = engine.inspect(&id).await.expect("inspect");
        let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
        WaitTarget::new(dyn_engine, &status, spec.exposed_ports.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::started;
    use super::*;
    use crate::spec::ContainerSpec;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct ReadyOnPoll {
        ready_on: u32,
        polls: AtomicU32,
    }

    impl WaitStrategy for ReadyOnPoll {
        fn name(&self) -> &'static str {
            "ready-on-poll"
        }

        fn startup_timeout(&self) -> Option<Duration> {
            None
        }

        fn check_ready<'a>(&'a self, _target: &'a WaitTarget) -> CheckFuture<'a> {
            Box::pin(async move {
                let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
                if poll >= self.ready_on {
                    Readiness::Ready
                } else {
                    Readiness::NotReady(format!("poll {poll}"))
                }
            })
        }
    }

    #[derive(Debug)]
    struct AlwaysFails;

    impl WaitStrategy for AlwaysFails {
        fn name(&self) -> &'static str {
            "always-fails"
        }

        fn startup_timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }

        fn check_ready<'a>(&'a self, _target: &'a WaitTarget) -> CheckFuture<'a> {
            Box::pin(async { Readiness::Failed("boom".to_string()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready_polls_until_success() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let strategy = ReadyOnPoll {
            ready_on: 5,
            polls: AtomicU32::new(0),
        };

        let started = Instant::now();
        poll_until_ready(&strategy, &target, Duration::from_secs(10))
            .await
            .expect("ready");

        assert_eq!(strategy.polls.load(Ordering::SeqCst), 5);
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_POLL_INTERVAL * 4);
        assert!(elapsed < DEFAULT_POLL_INTERVAL * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready_times_out_with_last_reason() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let strategy = ReadyOnPoll {
            ready_on: u32::MAX,
            polls: AtomicU32::new(0),
        };

        let err = poll_until_ready(&strategy, &target, Duration::from_secs(1))
            .await
            .expect_err("timeout");

        match err {
            WaitError::Timeout {
                strategy,
                elapsed,
                detail,
            } => {
                assert_eq!(strategy, "ready-on-poll");
                assert!(elapsed >= Duration::from_secs(1));
                assert!(elapsed < Duration::from_millis(1100));
                assert!(detail.starts_with("poll "));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_check_stops_polling_immediately() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let started = Instant::now();

        let err = AlwaysFails
            .wait_until_ready(&target, Duration::from_secs(5))
            .await
            .expect_err("failed");

        assert!(matches!(err, WaitError::Failed { ref reason, .. } if reason == "boom"));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_effective_timeout_falls_back_to_target_default() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let target = target.with_default_timeout(Duration::from_secs(7));

        let strategy = ReadyOnPoll {
            ready_on: 1,
            polls: AtomicU32::new(0),
        };
        assert_eq!(effective_timeout(&strategy, &target), Duration::from_secs(7));
        assert_eq!(
            effective_timeout(&AlwaysFails, &target),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_target_reports_exit_reason() {
        let (engine, target) = started(ContainerSpec::new("alpine")).await;
        assert_eq!(target.exit_reason().await, None);

        engine.set_state(target.id(), ContainerState::Exited, Some(3));
        assert_eq!(
            target.exit_reason().await.as_deref(),
            Some("container exited with code 3")
        );
    }
}
