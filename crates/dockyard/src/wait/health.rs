//! Wait for the engine's own health check to report healthy.

use std::time::Duration;

use super::{CheckFuture, Readiness, WaitStrategy, WaitTarget};
use crate::engine::{ContainerState, HealthStatus};

/// Ready when the container's engine-side health check reports healthy.
#[derive(Debug, Clone)]
pub struct HealthCheckWaitStrategy {
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl Default for HealthCheckWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCheckWaitStrategy {
    /// Create the strategy with a one second poll interval.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Override the startup timeout.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl WaitStrategy for HealthCheckWaitStrategy {
    fn name(&self) -> &'static str {
        "health-check"
    }

    fn startup_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a> {
        Box::pin(async move {
            let status = match target.inspect().await {
                Ok(status) => status,
                Err(e) if e.is_not_found() => {
                    return Readiness::Failed("container no longer exists".to_string());
                }
                Err(e) => return Readiness::NotReady(format!("inspect failed: {e}")),
            };

            if status.state.is_terminal() {
                return Readiness::Failed(match status.exit_code {
                    Some(code) => format!("container exited with code {code}"),
                    None => format!("container is {}", status.state),
                });
            }

            match status.health {
                HealthStatus::Healthy => Readiness::Ready,
                HealthStatus::None if status.state == ContainerState::Running => {
                    Readiness::Failed("container has no health check configured".to_string())
                }
                other => Readiness::NotReady(format!("health is {other}")),
            }
        })
    }
}
