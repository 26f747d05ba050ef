//! What to start and how to decide it is ready.

use std::time::Duration;

use crate::spec::ContainerSpec;
use crate::wait::{self, WaitStrategy};

/// A container spec plus its startup policy.
///
/// Unset policy fields fall back to the orchestrator's configuration.
#[derive(Debug)]
pub struct ContainerRequest {
    pub(crate) spec: ContainerSpec,
    pub(crate) wait: Box<dyn WaitStrategy>,
    pub(crate) startup_attempts: Option<u32>,
    pub(crate) startup_timeout: Option<Duration>,
    pub(crate) reuse: bool,
    pub(crate) retry_on_readiness_failure: Option<bool>,
}

impl ContainerRequest {
    /// Request for `spec`, waiting on every exposed port.
    #[must_use]
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            wait: wait::default_strategy(),
            startup_attempts: None,
            startup_timeout: None,
            reuse: false,
            retry_on_readiness_failure: None,
        }
    }

    /// The container spec.
    #[must_use]
    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// The readiness strategy.
    #[must_use]
    pub fn wait_strategy(&self) -> &dyn WaitStrategy {
        self.wait.as_ref()
    }

    /// Whether reuse was requested.
    #[must_use]
    pub fn reuse_requested(&self) -> bool {
        self.reuse
    }

    /// Decide readiness with `strategy`.
    #[must_use]
    pub fn waiting_for(self, strategy: impl WaitStrategy + 'static) -> Self {
        self.waiting_for_boxed(Box::new(strategy))
    }

    /// Decide readiness with an already boxed strategy.
    #[must_use]
    pub fn waiting_for_boxed(mut self, strategy: Box<dyn WaitStrategy>) -> Self {
        self.wait = strategy;
        self
    }

    /// Allow up to `attempts` starts (minimum 1).
    #[must_use]
    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = Some(attempts.max(1));
        self
    }

    /// Readiness timeout for strategies without their own.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Attach to a matching running container when reuse is enabled.
    #[must_use]
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Let readiness failures consume startup attempts.
    #[must_use]
    pub fn retry_on_readiness_failure(mut self, retry: bool) -> Self {
        self.retry_on_readiness_failure = Some(retry);
        self
    }
}

impl From<ContainerSpec> for ContainerRequest {
    fn from(spec: ContainerSpec) -> Self {
        Self::new(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::Wait;

    #[test]
    fn test_defaults() {
        let request = ContainerRequest::new(ContainerSpec::new("redis:7"));
        assert_eq!(request.wait_strategy().name(), "host-port");
        assert!(request.startup_attempts.is_none());
        assert!(!request.reuse_requested());
    }

    #[test]
    fn test_builders() {
        let request = ContainerRequest::from(ContainerSpec::new("redis:7"))
            .waiting_for(Wait::log_contains("Ready to accept connections"))
            .with_startup_attempts(0)
            .with_startup_timeout(Duration::from_secs(5))
            .with_reuse(true)
            .retry_on_readiness_failure(true);

        assert_eq!(request.wait_strategy().name(), "log-message");
        assert_eq!(request.startup_attempts, Some(1));
        assert_eq!(request.startup_timeout, Some(Duration::from_secs(5)));
        assert!(request.reuse_requested());
        assert_eq!(request.retry_on_readiness_failure, Some(true));
    }
}
