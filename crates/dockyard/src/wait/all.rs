//! Composite strategy running children one after another.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{CheckFuture, Readiness, WaitError, WaitFuture, WaitStrategy, WaitTarget};

/// How a [`WaitAllStrategy`] bounds the time its children may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAllMode {
    /// Every child runs with this timeout in place of its own.
    OuterTimeout(Duration),

    /// Every child runs with its own timeout; no overall bound.
    IndividualTimeoutsOnly,

    /// Children keep their own timeouts but the whole sequence must finish
    /// within this bound.
    MaximumOuterTimeout(Duration),
}

/// Ready once every child strategy is ready, checked in insertion order.
///
/// The first child error aborts the sequence.
#[derive(Debug)]
pub struct WaitAllStrategy {
    mode: WaitAllMode,
    strategies: Vec<Box<dyn WaitStrategy>>,
}

impl WaitAllStrategy {
    /// Empty composite. Always ready until children are added.
    #[must_use]
    pub fn new(mode: WaitAllMode) -> Self {
        Self {
            mode,
            strategies: Vec::new(),
        }
    }

    /// Append a child.
    #[must_use]
    pub fn with_strategy(self, strategy: impl WaitStrategy + 'static) -> Self {
        self.with_boxed(Box::new(strategy))
    }

    /// Append an already boxed child.
    #[must_use]
    pub fn with_boxed(mut self, strategy: Box<dyn WaitStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Timeout discipline.
    #[must_use]
    pub fn mode(&self) -> WaitAllMode {
        self.mode
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether there are no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Budget a child gets under the given mode.
    /// Time a child may take, and whether the outer deadline cut it short of
    /// its own timeout.
    fn child_budget(
        &self,
        child: &dyn WaitStrategy,
        fallback: Duration,
        remaining: Option<Duration>,
    ) -> (Duration, bool) {
        let own = child.startup_timeout().unwrap_or(fallback);
        match (self.mode, remaining) {
            (WaitAllMode::OuterTimeout(outer), _) => (outer, false),
            (WaitAllMode::MaximumOuterTimeout(_), Some(remaining)) if remaining < own => {
                (remaining, true)
            }
            _ => (own, false),
        }
    }

    async fn run(&self, target: &WaitTarget, fallback: Duration) -> Result<(), WaitError> {
        let started = Instant::now();
        let deadline = match self.mode {
            WaitAllMode::MaximumOuterTimeout(outer) => Some(started + outer),
            _ => None,
        };

        for (index, child) in self.strategies.iter().enumerate() {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(self.outer_timeout(started, index, "outer deadline reached"));
            }

            let (budget, clamped) = self.child_budget(child.as_ref(), fallback, remaining);
            debug!(
                id = %target.id(),
                child = child.name(),
                index,
                budget = ?budget,
                clamped,
                "waiting on child strategy"
            );

            match child.wait_until_ready(target, budget).await {
                Ok(()) => {}
                Err(WaitError::Timeout { detail, .. }) if clamped => {
                    return Err(self.outer_timeout(started, index, &detail));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn outer_timeout(&self, started: Instant, index: usize, detail: &str) -> WaitError {
        let child = self
            .strategies
            .get(index)
            .map_or("none", |s| s.name());
        WaitError::Timeout {
            strategy: self.name().to_string(),
            elapsed: started.elapsed(),
            detail: format!("child {index} ({child}): {detail}"),
        }
    }
}

impl WaitStrategy for WaitAllStrategy {
    fn name(&self) -> &'static str {
        "wait-all"
    }

    fn startup_timeout(&self) -> Option<Duration> {
        match self.mode {
            WaitAllMode::OuterTimeout(outer) | WaitAllMode::MaximumOuterTimeout(outer) => {
                Some(outer)
            }
            WaitAllMode::IndividualTimeoutsOnly => None,
        }
    }

    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a> {
        Box::pin(async move {
            for child in &self.strategies {
                match child.check_ready(target).await {
                    Readiness::Ready => {}
                    other => return other,
                }
            }
            Readiness::Ready
        })
    }

    /// Children without their own timeout fall back to `timeout` in the
    /// individual and maximum-outer modes.
    fn wait_until_ready<'a>(&'a self, target: &'a WaitTarget, timeout: Duration) -> WaitFuture<'a> {
        let fallback = match self.mode {
            WaitAllMode::IndividualTimeoutsOnly => timeout,
            _ => target.default_timeout(),
        };
        Box::pin(self.run(target, fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ContainerSpec;
    use crate::wait::testing::started;
    use crate::wait::{Wait, WaitAllMode};

    #[derive(Debug)]
    struct NeverReady(Option<Duration>);

    impl WaitStrategy for NeverReady {
        fn name(&self) -> &'static str {
            "never-ready"
        }

        fn startup_timeout(&self) -> Option<Duration> {
            self.0
        }

        fn check_ready<'a>(&'a self, _target: &'a WaitTarget) -> CheckFuture<'a> {
            Box::pin(async { Readiness::NotReady("not yet".to_string()) })
        }
    }

    #[tokio::test]
    async fn test_empty_composite_is_ready() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        Wait::all(WaitAllMode::IndividualTimeoutsOnly)
            .wait_until_ready(&target, Duration::from_secs(1))
            .await
            .expect("ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_individual_child_timeout_propagates_child_error() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let strategy = Wait::all(WaitAllMode::IndividualTimeoutsOnly)
            .with_strategy(NeverReady(Some(Duration::from_secs(2))));

        let err = strategy
            .wait_until_ready(&target, Duration::from_secs(60))
            .await
            .expect_err("timeout");
        assert_eq!(err.strategy(), "never-ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_outer_timeout_reports_composite() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let strategy = Wait::all(WaitAllMode::MaximumOuterTimeout(Duration::from_secs(3)))
            .with_strategy(NeverReady(Some(Duration::from_secs(10))));

        let err = strategy
            .wait_until_ready(&target, Duration::from_secs(60))
            .await
            .expect_err("timeout");
        match err {
            WaitError::Timeout {
                strategy, elapsed, ..
            } => {
                assert_eq!(strategy, "wait-all");
                assert!(elapsed >= Duration::from_secs(3));
                assert!(elapsed < Duration::from_millis(3200));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_check_ready_stops_at_first_unready_child() {
        let (_engine, target) = started(ContainerSpec::new("alpine")).await;
        let strategy = Wait::all(WaitAllMode::IndividualTimeoutsOnly)
            .with_strategy(Wait::ports())
            .with_strategy(NeverReady(None));

        assert_eq!(
            strategy.check_ready(&target).await,
            Readiness::NotReady("not yet".to_string())
        );
    }

    #[test]
    fn test_startup_timeout_per_mode() {
        let outer = Duration::from_secs(15);
        assert_eq!(
            WaitAllStrategy::new(WaitAllMode::OuterTimeout(outer)).startup_timeout(),
            Some(outer)
        );
        assert_eq!(
            WaitAllStrategy::new(WaitAllMode::MaximumOuterTimeout(outer)).startup_timeout(),
            Some(outer)
        );
        assert_eq!(
            WaitAllStrategy::new(WaitAllMode::IndividualTimeoutsOnly).startup_timeout(),
            None
        );
    }
}
