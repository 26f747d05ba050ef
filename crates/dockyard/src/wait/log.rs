//! Wait for a pattern to show up in the container's output.

use std::time::Duration;

use regex::{Regex, RegexBuilder};

use super::{CheckFuture, Readiness, WaitError, WaitStrategy, WaitTarget};

/// Ready once the logs match a regular expression `times` times.
///
/// The whole log is re-read on every poll, so matches are counted over
/// everything the container has printed since it started. `^` and `$` match
/// at line boundaries and `.` matches newlines.
#[derive(Debug, Clone)]
pub struct LogMessageWaitStrategy {
    pattern: Regex,
    times: usize,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl LogMessageWaitStrategy {
    /// Compile `pattern` into a strategy requiring one match.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::InvalidConfig`] if the pattern does not compile.
    pub fn new(pattern: &str) -> Result<Self, WaitError> {
        let pattern = RegexBuilder::new(pattern)
            .multi_line(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| WaitError::InvalidConfig(format!("bad log pattern: {e}")))?;

        Ok(Self::from_regex(pattern))
    }

    /// Match a literal string.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn literal(text: &str) -> Self {
        Self::new(&regex::escape(text)).expect("escaped literal is a valid pattern")
    }

    /// Use a prebuilt regex as is.
    #[must_use]
    pub fn from_regex(pattern: Regex) -> Self {
        Self {
            pattern,
            times: 1,
            timeout: None,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Require the pattern to match at least `times` times.
    #[must_use]
    pub fn with_times(mut self, times: usize) -> Self {
        self.times = times.max(1);
        self
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

    /// Number of matches in `logs`.
    #[must_use]
    pub fn count_matches(&self, logs: &str) -> usize {
        self.pattern.find_iter(logs).count()
    }
}

impl WaitStrategy for LogMessageWaitStrategy {
    fn name(&self) -> &'static str {
        "log-message"
    }

    fn startup_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a> {
        Box::pin(async move {
            let logs = match target.logs().await {
                Ok(logs) => logs,
                Err(e) if e.is_not_found() => {
                    return Readiness::Failed("container no longer exists".to_string());
                }
                Err(e) => return Readiness::NotReady(format!("reading logs failed: {e}")),
            };

            let found = self.count_matches(&logs);
            if found >= self.times {
                return Readiness::Ready;
            }

            if let Some(reason) = target.exit_reason().await {
                return Readiness::Failed(reason);
            }

            Readiness::NotReady(format!(
                "{found} of {} matches for /{}/",
                self.times,
                self.pattern.as_str()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerState, ImageBehavior, MemoryEngine};
    use crate::spec::ContainerSpec;
    use crate::wait::Wait;
    use crate::wait::testing::start_on;
    use std::sync::Arc;
    use test_case::test_case;
    use tokio::time::Instant;

    async fn target_with_logs(logs: &str) -> (Arc<MemoryEngine>, WaitTarget) {
        let engine = Arc::new(
            MemoryEngine::new().with_image("app", ImageBehavior::default().with_logs(logs)),
        );
        let target = start_on(&engine, ContainerSpec::new("app")).await;
        (engine, target)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_matches_required_one_present_times_out() {
        let (_engine, target) = target_with_logs("booting\nready\nserving\n").await;
        let strategy = LogMessageWaitStrategy::new("ready")
            .expect("pattern")
            .with_times(2);

        let err = strategy
            .wait_until_ready(&target, Duration::from_secs(5))
            .await
            .expect_err("one match is not enough");
        match err {
            WaitError::Timeout { detail, elapsed, .. } => {
                assert!(detail.starts_with("1 of 2 matches"));
                assert!(elapsed >= Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_matches_present_ready_without_full_timeout() {
        let (_engine, target) = target_with_logs("ready\nwarming up\nready\n").await;
        let strategy = LogMessageWaitStrategy::new("ready")
            .expect("pattern")
            .with_times(2);

        let started = Instant::now();
        strategy
            .wait_until_ready(&target, Duration::from_secs(5))
            .await
            .expect("ready");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matches_appended_while_waiting() {
        let (engine, target) = target_with_logs("starting\n").await;
        let appender = {
            let engine = engine.clone();
            let id = target.id().clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                engine.append_logs(&id, "Started in 1.2s\n");
            })
        };

        LogMessageWaitStrategy::new(r"Started in \d+\.\d+s")
            .expect("pattern")
            .wait_until_ready(&target, Duration::from_secs(10))
            .await
            .expect("ready");
        appender.await.expect("appender");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_container_fails_fast() {
        let (engine, target) = target_with_logs("fatal: config missing\n").await;
        engine.set_state(target.id(), ContainerState::Exited, Some(1));

        let err = Wait::log_contains("ready")
            .wait_until_ready(&target, Duration::from_secs(30))
            .await
            .expect_err("exited");
        assert!(matches!(err, WaitError::Failed { ref reason, .. } if reason.contains("code 1")));
    }

    #[test_case("^ready$", "booting\nready\n", 1 ; "anchors match per line")]
    #[test_case("start.*done", "start\nmiddle\ndone\n", 1 ; "dot spans newlines")]
    #[test_case("ready", "ready ready ready", 3 ; "counts every occurrence")]
    #[test_case("ready", "nothing yet", 0 ; "no match")]
    fn test_count_matches(pattern: &str, logs: &str, expected: usize) {
        let strategy = LogMessageWaitStrategy::new(pattern).expect("pattern");
        assert_eq!(strategy.count_matches(logs), expected);
    }

    #[test]
    fn test_literal_escapes_metacharacters() {
        let strategy = LogMessageWaitStrategy::literal("listening on [::]:8080 (http)");
        assert_eq!(strategy.count_matches("listening on [::]:8080 (http)\n"), 1);
        assert_eq!(strategy.count_matches("listening on x:8080 http\n"), 0);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(matches!(
            LogMessageWaitStrategy::new("(unclosed"),
            Err(WaitError::InvalidConfig(_))
        ));
    }
}
