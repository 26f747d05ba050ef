//! Wait for a command run inside the container to succeed.

use std::time::Duration;

use super::{CheckFuture, Readiness, WaitStrategy, WaitTarget};
use crate::engine::ExecOptions;

/// Ready when `/bin/sh -c <command>` exits 0 inside the container.
#[derive(Debug, Clone)]
pub struct ShellWaitStrategy {
    exec: ExecOptions,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl ShellWaitStrategy {
    /// Run `command` through the container's shell.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self::exec(ExecOptions::shell(command))
    }

    /// Run an explicit exec request.
    #[must_use]
    pub fn exec(exec: ExecOptions) -> Self {
        Self {
            exec,
            timeout: None,
            poll_interval: Duration::from_millis(500),
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

impl WaitStrategy for ShellWaitStrategy {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn startup_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a> {
        Box::pin(async move {
            match target.exec(&self.exec).await {
                Ok(result) if result.success() => Readiness::Ready,
                Ok(result) => Readiness::NotReady(format!(
                    "command exited with code {}",
                    result.exit_code
                )),
                Err(e) => match target.exit_reason().await {
                    Some(reason) => Readiness::Failed(reason),
                    None => Readiness::NotReady(format!("exec failed: {e}")),
                },
            }
        })
    }
}
