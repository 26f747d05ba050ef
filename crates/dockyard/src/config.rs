//! Process-wide configuration.
//!
//! Values are layered, lowest precedence first:
//! - built-in defaults
//! - a TOML file (`./testcontainers.toml`, then
//!   `~/.testcontainers/testcontainers.toml`)
//! - `TESTCONTAINERS_*` environment variables
//! - builder overrides in code

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DockyardError, Result};

/// Config file name looked up in the working directory and home directory.
pub const CONFIG_FILE_NAME: &str = "testcontainers.toml";

/// Reaper image used when none is configured.
pub const DEFAULT_REAPER_IMAGE: &str = "dockyard/reaper:0.1";

/// Disable the reaper.
pub const ENV_REAPER_DISABLED: &str = "TESTCONTAINERS_RYUK_DISABLED";
/// Reaper image override.
pub const ENV_REAPER_IMAGE: &str = "TESTCONTAINERS_REAPER_IMAGE";
/// Connect to a running reaper at `host:port` instead of provisioning one.
pub const ENV_REAPER_ENDPOINT: &str = "TESTCONTAINERS_REAPER_ENDPOINT";
/// Startup attempts per container.
pub const ENV_STARTUP_ATTEMPTS: &str = "TESTCONTAINERS_STARTUP_ATTEMPTS";
/// Default startup timeout in seconds.
pub const ENV_STARTUP_TIMEOUT: &str = "TESTCONTAINERS_STARTUP_TIMEOUT";
/// Allow container reuse.
pub const ENV_REUSE_ENABLE: &str = "TESTCONTAINERS_REUSE_ENABLE";

/// Reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaperConfig {
    /// Skip crash-safe cleanup entirely.
    pub disabled: bool,
    /// Image the reaper sidecar runs.
    pub image: String,
    /// Existing reaper to connect to (`host:port`).
    pub endpoint: Option<String>,
    /// Timeout for the TCP connect in seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for each filter acknowledgement in seconds.
    pub ack_timeout_secs: u64,
    /// Run the sidecar privileged (needed on some SELinux hosts).
    pub privileged: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            image: DEFAULT_REAPER_IMAGE.to_string(),
            endpoint: None,
            connect_timeout_secs: 10,
            ack_timeout_secs: 5,
            privileged: false,
        }
    }
}

impl ReaperConfig {
    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Acknowledgement timeout.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Startup policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StartupConfig {
    /// Attempts per container start (at least 1).
    pub attempts: u32,
    /// Readiness timeout for strategies that do not set their own.
    pub timeout_secs: u64,
    /// Whether readiness failures consume a startup attempt.
    pub retry_on_readiness_failure: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            timeout_secs: 60,
            retry_on_readiness_failure: false,
        }
    }
}

impl StartupConfig {
    /// Default readiness timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reuse settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReuseConfig {
    /// Environment-level gate; requests must also opt in.
    pub enabled: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockyardConfig {
    /// Reaper settings.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Startup policy.
    #[serde(default)]
    pub startup: StartupConfig,
    /// Reuse settings.
    #[serde(default)]
    pub reuse: ReuseConfig,
}

impl DockyardConfig {
    /// Load from the first config file found, then apply the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but is invalid, or if the
    /// environment holds unparsable values.
    pub fn load() -> Result<Self> {
        let mut config = match Self::search_paths().into_iter().find(|p| p.is_file()) {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Candidate config files in lookup order.
    #[must_use]
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".testcontainers").join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DockyardError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DockyardError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment, read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_REAPER_DISABLED) {
            self.reaper.disabled = parse_flag(&value);
        }
        if let Some(value) = lookup(ENV_REAPER_IMAGE) {
            self.reaper.image = value;
        }
        if let Some(value) = lookup(ENV_REAPER_ENDPOINT) {
            self.reaper.endpoint = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(value) = lookup(ENV_STARTUP_ATTEMPTS) {
            self.startup.attempts = parse_number(ENV_STARTUP_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_STARTUP_TIMEOUT) {
            self.startup.timeout_secs = parse_number(ENV_STARTUP_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_REUSE_ENABLE) {
            self.reuse.enabled = parse_flag(&value);
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.startup.attempts == 0 {
            return Err(DockyardError::Config(
                "startup.attempts must be at least 1".to_string(),
            ));
        }

        if self.startup.timeout_secs == 0 {
            return Err(DockyardError::Config(
                "startup.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !self.reaper.disabled && self.reaper.endpoint.is_none() && self.reaper.image.is_empty() {
            return Err(DockyardError::Config(
                "reaper.image cannot be empty".to_string(),
            ));
        }

        if self.reaper.connect_timeout_secs == 0 || self.reaper.ack_timeout_secs == 0 {
            return Err(DockyardError::Config(
                "reaper timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Disable the reaper.
    #[must_use]
    pub fn without_reaper(mut self) -> Self {
        self.reaper.disabled = true;
        self
    }

    /// Connect to an already running reaper.
    #[must_use]
    pub fn with_reaper_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.reaper.endpoint = Some(endpoint.into());
        self
    }

    /// Set startup attempts.
    #[must_use]
    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup.attempts = attempts;
        self
    }

    /// Set the default readiness timeout.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Let readiness failures consume startup attempts.
    #[must_use]
    pub fn with_retry_on_readiness_failure(mut self, retry: bool) -> Self {
        self.startup.retry_on_readiness_failure = retry;
        self
    }

    /// Allow reuse.
    #[must_use]
    pub fn with_reuse(mut self, enabled: bool) -> Self {
        self.reuse.enabled = enabled;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DockyardError::Config(format!("{key} must be a number, got {value:?}")))
}
