//! System labels and the per-process session identity.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix reserved for labels written by this library.
pub const RESERVED_LABEL_PREFIX: &str = "testcontainers.";

/// Marks a resource as managed by this library.
pub const LABEL_MANAGED: &str = "testcontainers.managed";

/// Session that created the resource.
pub const LABEL_SESSION_ID: &str = "testcontainers.session-id";

/// Reuse fingerprint of the spec the container was created from.
pub const LABEL_REUSE_HASH: &str = "testcontainers.reuse-hash";

/// Digest of the files staged into the container.
pub const LABEL_COPIED_FILES_HASH: &str = "testcontainers.copied-files-hash";

/// Library version that created the resource.
pub const LABEL_VERSION: &str = "testcontainers.version";

/// Marks the reaper sidecar itself.
pub const LABEL_REAPER: &str = "testcontainers.reaper";

static SESSION_ID: Lazy<SessionId> = Lazy::new(SessionId::generate);

/// Identifier shared by every resource one process creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The session ID of this process, created on first use.
    #[must_use]
    pub fn current() -> Self {
        *SESSION_ID
    }

    /// Label filter selecting every resource of this session.
    #[must_use]
    pub fn filter(&self) -> LabelFilter {
        LabelFilter::new(LABEL_SESSION_ID, self.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A `key=value` label selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelFilter {
    /// Label key.
    pub key: String,

    /// Required label value.
    pub value: String,
}

impl LabelFilter {
    /// Create a filter.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether a label set satisfies this filter.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| *v == self.value)
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for LabelFilter {
    type Err = String;

    /// Parse `key=value`. The value may itself contain `=`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self::new(key, value)),
            _ => Err(format!("expected key=value, got {s:?}")),
        }
    }
}

/// Labels every managed resource of `session` carries.
#[must_use]
pub fn system_labels(session: SessionId) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_SESSION_ID.to_string(), session.to_string()),
        (
            LABEL_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}
