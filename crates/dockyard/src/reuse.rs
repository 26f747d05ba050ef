//! Reuse matching: attach to a running container built from the same spec.
//!
//! The fingerprint is a SHA-256 over a canonical JSON rendering of the
//! hashed spec fields. Maps are sorted and port lists deduplicated, so
//! insertion order never changes the result. Labels, names and resource
//! limits are not part of the fingerprint.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::engine::{ContainerEngine, ContainerSummary, ListOptions};
use crate::error::{DockyardError, Result};
use crate::labels::{LABEL_REUSE_HASH, LabelFilter};
use crate::spec::{ContainerSpec, NetworkMode, VolumeMount};

/// Deterministic hash of a container spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReuseFingerprint(String);

#[derive(Serialize)]
struct Canonical<'a> {
    image: &'a str,
    env: BTreeMap<&'a str, &'a str>,
    command: Option<&'a [String]>,
    entrypoint: Option<&'a [String]>,
    exposed_ports: BTreeSet<u16>,
    port_bindings: &'a BTreeMap<u16, u16>,
    working_dir: Option<&'a str>,
    user: Option<&'a str>,
    mounts: BTreeSet<&'a VolumeMount>,
    network_mode: &'a NetworkMode,
    privileged: bool,
    copied_files_hash: Option<&'a str>,
}

impl ReuseFingerprint {
    /// Fingerprint `spec`, mixing in the hash of its staged files.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::InvalidSpec`] if the spec cannot be serialized.
    pub fn compute(spec: &ContainerSpec, copied_files_hash: Option<&str>) -> Result<Self> {
        let canonical = Canonical {
            image: &spec.image,
            env: spec
                .env
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            command: spec.command.as_deref(),
            entrypoint: spec.entrypoint.as_deref(),
            exposed_ports: spec.exposed_ports.iter().copied().collect(),
            port_bindings: &spec.port_bindings,
            working_dir: spec.working_dir.as_deref(),
            user: spec.user.as_deref(),
            mounts: spec.mounts.iter().collect(),
            network_mode: &spec.network_mode,
            privileged: spec.privileged,
            copied_files_hash,
        };

        let json = serde_json::to_vec(&canonical)
            .map_err(|e| DockyardError::InvalidSpec(format!("cannot fingerprint spec: {e}")))?;
        Ok(Self(hex::encode(Sha256::digest(&json))))
    }

    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label filter selecting containers with this fingerprint.
    #[must_use]
    pub fn filter(&self) -> LabelFilter {
        LabelFilter::new(LABEL_REUSE_HASH, self.0.clone())
    }
}

impl fmt::Display for ReuseFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of every staged file's target, mode and contents.
///
/// Returns `None` when the spec stages no files. Host files are read here, so
/// a changed init script yields a different hash.
///
/// # Errors
///
/// Returns [`DockyardError::Io`] if a host file cannot be read.
pub async fn copied_files_hash(spec: &ContainerSpec) -> Result<Option<String>> {
    if spec.files.is_empty() {
        return Ok(None);
    }

    let mut files: Vec<_> = spec.files.iter().collect();
    files.sort_by(|a, b| a.target.cmp(&b.target));

    let mut hasher = Sha256::new();
    for file in files {
        let contents = file.contents().await?;
        hasher.update(file.target.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.mode.to_be_bytes());
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(&contents);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Find the single running container carrying `fingerprint`.
///
/// # Errors
///
/// Returns [`DockyardError::ReuseAmbiguous`] when several containers match,
/// and engine errors from listing.
pub async fn find_reusable(
    engine: &dyn ContainerEngine,
    fingerprint: &ReuseFingerprint,
) -> Result<Option<ContainerSummary>> {
    let mut candidates = engine
        .list(&ListOptions::running().with_label(fingerprint.filter()))
        .await?;
    debug!(%fingerprint, candidates = candidates.len(), "reuse lookup");

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        n => Err(DockyardError::ReuseAmbiguous {
            fingerprint: fingerprint.to_string(),
            candidates: n,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerState, MemoryEngine};
    use crate::spec::CopyToContainer;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn base_spec() -> ContainerSpec {
        ContainerSpec::new("postgres:16")
            .with_env("POSTGRES_USER", "test")
            .with_env("POSTGRES_PASSWORD", "secret")
            .with_exposed_port(5432)
    }

    fn fingerprint(spec: &ContainerSpec) -> ReuseFingerprint {
        ReuseFingerprint::compute(spec, None).expect("fingerprint")
    }

    // ===== Fingerprint Tests =====

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(&base_spec()), fingerprint(&base_spec()));
        assert_eq!(fingerprint(&base_spec()).as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_env_value() {
        let other = base_spec().with_env("POSTGRES_PASSWORD", "other");
        assert_ne!(fingerprint(&base_spec()), fingerprint(&other));
    }

    #[test]
    fn test_fingerprint_changes_with_command_and_image() {
        let base = fingerprint(&base_spec());
        assert_ne!(base, fingerprint(&base_spec().with_command(["postgres", "-c", "fsync=off"])));
        let mut other_image = base_spec();
        other_image.image = "postgres:15".to_string();
        assert_ne!(base, fingerprint(&other_image));
    }

    #[test]
    fn test_fingerprint_ignores_labels_and_name() {
        let labelled = base_spec().with_label("team", "db").with_name("pg-main");
        assert_eq!(fingerprint(&base_spec()), fingerprint(&labelled));
    }

    #[test]
    fn test_fingerprint_includes_files_hash() {
        let spec = base_spec();
        let a = ReuseFingerprint::compute(&spec, Some("aaaa")).expect("fingerprint");
        let b = ReuseFingerprint::compute(&spec, Some("bbbb")).expect("fingerprint");
        assert_ne!(a, b);
        assert_ne!(a, fingerprint(&spec));
    }

    proptest! {
        #[test]
        fn prop_fingerprint_stable_under_reordering(
            env in proptest::collection::hash_map("[A-Z_]{1,8}", "[a-z0-9]{0,8}", 0..8),
            ports in proptest::collection::btree_set(1u16..=65535, 0..6),
        ) {
            let mut forward = ContainerSpec::new("redis:7");
            let mut backward = ContainerSpec::new("redis:7");

            let mut pairs: Vec<_> = env.iter().collect();
            for (k, v) in &pairs {
                forward = forward.with_env(k.as_str(), v.as_str());
            }
            pairs.reverse();
            let mut reversed_env = HashMap::new();
            for (k, v) in pairs {
                reversed_env.insert(k.clone(), v.clone());
            }
            backward = backward.with_envs(reversed_env);

            forward = forward.with_exposed_ports(ports.iter().copied());
            backward = backward.with_exposed_ports(ports.iter().rev().copied());

            prop_assert_eq!(
                ReuseFingerprint::compute(&forward, None).expect("fingerprint"),
                ReuseFingerprint::compute(&backward, None).expect("fingerprint")
            );
        }
    }

    // ===== Copied Files Hash Tests =====

    #[tokio::test]
    async fn test_no_files_no_hash() {
        assert_eq!(copied_files_hash(&base_spec()).await.expect("hash"), None);
    }

    #[tokio::test]
    async fn test_files_hash_ignores_staging_order() {
        let a = CopyToContainer::bytes("/init/a.sql", "create table a();");
        let b = CopyToContainer::bytes("/init/b.sql", "create table b();");

        let one = base_spec().with_file(a.clone()).with_file(b.clone());
        let two = base_spec().with_file(b).with_file(a);
        assert_eq!(
            copied_files_hash(&one).await.expect("hash"),
            copied_files_hash(&two).await.expect("hash")
        );
    }

    #[tokio::test]
    async fn test_files_hash_tracks_host_file_contents() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"select 1;").expect("write");
        let spec = base_spec().with_file(CopyToContainer::host_file(file.path(), "/init.sql"));
        let before = copied_files_hash(&spec).await.expect("hash");

        file.write_all(b" select 2;").expect("write");
        let after = copied_files_hash(&spec).await.expect("hash");
        assert!(before.is_some());
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_files_hash_tracks_mode() {
        let plain = base_spec().with_file(CopyToContainer::bytes("/run.sh", "echo hi"));
        let exec = base_spec().with_file(CopyToContainer::bytes("/run.sh", "echo hi").with_mode(0o755));
        assert_ne!(
            copied_files_hash(&plain).await.expect("hash"),
            copied_files_hash(&exec).await.expect("hash")
        );
    }

    #[tokio::test]
    async fn test_missing_host_file_is_io_error() {
        let spec = base_spec().with_file(CopyToContainer::host_file("/nonexistent/init.sql", "/init.sql"));
        assert!(matches!(
            copied_files_hash(&spec).await,
            Err(DockyardError::Io(_))
        ));
    }

    // ===== Find Reusable Tests =====

    fn labelled(fingerprint: &ReuseFingerprint) -> HashMap<String, String> {
        HashMap::from([(LABEL_REUSE_HASH.to_string(), fingerprint.to_string())])
    }

    #[tokio::test]
    async fn test_find_reusable_single_running_match() {
        let engine = MemoryEngine::new();
        let fp = fingerprint(&base_spec());
        let id = engine.seed_container("postgres:16", labelled(&fp), ContainerState::Running);
        engine.seed_container("postgres:16", HashMap::new(), ContainerState::Running);

        let found = find_reusable(&engine, &fp).await.expect("lookup");
        assert_eq!(found.map(|c| c.container_id()), Some(id));
    }

    #[tokio::test]
    async fn test_find_reusable_ignores_stopped_candidates() {
        let engine = MemoryEngine::new();
        let fp = fingerprint(&base_spec());
        engine.seed_container("postgres:16", labelled(&fp), ContainerState::Exited);

        assert!(find_reusable(&engine, &fp).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_find_reusable_rejects_ambiguous_matches() {
        let engine = MemoryEngine::new();
        let fp = fingerprint(&base_spec());
        engine.seed_container("postgres:16", labelled(&fp), ContainerState::Running);
        engine.seed_container("postgres:16", labelled(&fp), ContainerState::Running);

        let err = find_reusable(&engine, &fp).await.expect_err("ambiguous");
        assert!(matches!(err, DockyardError::ReuseAmbiguous { candidates: 2, .. }));
    }
}
