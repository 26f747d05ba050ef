//! Removal of everything a disconnected session left behind.

use std::sync::Arc;

use dockyard::engine::{ContainerEngine, EngineError, ListOptions, NetworkId, RemoveOptions};
use dockyard::reaper::protocol::Selector;
use tracing::{debug, info, warn};

use crate::error::ReaperResult;

/// Attempts per resource before giving up.
const REMOVE_ATTEMPTS: u32 = 2;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Containers removed (or already gone).
    pub containers: usize,
    /// Networks removed (or already gone).
    pub networks: usize,
    /// Resources that could not be removed.
    pub failed: Vec<String>,
}

impl SweepReport {
    /// Whether every matched resource is gone.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes containers and networks matching a selector.
#[derive(Clone)]
pub struct Sweeper {
    engine: Arc<dyn ContainerEngine>,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper").finish_non_exhaustive()
    }
}

impl Sweeper {
    /// Sweeper backed by `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Remove every container, then every network, carrying every label in
    /// `filter`.
    ///
    /// Containers go first so that their networks are no longer in use.
    ///
    /// # Errors
    ///
    /// Returns an error only if listing fails; per-resource failures are
    /// reported in [`SweepReport::failed`].
    pub async fn sweep(&self, filter: &Selector) -> ReaperResult<SweepReport> {
        let mut report = SweepReport::default();

        let listing = filter
            .filters()
            .iter()
            .cloned()
            .fold(ListOptions::all(), ListOptions::with_label);
        let containers = self.engine.list(&listing).await?;
        let options = RemoveOptions::force();
        for summary in containers {
            let id = summary.container_id();
            match retry(|| self.engine.remove(&id, &options)).await {
                Ok(()) => report.containers += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "failed to remove container");
                    report.failed.push(id.to_string());
                }
            }
        }

        let networks = self
            .engine
            .list_networks(filter.filters())
            .await?;
        for network in networks {
            let id = NetworkId::new(&network.id);
            match retry(|| self.engine.remove_network(&id)).await {
                Ok(()) => report.networks += 1,
                Err(e) => {
                    warn!(network = %network.name, error = %e, "failed to remove network");
                    report.failed.push(network.id.clone());
                }
            }
        }

        info!(
            %filter,
            containers = report.containers,
            networks = report.networks,
            failed = report.failed.len(),
            "sweep finished"
        );
        Ok(report)
    }
}

/// Run a removal, treating "already gone" as success and retrying once.
async fn retry<F, Fut>(mut remove: F) -> Result<(), EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), EngineError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match remove().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("resource already gone");
                return Ok(());
            }
            Err(e) if attempt < REMOVE_ATTEMPTS => {
                debug!(error = %e, attempt, "removal failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard::engine::{ContainerState, MemoryEngine};
    use dockyard::labels::LabelFilter;
    use std::collections::HashMap;

    const SESSION_KEY: &str = "testcontainers.session-id";

    fn labels(session: &str) -> HashMap<String, String> {
        HashMap::from([(SESSION_KEY.to_string(), session.to_string())])
    }

    fn session(id: &str) -> Selector {
        LabelFilter::new(SESSION_KEY, id).into()
    }

    fn sweeper(engine: &Arc<MemoryEngine>) -> Sweeper {
        let engine: Arc<dyn ContainerEngine> = engine.clone();
        Sweeper::new(engine)
    }

    // ===== Sweep Tests =====

    #[tokio::test]
    async fn test_sweep_removes_only_matching_resources() {
        let engine = Arc::new(MemoryEngine::new());
        engine.seed_container("redis", labels("dead"), ContainerState::Running);
        engine.seed_container("redis", labels("dead"), ContainerState::Exited);
        let survivor = engine.seed_container("redis", labels("alive"), ContainerState::Running);
        engine.seed_network("dead-net", labels("dead"));
        engine.seed_network("alive-net", labels("alive"));

        let report = sweeper(&engine)
            .sweep(&session("dead"))
            .await
            .expect("sweep");

        assert_eq!(report.containers, 2);
        assert_eq!(report.networks, 1);
        assert!(report.is_clean());
        let remaining: Vec<_> = engine.containers().into_iter().map(|c| c.id).collect();
        assert_eq!(remaining, vec![survivor.as_str().to_string()]);
        let networks: Vec<_> = engine.networks().into_iter().map(|n| n.name).collect();
        assert_eq!(networks, vec!["alive-net".to_string()]);
    }

    #[tokio::test]
    async fn test_compound_selector_needs_every_label() {
        let engine = Arc::new(MemoryEngine::new());
        let mut web = labels("dead");
        web.insert("app".to_string(), "web".to_string());
        let mut db = labels("dead");
        db.insert("app".to_string(), "db".to_string());
        engine.seed_container("nginx", web, ContainerState::Running);
        let db_id = engine.seed_container("postgres", db, ContainerState::Running);

        let selector = Selector::all_of([
            LabelFilter::new(SESSION_KEY, "dead"),
            LabelFilter::new("app", "web"),
        ])
        .expect("non-empty");
        let report = sweeper(&engine).sweep(&selector).await.expect("sweep");

        assert_eq!(report.containers, 1);
        let remaining: Vec<_> = engine.containers().into_iter().map(|c| c.id).collect();
        assert_eq!(remaining, vec![db_id.as_str().to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_to_remove() {
        let engine = Arc::new(MemoryEngine::new());
        let report = sweeper(&engine)
            .sweep(&session("nobody"))
            .await
            .expect("sweep");
        assert_eq!(report, SweepReport::default());
        assert_eq!(engine.calls().remove, 0);
    }

    #[tokio::test]
    async fn test_sweep_retries_transient_failure_once() {
        let engine = Arc::new(MemoryEngine::new());
        engine.seed_container("redis", labels("dead"), ContainerState::Running);
        engine.fail_next_removes(1);

        let report = sweeper(&engine)
            .sweep(&session("dead"))
            .await
            .expect("sweep");

        assert_eq!(report.containers, 1);
        assert_eq!(engine.calls().remove, 2);
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_reports_persistent_failure() {
        let engine = Arc::new(MemoryEngine::new());
        let stuck = engine.seed_container("redis", labels("dead"), ContainerState::Running);
        engine.fail_next_removes(2);

        let report = sweeper(&engine)
            .sweep(&session("dead"))
            .await
            .expect("sweep");

        assert_eq!(report.containers, 0);
        assert_eq!(report.failed, vec![stuck.as_str().to_string()]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_sweep_fails_when_engine_unreachable() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_unreachable(true);

        let result = sweeper(&engine)
            .sweep(&session("dead"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_already_gone_counts_as_removed() {
        let result = retry(|| async {
            Err(EngineError::NotFound {
                id: "abc".to_string(),
            })
        })
        .await;
        assert!(result.is_ok());
    }
}
