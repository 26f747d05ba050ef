//! Orchestrator lifecycle tests against the in-memory engine.
//!
//! These tests verify:
//! 1. Startup attempts, cleanup between attempts, and failure taxonomy
//! 2. Idempotent stop and remove
//! 3. Reuse attach and ambiguity fallback
//! 4. Scoped cleanup on normal exit and on panic
//! 5. Reaper registration and degraded operation

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dockyard::engine::{ContainerEngine, ContainerState, ImageBehavior, MemoryEngine};
use dockyard::labels::{
    LABEL_COPIED_FILES_HASH, LABEL_MANAGED, LABEL_REUSE_HASH, LABEL_SESSION_ID, SessionId,
};
use dockyard::orchestrator::{ContainerRequest, LifecycleState, Orchestrator};
use dockyard::reuse::{ReuseFingerprint, copied_files_hash};
use dockyard::spec::{ContainerSpec, CopyToContainer};
use dockyard::wait::Wait;
use dockyard::{DockyardConfig, DockyardError};
use futures::FutureExt;
use test_case::test_case;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const IMAGE: &str = "postgres:16";

fn engine() -> Arc<MemoryEngine> {
    Arc::new(MemoryEngine::new().with_image(
        IMAGE,
        ImageBehavior::default().with_logs("database system is ready to accept connections\n"),
    ))
}

fn orchestrator(engine: &Arc<MemoryEngine>, config: DockyardConfig) -> Orchestrator {
    let engine: Arc<dyn ContainerEngine> = engine.clone();
    Orchestrator::new(engine, config.without_reaper())
}

fn request() -> ContainerRequest {
    ContainerRequest::new(ContainerSpec::new(IMAGE).with_env("POSTGRES_PASSWORD", "secret"))
        .waiting_for(Wait::log_contains("ready to accept connections"))
}

// ============================================================================
// Startup Tests
// ============================================================================

#[tokio::test]
async fn test_start_reaches_running() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let handle = orchestrator.start(request()).await.expect("start");

    assert_eq!(handle.state(), LifecycleState::Running);
    assert!(!handle.is_reused());
    assert_eq!(
        handle.history(),
        vec![
            LifecycleState::Configured,
            LifecycleState::Creating,
            LifecycleState::Created,
            LifecycleState::Starting,
            LifecycleState::AwaitingReady,
            LifecycleState::Running,
        ]
    );
    assert_eq!(engine.running_count(), 1);
    assert_eq!(handle.host(), "127.0.0.1");
}

#[tokio::test]
async fn test_created_container_carries_session_labels() {
    let engine = engine();
    let session = SessionId::generate();
    let orchestrator = orchestrator(&engine, DockyardConfig::default()).with_session(session);

    let handle = orchestrator.start(request()).await.expect("start");

    let labels = handle.labels();
    assert_eq!(labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
    assert_eq!(
        labels.get(LABEL_SESSION_ID).cloned(),
        Some(session.to_string())
    );
    assert!(!labels.contains_key(LABEL_REUSE_HASH));
    assert!(!labels.contains_key(LABEL_COPIED_FILES_HASH));
}

#[tokio::test]
async fn test_staged_files_copied_and_hashed() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());
    let spec = ContainerSpec::new(IMAGE).with_file(
        CopyToContainer::bytes("/docker-entrypoint-initdb.d/init.sql", "create table t();")
            .with_mode(0o600),
    );
    let expected_hash = copied_files_hash(&spec).await.expect("hash");

    let handle = orchestrator
        .start(ContainerRequest::new(spec).waiting_for(Wait::log_contains("ready")))
        .await
        .expect("start");

    assert_eq!(handle.labels().get(LABEL_COPIED_FILES_HASH).cloned(), expected_hash);
    let container = engine.container(handle.id()).expect("container");
    let (contents, mode) = container
        .files
        .get("/docker-entrypoint-initdb.d/init.sql")
        .expect("staged file");
    assert_eq!(contents.as_slice(), b"create table t();");
    assert_eq!(*mode, 0o600);
}

#[tokio::test]
async fn test_invalid_spec_creates_nothing() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());
    let spec = ContainerSpec::new(IMAGE).with_label("testcontainers.session-id", "forged");

    let err = orchestrator
        .start(ContainerRequest::new(spec))
        .await
        .expect_err("invalid");

    assert!(matches!(err, DockyardError::InvalidSpec(_)));
    assert_eq!(engine.calls().create, 0);
}

#[test_case(1 ; "one attempt")]
#[test_case(2 ; "two attempts")]
#[test_case(4 ; "four attempts")]
#[tokio::test]
async fn test_every_attempt_failing_creates_exactly_n(attempts: u32) {
    let engine = engine();
    engine.fail_next_creates(attempts);
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let err = orchestrator
        .start(request().with_startup_attempts(attempts))
        .await
        .expect_err("all attempts fail");

    match err {
        DockyardError::StartupFailure {
            attempts: made,
            last_error,
        } => {
            assert_eq!(made, attempts);
            assert!(matches!(*last_error, DockyardError::CreationFailure { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.calls().create, attempts as usize);
    assert_eq!(engine.running_count(), 0);
}

#[tokio::test]
async fn test_failed_start_is_cleaned_up_before_retry() {
    let engine = engine();
    engine.fail_next_starts(1);
    let orchestrator = orchestrator(&engine, DockyardConfig::default().with_startup_attempts(2));

    let handle = orchestrator.start(request()).await.expect("second attempt");

    let calls = engine.calls();
    assert_eq!(calls.create, 2);
    assert_eq!(calls.removed_ids.len(), 1);
    assert_ne!(calls.removed_ids[0], handle.id().as_str());
    assert_eq!(engine.containers().len(), 1);
    assert!(handle.history().contains(&LifecycleState::Failed));
}

#[tokio::test]
async fn test_container_exiting_on_start_is_retried() {
    let engine = Arc::new(
        MemoryEngine::new().with_image("crashy", ImageBehavior::default().exits_on_start(1)),
    );
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let err = orchestrator
        .start(ContainerRequest::new(ContainerSpec::new("crashy")).with_startup_attempts(3))
        .await
        .expect_err("never runs");

    match err {
        DockyardError::StartupFailure { last_error, .. } => {
            assert!(matches!(*last_error, DockyardError::NotRunning { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.calls().create, 3);
    assert!(engine.containers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_not_retried_by_default() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default().with_startup_attempts(3));

    let err = orchestrator
        .start(
            request()
                .waiting_for(Wait::log_contains("never printed"))
                .with_startup_timeout(Duration::from_secs(2)),
        )
        .await
        .expect_err("timeout");

    match err {
        DockyardError::ReadinessTimeout {
            strategy,
            elapsed,
            attempt,
            ..
        } => {
            assert_eq!(strategy, "log-message");
            assert_eq!(attempt, 1);
            assert!(elapsed >= Duration::from_secs(2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.calls().create, 1);
    assert!(engine.containers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_retry_is_opt_in() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let err = orchestrator
        .start(
            request()
                .waiting_for(Wait::log_contains("never printed"))
                .with_startup_timeout(Duration::from_secs(1))
                .with_startup_attempts(2)
                .retry_on_readiness_failure(true),
        )
        .await
        .expect_err("timeout twice");

    match err {
        DockyardError::StartupFailure {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 2);
            assert!(last_error.is_readiness());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.calls().create, 2);
    assert!(engine.containers().is_empty());
}

// ============================================================================
// Stop / Remove Tests
// ============================================================================

#[tokio::test]
async fn test_stop_is_idempotent() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());
    let handle = orchestrator.start(request()).await.expect("start");

    orchestrator.stop(&handle).await.expect("first stop");
    orchestrator.stop(&handle).await.expect("second stop");

    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(engine.calls().stop, 1);
    let container = engine.container(handle.id()).expect("still present");
    assert_eq!(container.state, ContainerState::Exited);
}

#[tokio::test]
async fn test_remove_twice_succeeds() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());
    let handle = orchestrator.start(request()).await.expect("start");
    let clone = handle.clone();

    orchestrator.remove(&handle).await.expect("first remove");
    orchestrator.remove(&clone).await.expect("second remove");

    assert_eq!(handle.state(), LifecycleState::Removed);
    assert_eq!(engine.calls().remove, 1);
    assert!(engine.containers().is_empty());
}

#[tokio::test]
async fn test_remove_tolerates_container_already_gone() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());
    let handle = orchestrator.start(request()).await.expect("start");

    engine
        .remove(handle.id(), &dockyard::engine::RemoveOptions::force())
        .await
        .expect("external removal");

    orchestrator.remove(&handle).await.expect("already gone");
    assert_eq!(handle.state(), LifecycleState::Removed);
}

#[tokio::test]
async fn test_remove_retries_once() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let flaky = orchestrator.start(request()).await.expect("start");
    engine.fail_next_removes(1);
    orchestrator.remove(&flaky).await.expect("retry succeeds");

    let stuck = orchestrator.start(request()).await.expect("start");
    engine.fail_next_removes(2);
    let err = orchestrator.remove(&stuck).await.expect_err("refused twice");
    assert!(matches!(err, DockyardError::RemovalFailure { .. }));
    assert_ne!(stuck.state(), LifecycleState::Removed);

    orchestrator.remove(&stuck).await.expect("later removal works");
}

// ============================================================================
// Reuse Tests
// ============================================================================

#[tokio::test]
async fn test_reuse_attaches_to_running_match() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default().with_reuse(true));

    let first = orchestrator
        .start(request().with_reuse(true))
        .await
        .expect("create");
    let second = orchestrator
        .start(request().with_reuse(true))
        .await
        .expect("attach");

    assert!(!first.is_reused());
    assert!(second.is_reused());
    assert_eq!(first.id(), second.id());
    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_eq!(
        second.history(),
        vec![LifecycleState::Configured, LifecycleState::Attached]
    );
    assert_eq!(engine.calls().create, 1);
}

#[tokio::test]
async fn test_reuse_ignores_different_spec() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default().with_reuse(true));

    orchestrator
        .start(request().with_reuse(true))
        .await
        .expect("create");
    let other = ContainerRequest::new(
        ContainerSpec::new(IMAGE).with_env("POSTGRES_PASSWORD", "different"),
    )
    .waiting_for(Wait::log_contains("ready"))
    .with_reuse(true);
    let handle = orchestrator.start(other).await.expect("fresh");

    assert!(!handle.is_reused());
    assert_eq!(engine.calls().create, 2);
}

#[tokio::test]
async fn test_reuse_ambiguity_falls_back_to_fresh_container() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default().with_reuse(true));
    let fingerprint = ReuseFingerprint::compute(request().spec(), None).expect("fingerprint");
    let labels = HashMap::from([(LABEL_REUSE_HASH.to_string(), fingerprint.to_string())]);
    engine.seed_container(IMAGE, labels.clone(), ContainerState::Running);
    engine.seed_container(IMAGE, labels, ContainerState::Running);

    let handle = orchestrator
        .start(request().with_reuse(true))
        .await
        .expect("fresh");

    assert!(!handle.is_reused());
    assert_eq!(engine.calls().create, 1);
    assert_eq!(engine.running_count(), 3);
}

#[tokio::test]
async fn test_reuse_requires_configuration_gate() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    orchestrator
        .start(request().with_reuse(true))
        .await
        .expect("first");
    let second = orchestrator
        .start(request().with_reuse(true))
        .await
        .expect("second");

    assert!(!second.is_reused());
    assert!(second.fingerprint().is_none());
    assert_eq!(engine.calls().create, 2);
}

// ============================================================================
// Scoped Tests
// ============================================================================

#[tokio::test]
async fn test_scoped_removes_after_body() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let id = orchestrator
        .scoped(request(), |handle| async move { handle.id().clone() })
        .await
        .expect("scoped");

    assert!(engine.container(&id).is_none());
    assert_eq!(engine.running_count(), 0);
}

#[tokio::test]
async fn test_scoped_removes_after_panic() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let outcome = AssertUnwindSafe(orchestrator.scoped(request(), |handle| async move {
        assert!(handle.id().as_str().is_empty(), "test body failed");
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(engine.calls().create, 1);
    assert!(engine.containers().is_empty());
}

#[tokio::test]
async fn test_scoped_removes_when_body_panics_before_awaiting() {
    let engine = engine();
    let orchestrator = orchestrator(&engine, DockyardConfig::default());

    let outcome = AssertUnwindSafe(orchestrator.scoped(request(), |handle| {
        assert!(handle.id().as_str().is_empty(), "closure failed");
        async move {}
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(engine.calls().create, 1);
    assert!(engine.containers().is_empty());
}

// ============================================================================
// Network Tests
// ============================================================================

#[tokio::test]
async fn test_network_create_and_remove() {
    let engine = engine();
    let session = SessionId::generate();
    let orchestrator = orchestrator(&engine, DockyardConfig::default()).with_session(session);

    let network = orchestrator.create_network("it-net").await.expect("create");
    let summary = engine
        .networks()
        .into_iter()
        .find(|n| n.name == "it-net")
        .expect("network");
    assert_eq!(
        summary.labels.get(LABEL_SESSION_ID).cloned(),
        Some(session.to_string())
    );

    orchestrator.remove_network(&network).await.expect("remove");
    orchestrator.remove_network(&network).await.expect("remove again");
    assert!(engine.networks().is_empty());
}

// ============================================================================
// Reaper Integration Tests
// ============================================================================

/// Stand-in reaper that ACKs every filter line and records it.
async fn recording_reaper() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(line);
                    if write.write_all(b"ACK\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, rx)
}

#[tokio::test]
async fn test_container_registered_with_reaper_before_ready() {
    let (addr, mut lines) = recording_reaper().await;
    let engine = engine();
    let session = SessionId::generate();
    let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
    let orchestrator = Orchestrator::new(
        dyn_engine,
        DockyardConfig::default().with_reaper_endpoint(addr),
    )
    .with_session(session);

    orchestrator.start(request()).await.expect("first");
    orchestrator.start(request()).await.expect("second");

    assert_eq!(
        lines.recv().await,
        Some(format!("label={LABEL_SESSION_ID}={session}"))
    );
    assert!(lines.try_recv().is_err());
    let reaper_session = orchestrator.reaper().session().expect("connected");
    assert_eq!(reaper_session.filters(), vec![session.filter()]);
}

#[tokio::test]
async fn test_orchestrators_share_one_reaper_session() {
    let (addr, mut lines) = recording_reaper().await;
    let engine = engine();
    let session = SessionId::generate();
    let config = DockyardConfig::default().with_reaper_endpoint(addr);
    let first = Orchestrator::new(engine.clone(), config.clone()).with_session(session);
    let second = Orchestrator::new(engine.clone(), config).with_session(session);

    assert!(Arc::ptr_eq(first.reaper(), second.reaper()));

    first.start(request()).await.expect("first");
    second.start(request()).await.expect("second");

    assert_eq!(
        lines.recv().await,
        Some(format!("label={LABEL_SESSION_ID}={session}"))
    );
    assert!(lines.try_recv().is_err());
    let shared = first.reaper().session().expect("connected");
    let seen_by_second = second.reaper().session().expect("connected");
    assert!(Arc::ptr_eq(&shared, &seen_by_second));
}

#[tokio::test]
async fn test_unreachable_reaper_does_not_fail_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let engine = engine();
    let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
    let orchestrator = Orchestrator::new(
        dyn_engine,
        DockyardConfig::default().with_reaper_endpoint(addr),
    );

    let handle = orchestrator.start(request()).await.expect("degraded start");
    assert_eq!(handle.state(), LifecycleState::Running);
    assert!(orchestrator.reaper().is_degraded());

    orchestrator.remove(&handle).await.expect("explicit cleanup still works");
    assert!(engine.containers().is_empty());
}
