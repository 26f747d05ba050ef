//! # dockyard
//!
//! Ephemeral container fixtures for tests: start a container, wait until it
//! is actually usable, and make sure it goes away afterwards, even if the
//! test process crashes.
//!
//! ## Modules
//!
//! - [`orchestrator`]: create, start, wait, stop and remove, with startup
//!   retries and scoped cleanup.
//! - [`wait`]: readiness strategies (health check, log pattern, port, HTTP,
//!   shell command) and the sequential [`wait::WaitAllStrategy`].
//! - [`reaper`]: client for the reaper sidecar that removes a session's
//!   resources once its connection drops.
//! - [`reuse`]: spec fingerprints for attaching to an already running
//!   container.
//! - [`engine`]: the container engine facade, with Docker and in-memory
//!   implementations.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dockyard::orchestrator::{ContainerRequest, Orchestrator};
//! use dockyard::spec::ContainerSpec;
//! use dockyard::wait::Wait;
//!
//! # async fn example() -> dockyard::Result<()> {
//! let orchestrator = Orchestrator::connect_docker()?;
//!
//! let request = ContainerRequest::new(
//!     ContainerSpec::new("redis:7-alpine").with_exposed_port(6379),
//! )
//! .waiting_for(Wait::log_contains("Ready to accept connections"));
//!
//! orchestrator
//!     .scoped(request, |redis| async move {
//!         let port = redis.mapped_port(6379);
//!         println!("redis at {}:{port:?}", redis.host());
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod labels;
pub mod orchestrator;
pub mod reaper;
pub mod reuse;
pub mod spec;
pub mod wait;

pub use config::DockyardConfig;
pub use engine::{ContainerEngine, ContainerId, DockerEngine, EngineError, MemoryEngine};
pub use error::{DockyardError, Result};
pub use labels::{LabelFilter, SessionId};
pub use orchestrator::{ContainerHandle, ContainerRequest, LifecycleState, Orchestrator};
pub use reaper::Reaper;
pub use reuse::ReuseFingerprint;
pub use spec::{ContainerSpec, CopyToContainer};
pub use wait::{Wait, WaitAllMode, WaitStrategy};
