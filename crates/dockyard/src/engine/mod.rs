//! Container engine facade.
//!
//! Everything above this module talks to a daemon through the
//! [`ContainerEngine`] trait. Two implementations ship with the crate:
//!
//! - [`DockerEngine`]: the Docker Engine API via bollard.
//! - [`MemoryEngine`]: a deterministic in-process daemon with failure
//!   injection, used by the test suites.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dockyard::engine::{ContainerEngine, DockerEngine, StopOptions};
//! use dockyard::spec::ContainerSpec;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DockerEngine::connect()?;
//! let spec = ContainerSpec::new("redis:7-alpine").with_exposed_port(6379);
//!
//! let id = engine.create(&spec).await?;
//! engine.start(&id).await?;
//! let status = engine.inspect(&id).await?;
//! println!("redis on {}:{:?}", engine.host(), status.host_port(6379));
//! engine.stop(&id, &StopOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod docker;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod status;

pub use docker::DockerEngine;
pub use error::{ContainerId, EngineError, EngineResult, NetworkId};
pub use memory::{EngineCalls, ImageBehavior, MemoryContainer, MemoryEngine};
pub use runtime::{
    ContainerEngine, EngineFuture, ExecOptions, ExecResult, FileUpload, ListOptions, LogsOptions,
    RemoveOptions, StopOptions,
};
pub use status::{
    ContainerState, ContainerStatus, ContainerSummary, HealthStatus, NetworkSummary, PortBinding,
};
