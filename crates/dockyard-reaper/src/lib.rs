//! Reaper sidecar for dockyard.
//!
//! Clients connect over TCP, send one or more `label=<key>=<value>` lines,
//! and keep the connection open for as long as their process lives. Clauses
//! joined with `&` on one line must all match; separate lines are swept
//! independently. When a connection closes, every filter it held starts a
//! grace period; if no client re-registers the filter in that window, all
//! containers and then all networks carrying the labels are removed.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dockyard::engine::DockerEngine;
//! use dockyard_reaper::{ReaperServer, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(DockerEngine::connect()?);
//! let server = ReaperServer::bind(ServerConfig::default(), engine).await?;
//! let outcome = server.serve_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! println!("stopped: {outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod sweeper;

pub use config::ServerConfig;
pub use error::{ReaperError, ReaperResult};
pub use registry::{FilterRegistry, PendingSweep};
pub use server::{ReaperServer, ServeOutcome};
pub use sweeper::{SweepReport, Sweeper};
