//! TCP server that holds client sessions and sweeps after they end.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dockyard::engine::ContainerEngine;
use dockyard::reaper::protocol::{ACK, Selector, parse_selector_line};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ReaperError, ReaperResult};
use crate::registry::{FilterRegistry, PendingSweep};
use crate::sweeper::Sweeper;

/// How often the accept loop checks the exit conditions.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The shutdown future completed.
    Shutdown,
    /// No client connected within the connection timeout.
    NoClient,
    /// No connections and no pending sweeps for the shutdown timeout.
    Idle,
}

/// The reaper sidecar server.
#[derive(Debug)]
pub struct ReaperServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    registry: Arc<Mutex<FilterRegistry>>,
    sweeper: Sweeper,
}

impl ReaperServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or binding fails.
    pub async fn bind(config: ServerConfig, engine: Arc<dyn ContainerEngine>) -> ReaperResult<Self> {
        config.validate().map_err(ReaperError::Config)?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| ReaperError::BindFailed(config.listen, e))?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(FilterRegistry::new())),
            sweeper: Sweeper::new(engine),
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> ReaperResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared registry, for inspection.
    #[must_use]
    pub fn registry(&self) -> Arc<Mutex<FilterRegistry>> {
        self.registry.clone()
    }

    /// Accept clients until `shutdown` completes or an exit condition holds.
    ///
    /// Sweeps still waiting out their grace period when `shutdown` fires are
    /// abandoned.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged.
    pub async fn serve_until<F>(self, shutdown: F) -> ReaperResult<ServeOutcome>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            grace_period = ?self.config.grace_period,
            "reaper listening"
        );

        let started = Instant::now();
        let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    return Ok(ServeOutcome::Shutdown);
                }
                _ = idle_check.tick() => {
                    if let Some(outcome) = self.exit_condition(started) {
                        info!(?outcome, "reaper exiting");
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    fn exit_condition(&self, started: Instant) -> Option<ServeOutcome> {
        let registry = self.registry.lock();
        if !registry.ever_connected() {
            return (started.elapsed() >= self.config.connection_timeout)
                .then_some(ServeOutcome::NoClient);
        }
        registry
            .idle_for(self.config.shutdown_timeout)
            .then_some(ServeOutcome::Idle)
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "new connection");
        self.registry.lock().connection_opened();

        let registry = self.registry.clone();
        let sweeper = self.sweeper.clone();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            let held = read_filters(stream, peer, &registry).await;
            let orphaned = registry.lock().connection_closed(&held);
            info!(peer = %peer, filters = held.len(), orphaned = orphaned.len(), "client disconnected");
            for pending in orphaned {
                tokio::spawn(sweep_after_grace(
                    pending,
                    registry.clone(),
                    sweeper.clone(),
                    grace,
                ));
            }
        });
    }
}

/// Read filter lines until the client goes away, acknowledging each one.
///
/// Every line is held as its own selector, so the client is covered by the
/// union of its lines.
async fn read_filters(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Mutex<FilterRegistry>,
) -> HashSet<Selector> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut held = HashSet::new();
    let ack = format!("{ACK}\n");

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_selector_line(&line) {
                Ok(filter) => {
                    if held.insert(filter.clone()) {
                        registry.lock().acquire(&filter);
                        info!(peer = %peer, %filter, "filter registered");
                    }
                    if let Err(e) = write.write_all(ack.as_bytes()).await {
                        debug!(peer = %peer, error = %e, "failed to acknowledge");
                        break;
                    }
                }
                Err(e) => warn!(peer = %peer, error = %e, "ignoring invalid line"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "connection ended with error");
                break;
            }
        }
    }
    held
}

async fn sweep_after_grace(
    pending: PendingSweep,
    registry: Arc<Mutex<FilterRegistry>>,
    sweeper: Sweeper,
    grace: Duration,
) {
    tokio::time::sleep(grace).await;

    let claimed = registry.lock().claim(&pending);
    if !claimed {
        debug!(filter = %pending.filter, "sweep cancelled, filter is held again");
        return;
    }

    match sweeper.sweep(&pending.filter).await {
        Ok(report) if report.is_clean() => {}
        Ok(report) => warn!(
            filter = %pending.filter,
            failed = ?report.failed,
            "some resources could not be removed"
        ),
        Err(e) => error!(filter = %pending.filter, error = %e, "sweep failed"),
    }
    registry.lock().sweep_finished();
}
