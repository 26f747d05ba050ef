//! Client half of the reaper protocol.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::protocol::{encode_filter, is_ack};
use crate::error::{DockyardError, Result};
use crate::labels::LabelFilter;

const CONNECTION_THREAD: &str = "dockyard-reaper";

type AckSender = oneshot::Sender<std::result::Result<(), String>>;

#[derive(Debug)]
enum Command {
    Register { filter: LabelFilter, ack: AckSender },
}

/// A persistent connection to the reaper sidecar.
///
/// The socket is owned by a dedicated thread running its own single-threaded
/// runtime, so it outlives whichever runtime opened it. It stays open until
/// the sidecar closes it or the process exits. Dropping the session does not
/// close it either.
#[derive(Debug)]
pub struct ReaperSession {
    endpoint: String,
    commands: mpsc::Sender<Command>,
    filters: Mutex<HashSet<LabelFilter>>,
    alive: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl ReaperSession {
    /// Connect to a reaper at `endpoint` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::ReaperUnavailable`] if the connection cannot
    /// be established in time.
    pub async fn connect(
        endpoint: &str,
        connect_timeout: Duration,
        ack_timeout: Duration,
    ) -> Result<Self> {
        let (commands, rx) = mpsc::channel(32);
        let alive = Arc::new(AtomicBool::new(false));
        let (ready, connected) = oneshot::channel();

        let thread_endpoint = endpoint.to_string();
        let thread_alive = alive.clone();
        std::thread::Builder::new()
            .name(CONNECTION_THREAD.to_string())
            .spawn(move || {
                hold_connection(thread_endpoint, connect_timeout, rx, thread_alive, ready);
            })
            .map_err(|e| {
                DockyardError::ReaperUnavailable(format!(
                    "spawning connection thread for {endpoint} failed: {e}"
                ))
            })?;

        match connected.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(DockyardError::ReaperUnavailable(reason)),
            Err(_) => {
                return Err(DockyardError::ReaperUnavailable(format!(
                    "connection thread for {endpoint} exited"
                )));
            }
        }
        info!(endpoint, "connected to reaper");

        Ok(Self {
            endpoint: endpoint.to_string(),
            commands,
            filters: Mutex::new(HashSet::new()),
            alive,
            ack_timeout,
        })
    }

    /// Address of the reaper.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the connection is still open.
    ///
    /// A session whose connection thread has gone away counts as dead even if
    /// it never observed the socket closing.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    /// Filters registered so far, sorted.
    #[must_use]
    pub fn filters(&self) -> Vec<LabelFilter> {
        let mut filters: Vec<_> = self.filters.lock().iter().cloned().collect();
        filters.sort();
        filters
    }

    /// Register a filter and wait for the acknowledgement.
    ///
    /// Registering a filter twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DockyardError::ReaperUnavailable`] if the connection is gone
    /// or the reaper does not acknowledge in time.
    pub async fn register(&self, filter: &LabelFilter) -> Result<()> {
        if !self.is_alive() {
            return Err(self.unavailable("connection closed"));
        }
        if !self.filters.lock().insert(filter.clone()) {
            debug!(%filter, "filter already registered");
            return Ok(());
        }

        let result = self.send_and_wait(filter).await;
        if result.is_err() {
            self.filters.lock().remove(filter);
        }
        result
    }

    async fn send_and_wait(&self, filter: &LabelFilter) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Register {
                filter: filter.clone(),
                ack,
            })
            .await
            .map_err(|_| self.unavailable("connection task stopped"))?;

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(Ok(()))) => {
                debug!(%filter, endpoint = %self.endpoint, "filter acknowledged");
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(self.unavailable(&reason)),
            Ok(Err(_)) => Err(self.unavailable("connection task stopped")),
            Err(_) => Err(self.unavailable(&format!(
                "no acknowledgement within {:?}",
                self.ack_timeout
            ))),
        }
    }

    fn unavailable(&self, reason: &str) -> DockyardError {
        DockyardError::ReaperUnavailable(format!("{}: {reason}", self.endpoint))
    }
}

/// Body of the connection thread: open the socket, report back through
/// `ready`, then serve commands until the reaper hangs up.
fn hold_connection(
    endpoint: String,
    connect_timeout: Duration,
    commands: mpsc::Receiver<Command>,
    alive: Arc<AtomicBool>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(format!("starting connection runtime failed: {e}")));
            return;
        }
    };

    runtime.block_on(async move {
        let connecting = tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint));
        let stream = match connecting.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = ready.send(Err(format!("connecting to {endpoint} failed: {e}")));
                return;
            }
            Err(_) => {
                let _ = ready.send(Err(format!(
                    "connecting to {endpoint} timed out after {connect_timeout:?}"
                )));
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        alive.store(true, Ordering::SeqCst);
        if ready.send(Ok(())).is_err() {
            debug!(endpoint = %endpoint, "connect abandoned by caller");
            return;
        }

        let (read, write) = stream.into_split();
        run_connection(endpoint, read, write, commands, alive).await;
    });
}

async fn run_connection(
    endpoint: String,
    read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    mut commands: mpsc::Receiver<Command>,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(read).lines();
    let mut pending: VecDeque<AckSender> = VecDeque::new();
    let mut commands_open = true;

    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(Command::Register { filter, ack }) => {
                    let line = encode_filter(&filter);
                    if let Err(e) = write.write_all(line.as_bytes()).await {
                        let _ = ack.send(Err(format!("write failed: {e}")));
                        warn!(endpoint = %endpoint, error = %e, "reaper write failed");
                        break;
                    }
                    pending.push_back(ack);
                }
                None => commands_open = false,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) if is_ack(&line) => {
                    if let Some(ack) = pending.pop_front() {
                        let _ = ack.send(Ok(()));
                    }
                }
                Ok(Some(line)) => warn!(endpoint = %endpoint, line = %line, "unexpected reaper reply"),
                Ok(None) => {
                    debug!(endpoint = %endpoint, "reaper closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "reaper connection failed");
                    break;
                }
            },
        }
    }

    alive.store(false, Ordering::SeqCst);
    for ack in pending.drain(..) {
        let _ = ack.send(Err("connection closed".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::protocol::parse_filter_line;
    use tokio::net::TcpListener;

    /// Accept one client, ACK every line, forward filters to `seen`.
    async fn ack_server() -> (String, mpsc::UnboundedReceiver<LabelFilter>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let filter = parse_filter_line(&line).expect("filter");
                let _ = tx.send(filter);
                write.write_all(b"ACK\n").await.expect("ack");
            }
        });
        (addr, rx)
    }

    fn session_filter() -> LabelFilter {
        LabelFilter::new("testcontainers.session-id", "1234")
    }

    #[tokio::test]
    async fn test_register_sends_filter_and_waits_for_ack() {
        let (addr, mut seen) = ack_server().await;
        let session = ReaperSession::connect(&addr, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .expect("connect");

        session.register(&session_filter()).await.expect("register");
        assert_eq!(seen.recv().await, Some(session_filter()));
        assert_eq!(session.filters(), vec![session_filter()]);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_duplicate_filter_is_noop() {
        let (addr, mut seen) = ack_server().await;
        let session = ReaperSession::connect(&addr, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .expect("connect");

        session.register(&session_filter()).await.expect("first");
        session.register(&session_filter()).await.expect("second");
        let other = LabelFilter::new("testcontainers.reuse-hash", "ff");
        session.register(&other).await.expect("other");

        assert_eq!(seen.recv().await, Some(session_filter()));
        assert_eq!(seen.recv().await, Some(other));
        assert_eq!(session.filters().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let err = ReaperSession::connect(&addr, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .expect_err("refused");
        assert!(matches!(err, DockyardError::ReaperUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let session =
            ReaperSession::connect(&addr, Duration::from_secs(1), Duration::from_millis(100))
                .await
                .expect("connect");
        let err = session.register(&session_filter()).await.expect_err("no ack");
        assert!(err.to_string().contains("no acknowledgement"));
        assert!(session.filters().is_empty());
        server.abort();
    }

    #[test]
    fn test_session_outlives_the_runtime_that_opened_it() {
        let current_thread = || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime")
        };
        let server = tokio::runtime::Runtime::new().expect("server runtime");
        let (addr, mut seen) = server.block_on(ack_server());

        let opener = current_thread();
        let session = opener
            .block_on(ReaperSession::connect(
                &addr,
                Duration::from_secs(1),
                Duration::from_secs(1),
            ))
            .expect("connect");
        drop(opener);

        let user = current_thread();
        user.block_on(session.register(&session_filter()))
            .expect("register after the opening runtime is gone");
        assert!(session.is_alive());
        assert_eq!(server.block_on(seen.recv()), Some(session_filter()));
    }

    #[tokio::test]
    async fn test_server_close_marks_session_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            drop(socket);
        });

        let session = ReaperSession::connect(&addr, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .expect("connect");
        for _ in 0..50 {
            if !session.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session.is_alive());
        assert!(session.register(&session_filter()).await.is_err());
    }
}
