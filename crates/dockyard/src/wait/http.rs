//! Wait for an HTTP endpoint to answer with an acceptable response.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::{Client, Method};
use tracing::warn;

use super::{CheckFuture, Readiness, WaitError, WaitStrategy, WaitTarget};

type StatusPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type BodyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Ready when a request to a published port returns an accepted status
/// (and body, if a body predicate is set).
#[derive(Clone)]
pub struct HttpWaitStrategy {
    path: String,
    port: Option<u16>,
    method: Method,
    status_codes: BTreeSet<u16>,
    status_predicate: Option<StatusPredicate>,
    body_predicate: Option<BodyPredicate>,
    headers: Vec<(String, String)>,
    basic_auth: Option<(String, String)>,
    tls: bool,
    allow_insecure: bool,
    read_timeout: Duration,
    timeout: Option<Duration>,
    poll_interval: Duration,
    client: Arc<OnceCell<Client>>,
}

impl fmt::Debug for HttpWaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpWaitStrategy")
            .field("path", &self.path)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("status_codes", &self.status_codes)
            .field("has_status_predicate", &self.status_predicate.is_some())
            .field("has_body_predicate", &self.body_predicate.is_some())
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpWaitStrategy {
    /// `GET path` on the first exposed port, expecting 200.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            path,
            port: None,
            method: Method::GET,
            status_codes: BTreeSet::new(),
            status_predicate: None,
            body_predicate: None,
            headers: Vec::new(),
            basic_auth: None,
            tls: false,
            allow_insecure: false,
            read_timeout: Duration::from_secs(1),
            timeout: None,
            poll_interval: Duration::from_millis(500),
            client: Arc::new(OnceCell::new()),
        }
    }

    /// Probe this container port instead of the first exposed one.
    #[must_use]
    pub fn for_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use another HTTP method.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::InvalidConfig`] for a malformed method name.
    pub fn with_method(mut self, method: &str) -> Result<Self, WaitError> {
        self.method = Method::from_bytes(method.as_bytes())
            .map_err(|e| WaitError::InvalidConfig(format!("invalid HTTP method {method}: {e}")))?;
        Ok(self)
    }

    /// Accept this status code. May be called repeatedly; replaces the default 200.
    #[must_use]
    pub fn for_status_code(mut self, code: u16) -> Self {
        self.status_codes.insert(code);
        self
    }

    /// Accept any status for which `predicate` holds, in addition to listed codes.
    #[must_use]
    pub fn for_status_code_matching(
        mut self,
        predicate: impl Fn(u16) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.status_predicate = Some(Arc::new(predicate));
        self
    }

    /// Require the response body to satisfy `predicate`.
    #[must_use]
    pub fn for_response_predicate(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.body_predicate = Some(Arc::new(predicate));
        self
    }

    /// Send an extra request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Authenticate with HTTP basic auth.
    #[must_use]
    pub fn with_basic_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    /// Use `https`.
    #[must_use]
    pub fn using_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Skip certificate validation for `https`.
    #[must_use]
    pub fn allow_insecure(mut self) -> Self {
        self.allow_insecure = true;
        self
    }

    /// Per-request timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Override the startup timeout.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn status_accepted(&self, status: u16) -> bool {
        if self.status_codes.is_empty() && self.status_predicate.is_none() {
            return status == 200;
        }
        self.status_codes.contains(&status)
            || self.status_predicate.as_ref().is_some_and(|p| p(status))
    }

    fn client(&self) -> Result<&Client, String> {
        self.client
            .get_or_try_init(|| {
                Client::builder()
                    .timeout(self.read_timeout)
                    .danger_accept_invalid_certs(self.allow_insecure)
                    .build()
            })
            .map_err(|e| format!("failed to build HTTP client: {e}"))
    }

    fn url(&self, host: &str, port: u16) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{host}:{port}{}", self.path)
    }

    async fn probe(&self, url: &str) -> Readiness {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => return Readiness::Failed(reason),
        };

        let mut request = client.request(self.method.clone(), url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Readiness::NotReady(format!("request to {url} failed: {e}")),
        };

        let status = response.status().as_u16();
        if !self.status_accepted(status) {
            return Readiness::NotReady(format!("{url} returned status {status}"));
        }

        let Some(predicate) = &self.body_predicate else {
            return Readiness::Ready;
        };
        match response.text().await {
            Ok(body) if predicate(&body) => Readiness::Ready,
            Ok(_) => Readiness::NotReady(format!("{url} body did not match")),
            Err(e) => Readiness::NotReady(format!("reading body from {url} failed: {e}")),
        }
    }
}

impl WaitStrategy for HttpWaitStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    fn startup_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a> {
        Box::pin(async move {
            let Some(port) = self.port.or_else(|| target.exposed_ports().first().copied()) else {
                warn!(id = %target.id(), "no exposed port to probe over HTTP, assuming ready");
                return Readiness::Ready;
            };
            let Some(host_port) = target.mapped_port(port) else {
                return Readiness::Failed(format!("port {port} is not published"));
            };

            let url = self.url(target.host(), host_port);
            match self.probe(&url).await {
                Readiness::NotReady(reason) => match target.exit_reason().await {
                    Some(exit) => Readiness::Failed(exit),
                    None => Readiness::NotReady(reason),
                },
                other => other,
            }
        })
    }
}
