//! Wait for published ports to accept connections.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::{CheckFuture, Readiness, WaitStrategy, WaitTarget};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Ready when every targeted port accepts a connection.
///
/// With no explicit ports, every exposed port is checked, and a container
/// without exposed ports is ready immediately.
#[derive(Debug, Clone)]
pub struct HostPortWaitStrategy {
    ports: Vec<u16>,
    tls: bool,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl HostPortWaitStrategy {
    /// Check every exposed port.
    #[must_use]
    pub fn all_exposed() -> Self {
        Self::ports([])
    }

    /// Check the given container ports.
    #[must_use]
    pub fn ports(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            tls: false,
            timeout: None,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Require a TLS handshake on top of the TCP connect. Certificates are
    /// not verified.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
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

    async fn probe(&self, host: &str, port: u16) -> Result<(), String> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| format!("connect to {host}:{port} timed out"))?
            .map_err(|e| format!("connect to {host}:{port} failed: {e}"))?;

        if !self.tls {
            return Ok(());
        }

        let connector = insecure_connector()?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| format!("invalid server name {host}: {e}"))?;
        tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| format!("TLS handshake with {host}:{port} timed out"))?
            .map_err(|e| format!("TLS handshake with {host}:{port} failed: {e}"))?;
        Ok(())
    }
}

impl WaitStrategy for HostPortWaitStrategy {
    fn name(&self) -> &'static str {
        "host-port"
    }

    fn startup_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn check_ready<'a>(&'a self, target: &'a WaitTarget) -> CheckFuture<'a> {
        Box::pin(async move {
            let ports: &[u16] = if self.ports.is_empty() {
                target.exposed_ports()
            } else {
                &self.ports
            };

            for &port in ports {
                let Some(host_port) = target.mapped_port(port) else {
                    return Readiness::Failed(format!("port {port} is not published"));
                };
                if let Err(reason) = self.probe(target.host(), host_port).await {
                    if let Some(exit) = target.exit_reason().await {
                        return Readiness::Failed(exit);
                    }
                    return Readiness::NotReady(reason);
                }
            }

            Readiness::Ready
        })
    }
}

/// Verifier that accepts any certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_connector() -> Result<TlsConnector, String> {
    static CONNECTOR: OnceCell<TlsConnector> = OnceCell::new();

    CONNECTOR
        .get_or_try_init(|| {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = rustls::ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()
                .map_err(|e| format!("TLS setup failed: {e}"))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth();
            Ok(TlsConnector::from(Arc::new(config)))
        })
        .cloned()
}
