//! rustls-backed TLS for STARTTLS upgrades and direct TLS endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, warn};

use super::error::{Error, Result};
use super::transport::{BoxedStream, TlsUpgrader};

/// Initialize rustls crypto provider (must be called once at startup)
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: Only used when `dangerous_insecure_tls` is set in the client
/// configuration, for servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a connector trusting the system's native roots, or nothing at all
/// when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(Error::Tls(
            "No system root certificates found. \
            Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
    debug!(added, ignored, "Loaded native root certificates");

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Classify a handshake failure for logs.
fn classify_handshake_error(detail: &str) -> &'static str {
    if detail.contains("ertificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// The production [`TlsUpgrader`].
#[derive(Clone)]
pub struct RustlsUpgrader {
    connector: TlsConnector,
}

impl RustlsUpgrader {
    pub fn new(insecure: bool) -> Result<Self> {
        Ok(Self {
            connector: create_tls_connector(insecure)?,
        })
    }
}

#[async_trait]
impl TlsUpgrader for RustlsUpgrader {
    async fn upgrade(&self, stream: BoxedStream, server_name: &str) -> Result<BoxedStream> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(format!("Invalid server name {}: {}", server_name, e)))?;

        let tls = self.connector.connect(name, stream).await.map_err(|e| {
            let detail = e.to_string();
            let classification = classify_handshake_error(&detail);
            error!(host = server_name, error = %e, error_class = classification, "TLS handshake failed");
            Error::Tls(format!(
                "TLS handshake failed with {} ({}): {}",
                server_name, classification, detail
            ))
        })?;
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_insecure_connector() {
        assert!(create_tls_connector(true).is_ok());
    }

    #[test]
    fn test_classify_handshake_error() {
        assert_eq!(
            classify_handshake_error("invalid peer certificate: UnknownIssuer"),
            "certificate_error"
        );
        assert_eq!(classify_handshake_error("connection reset by peer"), "connection_refused");
        assert_eq!(classify_handshake_error("received corrupt message"), "other");
    }

    #[tokio::test]
    async fn test_upgrade_rejects_invalid_server_name() {
        let upgrader = RustlsUpgrader::new(true).unwrap();
        let (client, _server) = tokio::io::duplex(64);
        let result = upgrader.upgrade(Box::new(client), "bad name with spaces").await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_upgrade_fails_when_peer_hangs_up() {
        let upgrader = RustlsUpgrader::new(true).unwrap();
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let result = upgrader.upgrade(Box::new(client), "example.com").await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }
}
