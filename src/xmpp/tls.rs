//! STARTTLS transport upgrade.
//!
//! Wraps the plaintext connection in a rustls client session, verifying the
//! server certificate against the XMPP domain (not the SRV target host).

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use super::BoxedIo;
use crate::error::ProbeError;

/// Replaces a connection with an encrypted one, in place.
///
/// The negotiator calls this exactly once, after `<proceed/>` and before the
/// second stream open. Tests substitute a pass-through implementation.
pub trait Upgrade {
    async fn upgrade(&self, io: BoxedIo, domain: &str) -> Result<BoxedIo, ProbeError>;
}

/// rustls-backed upgrader used by the real probe.
#[derive(Debug, Clone, Default)]
pub struct TlsUpgrader {
    insecure: bool,
}

impl TlsUpgrader {
    pub fn new(insecure: bool) -> Self {
        Self { insecure }
    }
}

impl Upgrade for TlsUpgrader {
    async fn upgrade(&self, io: BoxedIo, domain: &str) -> Result<BoxedIo, ProbeError> {
        init_crypto_provider();
        let connector = create_tls_connector(self.insecure).map_err(|reason| {
            ProbeError::HandshakeFailed {
                host: domain.to_string(),
                reason,
            }
        })?;
        let tls_stream = upgrade_to_tls(&connector, io, domain).await?;
        Ok(Box::new(tls_stream))
    }
}

/// Install ring as the process-wide rustls provider. Idempotent; the
/// upgrader calls it before building each connector.
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any server certificate. Signatures are still checked, so the
/// handshake itself stays sound. Only for `--dangerous-insecure-tls`.
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
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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

/// Connector for the STARTTLS upgrade. Verifies against the native root
/// store unless `insecure` is set.
fn create_tls_connector(insecure: bool) -> Result<TlsConnector, String> {
    let builder = ClientConfig::builder();
    let config = if insecure {
        warn!("Skipping certificate verification (--dangerous-insecure-tls)");
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(native_roots()?)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn native_roots() -> Result<RootCertStore, String> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!(error = %e, "Could not load some system root certificates");
    }
    if loaded.certs.is_empty() {
        return Err("no system root certificates available".to_string());
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if added == 0 {
        return Err(format!("none of {} system root certificates is usable", ignored));
    }
    Ok(roots)
}

/// Coarse failure class for log correlation.
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

async fn upgrade_to_tls(
    connector: &TlsConnector,
    io: BoxedIo,
    domain: &str,
) -> Result<tokio_rustls::client::TlsStream<BoxedIo>, ProbeError> {
    let server_name =
        ServerName::try_from(domain.to_string()).map_err(|e| ProbeError::HandshakeFailed {
            host: domain.to_string(),
            reason: format!("invalid server name: {}", e),
        })?;

    let stream = connector.connect(server_name, io).await.map_err(|e| {
        let detail = e.to_string();
        let classification = classify_handshake_error(&detail);
        error!(domain, error = %e, error_class = classification, "TLS handshake failed");
        ProbeError::HandshakeFailed {
            host: domain.to_string(),
            reason: format!("{} ({})", detail, classification),
        }
    })?;

    info!(domain, "TLS handshake complete");
    Ok(stream)
}
