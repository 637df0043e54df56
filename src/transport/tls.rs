//! TLS client side for direct TLS, STARTTLS and `wss://`.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, warn};

use super::BoxedStream;
use crate::error::TransportError;

/// The process-wide provider, installed on first use.
fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| {
            // Another component may have installed one already; either is fine.
            let _ = ring::default_provider().install_default();
            Arc::new(ring::default_provider())
        })
        .clone()
}

/// Accepts any certificate chain but still checks handshake signatures.
/// Only reachable through `insecure_tls` / `--dangerous-insecure-tls`.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// System trust anchors. Individual unparsable certificates are skipped.
fn native_roots() -> Result<RootCertStore, TransportError> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        debug!(error = %e, "Skipping unreadable certificate source");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        debug!(added, ignored, "Some system certificates could not be parsed");
    }
    if roots.is_empty() {
        return Err(TransportError::Tls(
            "no system root certificates available (is the ca-certificates package installed?)".to_string(),
        ));
    }
    Ok(roots)
}

pub fn client_config(insecure: bool) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = if insecure {
        warn!("Certificate verification is off for this connection");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate {
                algorithms: provider.signature_verification_algorithms,
            }))
            .with_no_client_auth()
    } else {
        builder.with_root_certificates(native_roots()?).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Rough bucket for a failed handshake, for the log line.
fn failure_kind(e: &std::io::Error) -> &'static str {
    let text = e.to_string().to_ascii_lowercase();
    if text.contains("certificate") {
        "certificate"
    } else if text.contains("timed out") || text.contains("timeout") {
        "timeout"
    } else if e.kind() == std::io::ErrorKind::UnexpectedEof || text.contains("reset") {
        "closed-by-peer"
    } else {
        "other"
    }
}

/// Runs the client handshake over `stream`, verifying the certificate
/// against `host` (also sent as SNI).
pub async fn upgrade_to_tls(stream: BoxedStream, host: &str, insecure: bool) -> Result<BoxedStream, TransportError> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("'{}' is not a valid server name: {}", host, e)))?;
    let connector = TlsConnector::from(client_config(insecure)?);

    let tls = connector.connect(name, stream).await.map_err(|e| {
        let kind = failure_kind(&e);
        error!(host, kind, error = %e, "TLS handshake failed");
        TransportError::Tls(format!("handshake with {} failed ({}): {}", host, kind, e))
    })?;
    debug!(host, "TLS established");
    Ok(Box::new(tls))
}
