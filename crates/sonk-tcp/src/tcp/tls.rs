//! TLS for the framing engine.
//!
//! - Client side: `tokio_rustls` connector with a policy verifier — fully
//!   trusted chains pass, self-signed certificates whose subject equals
//!   their issuer pass as the sole allowed chain issue, everything else is
//!   rejected. A caller-supplied validation hook runs first and may return
//!   an explicit accept/reject; returning no decision falls back to the
//!   policy.
//! - Server side: `TlsAcceptor` built from a PEM certificate + key pair.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore};
use x509_parser::prelude::*;

use crate::tcp::error::{TcpError, TcpResult};

/// Outcome of the caller's validation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationDecision {
    Accept,
    Reject,
    /// No decision; the default policy applies.
    Unspecified,
}

/// What the policy concluded about the presented chain, handed to the hook.
#[derive(Debug, Clone)]
pub enum ChainStatus {
    Trusted,
    /// Chain did not verify, but the end entity is self-signed
    /// (subject == issuer).
    SelfSigned,
    Invalid(String),
}

/// Context passed to the validation hook.
pub struct CertificateCheck<'a> {
    pub server_name: String,
    pub end_entity: &'a [u8],
    pub status: &'a ChainStatus,
}

pub type ValidationHook = dyn Fn(&CertificateCheck<'_>) -> ValidationDecision + Send + Sync;

/// Client-side TLS knobs that do not belong in the serde config surface.
#[derive(Clone, Default)]
pub struct ClientTlsOptions {
    /// Extra trust anchors, PEM-encoded. Without any, only the self-signed
    /// allowance can pass.
    pub root_ca_pem: Option<Vec<u8>>,
    pub validation_hook: Option<Arc<ValidationHook>>,
}

/// Server identity: PEM certificate chain plus PEM private key.
#[derive(Clone)]
pub struct ServerCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

// ── Client connector ─────────────────────────────────────────────────

pub(crate) fn build_client_connector(
    options: &ClientTlsOptions,
) -> TcpResult<tokio_rustls::TlsConnector> {
    let mut roots = RootCertStore::empty();
    if let Some(pem) = &options.root_ca_pem {
        let mut cursor = std::io::Cursor::new(pem.clone());
        for cert in rustls_pemfile::certs(&mut cursor) {
            let cert = cert.map_err(|e| TcpError::tls(format!("bad root CA PEM: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| TcpError::tls(format!("unusable root CA: {}", e)))?;
        }
    }

    // The webpki verifier refuses to build over an empty store; with no
    // anchors configured every chain is Invalid unless self-signed.
    let inner = if roots.is_empty() {
        None
    } else {
        Some(
            WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TcpError::tls(format!("verifier build: {}", e)))?,
        )
    };

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let verifier = Arc::new(PolicyVerifier {
        inner,
        hook: options.validation_hook.clone(),
        algorithms: provider.signature_verification_algorithms,
    });

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

struct PolicyVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    hook: Option<Arc<ValidationHook>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for PolicyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyVerifier")
            .field("has_roots", &self.inner.is_some())
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let status = match &self.inner {
            Some(webpki) => match webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(_) => ChainStatus::Trusted,
                Err(e) => classify_failure(end_entity, e),
            },
            None => classify_failure(
                end_entity,
                rustls::Error::General("no trust anchors configured".into()),
            ),
        };

        if let Some(hook) = &self.hook {
            let check = CertificateCheck {
                server_name: format!("{:?}", server_name),
                end_entity: end_entity.as_ref(),
                status: &status,
            };
            match hook(&check) {
                ValidationDecision::Accept => return Ok(ServerCertVerified::assertion()),
                ValidationDecision::Reject => {
                    return Err(rustls::Error::General(
                        "certificate rejected by validation callback".into(),
                    ))
                }
                ValidationDecision::Unspecified => {}
            }
        }

        match status {
            ChainStatus::Trusted | ChainStatus::SelfSigned => Ok(ServerCertVerified::assertion()),
            ChainStatus::Invalid(reason) => Err(rustls::Error::General(reason)),
        }
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn classify_failure(end_entity: &CertificateDer<'_>, err: rustls::Error) -> ChainStatus {
    if is_self_signed(end_entity.as_ref()) {
        ChainStatus::SelfSigned
    } else {
        ChainStatus::Invalid(err.to_string())
    }
}

/// Subject == issuer on the end entity.
fn is_self_signed(der: &[u8]) -> bool {
    match X509Certificate::from_der(der) {
        Ok((_, cert)) => {
            cert.tbs_certificate.subject.as_raw() == cert.tbs_certificate.issuer.as_raw()
        }
        Err(_) => false,
    }
}

// ── Server acceptor ──────────────────────────────────────────────────

pub(crate) fn build_acceptor(cert: &ServerCertificate) -> TcpResult<tokio_rustls::TlsAcceptor> {
    let mut cursor = std::io::Cursor::new(cert.cert_pem.clone());
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TcpError::tls(format!("bad certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(TcpError::tls("certificate PEM holds no certificates"));
    }

    let mut key_cursor = std::io::Cursor::new(cert.key_pem.clone());
    let key = rustls_pemfile::private_key(&mut key_cursor)
        .map_err(|e| TcpError::tls(format!("bad key PEM: {}", e)))?
        .ok_or_else(|| TcpError::tls("key PEM holds no private key"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| TcpError::tls(format!("server TLS config: {}", e)))?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_build_a_connector() {
        assert!(build_client_connector(&ClientTlsOptions::default()).is_ok());
    }

    #[test]
    fn garbage_root_pem_is_rejected() {
        let options = ClientTlsOptions {
            root_ca_pem: Some(b"-----BEGIN CERTIFICATE-----\nnot base64!!\n-----END CERTIFICATE-----\n".to_vec()),
            validation_hook: None,
        };
        assert!(build_client_connector(&options).is_err());
    }

    #[test]
    fn non_der_bytes_are_not_self_signed() {
        assert!(!is_self_signed(b"definitely not a certificate"));
    }

    #[test]
    fn empty_server_pem_is_rejected() {
        let cert = ServerCertificate {
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
        };
        let err = match build_acceptor(&cert) {
            Err(e) => e,
            Ok(_) => panic!("expected build_acceptor to fail"),
        };
        assert_eq!(err.kind, crate::tcp::error::TcpErrorKind::Tls);
    }
}
