//! Group-internal TLS for the QUIC binding.
//!
//! Every endpoint presents a throwaway self-signed certificate and dialing
//! ranks accept any certificate. Handshake signatures are still checked
//! against the presented key, so a connection is at least bound to the
//! endpoint that answered.

use crate::error::{DiffuseError, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;

const ALPN: &[u8] = b"diffuse/1";

/// Name every rank's certificate is issued for and dialed with.
pub(crate) const SERVER_NAME: &str = "diffuse.local";

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn tls_err(e: impl std::fmt::Display) -> DiffuseError {
    DiffuseError::Tls(e.to_string())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Keep idle peer connections open between rounds.
pub(crate) fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.keep_alive_interval(Some(KEEP_ALIVE));
    if let Ok(idle) = quinn::IdleTimeout::try_from(IDLE_TIMEOUT) {
        config.max_idle_timeout(Some(idle));
    }
    Arc::new(config)
}

/// A freshly generated certificate and key for one endpoint.
pub(crate) struct EndpointIdentity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl EndpointIdentity {
    pub(crate) fn generate() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
        let cert = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
            .map_err(tls_err)?
            .self_signed(&key_pair)
            .map_err(tls_err)?;
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(tls_err)?;
        Ok(Self {
            cert: cert.der().clone(),
            key,
        })
    }

    pub(crate) fn server_config(
        self,
        transport: Arc<quinn::TransportConfig>,
    ) -> Result<quinn::ServerConfig> {
        let mut tls = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_err)?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert], self.key)
            .map_err(tls_err)?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let crypto = QuicServerConfig::try_from(Arc::new(tls)).map_err(tls_err)?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(transport);
        Ok(config)
    }
}

pub(crate) fn client_config(transport: Arc<quinn::TransportConfig>) -> Result<quinn::ClientConfig> {
    let provider = provider();
    let mut tls = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyGroupCert(provider)))
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(Arc::new(tls)).map_err(tls_err)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport);
    Ok(config)
}

/// Accepts any certificate chain, verifies handshake signatures.
#[derive(Debug)]
struct AnyGroupCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AnyGroupCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
