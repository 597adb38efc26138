//! TLS configuration for the bus
//!
//! Listeners present either a freshly generated self-signed certificate or
//! one loaded from DER files. Clients encrypt without verifying the chain.

use std::fs;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use odb_core::{OdbError, OdbResult};

use crate::CertificateConfig;

fn tls_err(e: impl std::fmt::Display) -> OdbError {
    OdbError::Transport(format!("tls: {}", e))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Build the acceptor used by a listening bus
pub fn acceptor(cert_config: &CertificateConfig) -> OdbResult<TlsAcceptor> {
    let (cert_chain, private_key) = match cert_config {
        CertificateConfig::SelfSigned { hostnames } => generate_self_signed_cert(hostnames)?,
        CertificateConfig::DerFiles {
            cert_chain,
            private_key,
        } => {
            let certs = cert_chain
                .iter()
                .map(|path| fs::read(path).map(CertificateDer::from))
                .collect::<Result<Vec<_>, _>>()
                .map_err(tls_err)?;
            let key = PrivateKeyDer::try_from(fs::read(private_key).map_err(tls_err)?)
                .map_err(tls_err)?;
            (certs, key)
        }
    };

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(tls_err)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector used for outgoing connections
pub fn connector() -> OdbResult<TlsConnector> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name presented during the handshake
pub fn server_name(host: &str) -> OdbResult<ServerName<'static>> {
    ServerName::try_from(host.to_owned()).map_err(tls_err)
}

fn generate_self_signed_cert(
    hostnames: &[String],
) -> OdbResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(hostnames.to_vec()).map_err(tls_err)?;

    let key_der = cert.key_pair.serialize_der();
    let cert_der = cert.cert.der().to_vec();

    Ok((
        vec![CertificateDer::from(cert_der)],
        PrivateKeyDer::try_from(key_der).map_err(tls_err)?,
    ))
}

/// Accepts any server certificate; the connection is encrypted but the
/// peer is not authenticated (the bus token does that).
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
