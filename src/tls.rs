//! TLS configuration for both sides of the proxy.
//!
use crate::errors::{builder, Result};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, Error as TLSError, SignatureScheme};

/// A trusted root for upstream connections.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: CertificateDer<'static>,
}

impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Certificate {
    Certificate {
      der: CertificateDer::from(der.to_vec()),
    }
  }

  /// Every certificate of a PEM bundle such as `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> Result<Vec<Certificate>> {
    rustls_pemfile::certs(&mut &pem_bundle[..])
      .map(|result| match result {
        Ok(der) => Ok(Certificate { der }),
        Err(_) => Err(builder("invalid certificate encoding")),
      })
      .collect()
  }
}

pub(crate) fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client side config for dialing origins and `https` super-proxies.
///
/// With `accept_invalid_certs` every server certificate is accepted.
/// Otherwise the chain and host name are verified against `roots` only, so
/// an empty `roots` rejects every server.
pub(crate) fn client_config(
  roots: &[Certificate],
  accept_invalid_certs: bool,
) -> Result<rustls::ClientConfig> {
  let provider = provider();
  let algorithms = provider.signature_verification_algorithms;
  let config_builder = rustls::ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .map_err(|_| builder("invalid TLS versions"))?;
  let config = if accept_invalid_certs {
    config_builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier { algorithms }))
      .with_no_client_auth()
  } else {
    let mut root_cert_store = rustls::RootCertStore::empty();
    for cert in roots {
      root_cert_store.add(cert.der.clone()).map_err(builder)?;
    }
    if root_cert_store.is_empty() {
      tracing::warn!("certificate verification is on without root certificates");
    }
    config_builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  };
  Ok(config)
}

/// Server side config presenting a signed leaf to an intercepted client.
pub(crate) fn server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
  let mut config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|_| builder("invalid TLS versions"))?
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(config)
}

#[derive(Debug)]
pub(crate) struct NoVerifier {
  algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.algorithms.supported_schemes()
  }
}
