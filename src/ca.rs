//! Root certificate authority and per-domain leaf certificates for interception.
//!
use crate::errors::{CertError, Result};
use crate::tls;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf validity in days
const LEAF_VALIDITY_DAYS: i64 = 90;
/// Backdate `not_before` against client clock skew
const NOT_BEFORE_OFFSET_SECS: i64 = 60 * 60;
/// Cached leaves are dropped well before they expire, never earlier
const CACHE_TTL: std::time::Duration =
  std::time::Duration::from_secs((LEAF_VALIDITY_DAYS as u64 / 2) * 24 * 60 * 60);

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// The root that signs every intercepted domain.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority").finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Use an existing root, PEM encoded.
  ///
  /// The certificate must carry the CA basic constraint, otherwise
  /// [`CertError::InvalidCertificateAuthority`] is returned.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| CertError::InvalidCertificateAuthority(format!("bad CA key: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| CertError::InvalidCertificateAuthority("no certificate in PEM".to_string()))?
      .map_err(|e| CertError::InvalidCertificateAuthority(e.to_string()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(ca_cert_der.as_ref())
      .map_err(|e| CertError::InvalidCertificateAuthority(format!("bad CA certificate: {}", e)))?;
    let constraints = cert
      .basic_constraints()
      .map_err(|e| CertError::InvalidCertificateAuthority(format!("bad basic constraints: {}", e)))?;
    if !constraints.is_some_and(|ext| ext.value.ca) {
      return Err(CertError::InvalidCertificateAuthority(
        "certificate is not a CA".to_string(),
      ));
    }
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| CertError::InvalidCertificateAuthority(e.to_string()))?;
    Ok(CertificateAuthority {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// A fresh self-signed root kept in memory only.
  pub fn generate() -> Result<Self, CertError> {
    let (cert_pem, key_pem) = generate_root()?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Load `ca_cert.pem` and `ca_key.pem` from a directory, generating and
  /// saving them on first use.
  pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref();
    if !storage_path.exists() {
      fs::create_dir_all(storage_path).await?;
    }
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      return Ok(Self::from_pem(&cert_pem, &key_pem)?);
    }
    let (cert_pem, key_pem) = generate_root()?;
    fs::write(&cert_path, cert_pem.as_bytes()).await?;
    fs::write(&key_path, key_pem.as_bytes()).await?;
    tracing::debug!("generated root CA in {}", storage_path.display());
    Ok(Self::from_pem(&cert_pem, &key_pem)?)
  }

  /// Root certificate for installing into client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate, DER
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Sign a new leaf for `domain`. Returns `[leaf, root]` and the leaf key.
  fn sign(
    &self,
    domain: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertError> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    params.subject_alt_names = match domain.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(
        domain
          .try_into()
          .map_err(|_| CertError::InvalidDomain(domain.to_string()))?,
      )],
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| CertError::Generate(e.to_string()))?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|e| CertError::Generate(e.to_string()))?;
    Ok((vec![cert.der().clone(), self.ca_cert_der.clone()], key_der))
  }
}

fn generate_root() -> Result<(String, String), CertError> {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "Ballista Proxy CA");
  dn.push(DnType::OrganizationName, "Ballista");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
  params.not_after = now + Duration::days(3650);

  let key_pair = KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;
  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| CertError::Generate(e.to_string()))?;
  Ok((cert.pem(), key_pair.serialize_pem()))
}

/// A signed leaf, ready to terminate TLS for one domain.
#[derive(Debug)]
pub struct LeafCert {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  server_config: Arc<ServerConfig>,
}

impl LeafCert {
  /// `[leaf, root]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
  /// Private key of the leaf
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }
  /// Server config presenting this leaf
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

/// Signs leaves on demand and remembers them per domain.
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  cache: Cache<String, Arc<LeafCert>>,
  issued: AtomicU64,
}

impl CertificateManager {
  /// Manager signing with the given root
  pub fn new(ca: CertificateAuthority) -> Self {
    let cache = Cache::builder().time_to_live(CACHE_TTL).build();
    CertificateManager {
      ca: Arc::new(ca),
      cache,
      issued: AtomicU64::new(0),
    }
  }

  /// The root
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// The leaf for `domain`, signing it on first use.
  ///
  /// Concurrent first requests for one domain share a single signing run and
  /// all receive the same certificate.
  pub async fn sign_leaf(&self, domain: &str) -> Result<Arc<LeafCert>, CertError> {
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    if domain.is_empty() {
      return Err(CertError::InvalidDomain(domain.to_string()));
    }
    self
      .cache
      .try_get_with(domain.to_string(), async {
        let (chain, key) = self.ca.sign(domain)?;
        let server_config = tls::server_config(chain.clone(), key.clone_key())
          .map_err(|e| CertError::Generate(e.to_string()))?;
        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("signed leaf for {}", domain);
        Ok::<_, CertError>(Arc::new(LeafCert {
          chain,
          key,
          server_config: Arc::new(server_config),
        }))
      })
      .await
      .map_err(|e| CertError::clone(&e))
  }

  /// Leaves signed so far
  pub fn issued(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn concurrent_sign_shares_one_leaf() {
    let manager = CertificateManager::new(CertificateAuthority::generate().unwrap());
    let leaves = futures::future::join_all((0..8).map(|_| manager.sign_leaf("example.com"))).await;
    let leaves: Vec<_> = leaves.into_iter().map(|leaf| leaf.unwrap()).collect();
    let a = leaves[0].clone();
    assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &a)));
    assert_eq!(a.chain()[1].as_ref(), manager.ca().ca_cert_der().as_ref());
    let again = manager.sign_leaf("example.com").await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(manager.issued(), 1);
  }

  #[tokio::test]
  async fn empty_domain_is_rejected() {
    let manager = CertificateManager::new(CertificateAuthority::generate().unwrap());
    let err = manager.sign_leaf("").await.unwrap_err();
    assert!(matches!(err, CertError::InvalidDomain(_)));
    assert_eq!(manager.issued(), 0);
  }

  #[tokio::test]
  async fn ip_literal_gets_a_leaf() {
    let manager = CertificateManager::new(CertificateAuthority::generate().unwrap());
    assert!(manager.sign_leaf("127.0.0.1").await.is_ok());
  }

  #[test]
  fn non_ca_root_is_rejected() {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec!["leaf.example".to_string()])
      .unwrap()
      .self_signed(&key)
      .unwrap();
    let err = CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).unwrap_err();
    assert!(matches!(err, CertError::InvalidCertificateAuthority(_)));

    // basic constraints present but cA = false
    let mut params = CertificateParams::new(vec!["leaf.example".to_string()]).unwrap();
    params.is_ca = IsCa::ExplicitNoCa;
    let cert = params.self_signed(&key).unwrap();
    let err = CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).unwrap_err();
    assert!(matches!(err, CertError::InvalidCertificateAuthority(_)));
  }

  #[tokio::test]
  async fn open_persists_the_root() {
    let dir = std::env::temp_dir().join(format!("ballista-ca-{}", rand::random::<u64>()));
    let first = CertificateAuthority::open(&dir).await.unwrap();
    let second = CertificateAuthority::open(&dir).await.unwrap();
    assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
