//! Proxy configuration
use crate::pool::PoolConfig;
use crate::proxy::ProxyChain;
use crate::tls::Certificate;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which `CONNECT` targets are TLS-terminated and inspected.
#[derive(Clone, Default)]
pub enum DecryptPolicy {
  /// Intercept every tunnel
  #[default]
  All,
  /// Relay every tunnel as opaque bytes
  None,
  /// Intercept the hosts the predicate accepts
  Hosts(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl DecryptPolicy {
  /// Whether a tunnel to `host` is intercepted
  pub fn decrypts(&self, host: &str) -> bool {
    match self {
      DecryptPolicy::All => true,
      DecryptPolicy::None => false,
      DecryptPolicy::Hosts(f) => f(host),
    }
  }
}

impl fmt::Debug for DecryptPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DecryptPolicy::All => f.write_str("All"),
      DecryptPolicy::None => f.write_str("None"),
      DecryptPolicy::Hosts(_) => f.write_str("Hosts(..)"),
    }
  }
}

/// Configuration of the proxy engine
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Limits of each destination pool
  pub pool: PoolConfig,
  /// Timeout of each upstream read
  pub read_timeout: Option<Duration>,
  /// Timeout of each upstream and client write
  pub write_timeout: Option<Duration>,
  /// Timeout of the TCP connect phase
  pub connect_timeout: Option<Duration>,
  /// How long a client connection may sit idle between requests
  pub max_client_idle_duration: Duration,
  /// Largest accepted request line or header block
  pub max_header_size: usize,
  /// Largest request body kept for replay on retry
  pub max_replay_body_size: usize,
  /// `TCP_NODELAY` on upstream sockets
  pub nodelay: bool,
  /// `SO_KEEPALIVE` on upstream sockets
  pub keepalive: bool,
  /// Roots trusted for origins, used when invalid certificates are refused.
  /// Without any, every origin is refused then.
  pub root_certificates: Vec<Certificate>,
  /// Accept any origin certificate
  pub danger_accept_invalid_certs: bool,
  /// Which tunnels are intercepted
  pub decrypt: DecryptPolicy,
  /// Proxies used when the hijacker does not pick any
  pub upstream_proxy: Option<ProxyChain>,
  /// Directory holding `ca_cert.pem`/`ca_key.pem`. A fresh root is generated
  /// in memory when unset.
  pub ca_storage_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      pool: PoolConfig::default(),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      max_client_idle_duration: Duration::from_secs(60),
      max_header_size: 64 * 1024,
      max_replay_body_size: 64 * 1024,
      nodelay: true,
      keepalive: false,
      root_certificates: vec![],
      danger_accept_invalid_certs: true,
      decrypt: DecryptPolicy::All,
      upstream_proxy: None,
      ca_storage_path: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = ProxyConfig::default();
    assert_eq!(config.pool.max_conns, 512);
    assert_eq!(config.pool.max_idle_conn_duration, Duration::from_secs(10));
    assert_eq!(config.max_header_size, 64 * 1024);
    assert!(config.decrypt.decrypts("example.com"));
  }

  #[test]
  fn host_policy() {
    let policy = DecryptPolicy::Hosts(Arc::new(|host| host.ends_with(".example.com")));
    assert!(policy.decrypts("api.example.com"));
    assert!(!policy.decrypts("example.org"));
    assert!(!DecryptPolicy::None.decrypts("api.example.com"));
  }
}
