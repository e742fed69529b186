//! Accept loop and builder wiring the engine together.
use crate::ca::{CertificateAuthority, CertificateManager};
use crate::config::ProxyConfig;
use crate::errors::Result;
use crate::forward::Forwarder;
use crate::hijack::{HijackerPool, PassThroughPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};

/// Builder for [`ProxyServer`]
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: ProxyConfig,
  ca: Option<CertificateAuthority>,
  hijackers: Option<Arc<dyn HijackerPool>>,
}

impl ProxyServerBuilder {
  /// Builder with default configuration
  pub fn new() -> Self {
    Self::default()
  }
  /// Replace the whole configuration
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = config;
    self
  }
  /// Root used to sign intercepted domains.
  ///
  /// Without one, the root is loaded from `ca_storage_path` when configured,
  /// or generated in memory.
  pub fn ca(mut self, ca: CertificateAuthority) -> Self {
    self.ca = Some(ca);
    self
  }
  /// Source of per-request hijackers, [`PassThroughPool`] by default
  pub fn hijackers(mut self, pool: Arc<dyn HijackerPool>) -> Self {
    self.hijackers = Some(pool);
    self
  }
  /// Create the server
  pub async fn build(self) -> Result<ProxyServer> {
    let ca = match self.ca {
      Some(ca) => ca,
      None => match &self.config.ca_storage_path {
        Some(path) => CertificateAuthority::open(path).await?,
        None => CertificateAuthority::generate()?,
      },
    };
    let hijackers = self
      .hijackers
      .unwrap_or_else(|| Arc::new(PassThroughPool));
    let forwarder = Forwarder::new(self.config, Arc::new(CertificateManager::new(ca)), hijackers)?;
    Ok(ProxyServer {
      forwarder: Arc::new(forwarder),
    })
  }
}

/// A forward proxy listening for clients
pub struct ProxyServer {
  forwarder: Arc<Forwarder>,
}

impl ProxyServer {
  /// See [`ProxyServerBuilder`]
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::new()
  }

  /// The engine serving each connection
  pub fn forwarder(&self) -> &Arc<Forwarder> {
    &self.forwarder
  }

  /// Root certificate clients must trust for intercepted hosts
  pub fn ca_cert_pem(&self) -> &str {
    self.forwarder.certs().ca().ca_cert_pem()
  }

  /// Bind `addr` and serve forever.
  pub async fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!("listening on {}", listener.local_addr()?);
    self.serve(listener).await
  }

  /// Serve clients from an already bound listener, one task per connection.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          tracing::error!("accept failed: {}", e);
          tokio::time::sleep(Duration::from_millis(50)).await;
          continue;
        }
      };
      if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("{}: nodelay: {}", peer, e);
      }
      let forwarder = self.forwarder.clone();
      tokio::spawn(async move {
        if let Err(e) = forwarder.serve(stream, peer).await {
          tracing::debug!("{}: {}", peer, e);
        }
      });
    }
  }

  /// Close every pooled upstream connection.
  pub fn shutdown(&self) {
    self.forwarder.client().pools().clear();
  }
}
