//! Upstream dialing: socket options, proxy hops and TLS layering.
use crate::config::ProxyConfig;
use crate::errors::{new_io_error, Error, Result};
use crate::proxy::{Proxy, ProxyChain};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use socket2::{SockRef, TcpKeepalive};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Idle time before the first keepalive probe on upstream sockets
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Where an upstream connection should end up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  /// Origin host name or literal address
  pub host: String,
  /// Origin port
  pub port: u16,
  /// Speak TLS to the origin
  pub tls: bool,
  /// Dial this address instead of resolving `host`. SNI still uses `host`.
  pub resolved: Option<IpAddr>,
}

impl Destination {
  /// `host:port`, bracketing IPv6 literals
  pub fn host_port(&self) -> String {
    join_host_port(&self.host, self.port)
  }
}

fn join_host_port(host: &str, port: u16) -> String {
  if host.contains(':') && !host.starts_with('[') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

fn bare_host(host: &str) -> &str {
  host.trim_start_matches('[').trim_end_matches(']')
}

/// Dials origins and super-proxies and layers TLS where needed.
pub struct Connector {
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .field("keepalive", &self.keepalive)
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// Connector with the socket options, deadlines and origin trust of `config`
  pub fn new(config: &ProxyConfig) -> Result<Self> {
    let client_config = tls::client_config(&config.root_certificates, config.danger_accept_invalid_certs)?;
    Ok(Connector {
      connect_timeout: config.connect_timeout,
      read_timeout: config.read_timeout,
      write_timeout: config.write_timeout,
      nodelay: config.nodelay,
      keepalive: config.keepalive,
      tls: TlsConnector::from(Arc::new(client_config)),
    })
  }

  /// Open a TCP connection to one address.
  pub async fn connect_addr(&self, addr: SocketAddr) -> Result<Socket> {
    let socket = match addr {
      SocketAddr::V4(_) => TcpSocket::new_v4()?,
      SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_nodelay(self.nodelay)?;
    if self.keepalive {
      let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
      SockRef::from(&socket).set_tcp_keepalive(&keepalive)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(t) => tokio::time::timeout(t, socket.connect(addr)).await??,
    };
    Ok(Socket::new(MaybeTlsStream::Tcp(stream), self.read_timeout, self.write_timeout))
  }
  /// Resolve `host` (unless an address is forced) and connect to the first
  /// address that accepts.
  pub async fn connect_host(&self, host: &str, port: u16, resolved: Option<IpAddr>) -> Result<Socket> {
    let host = bare_host(host);
    let addrs: Vec<SocketAddr> = match resolved.or_else(|| host.parse().ok()) {
      Some(ip) => vec![SocketAddr::new(ip, port)],
      None => tokio::net::lookup_host((host, port)).await?.collect(),
    };
    let mut last_error = None;
    for addr in addrs {
      match self.connect_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => {
          tracing::debug!("connect {} ({}) failed: {}", host, addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(std::io::ErrorKind::InvalidData, "no addr in url")
    }))
  }
  /// Run a TLS client handshake over the socket, whatever it already carries.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = ServerName::try_from(bare_host(domain).to_owned())
      .map_err(|e| Error::Other(e.to_string()))?;
    Ok(stream.tls(&self.tls, domain).await?)
  }
  /// Open a connection to the destination, through every hop of the chain.
  ///
  /// Each hop is asked for a tunnel to the next hop, the last one for a tunnel
  /// to the destination. TLS to an `https` hop or to the origin runs over the
  /// tunnel built so far.
  pub async fn establish(&self, dest: &Destination, chain: Option<&ProxyChain>) -> Result<Socket> {
    let hops = chain.map(|c| c.hops()).unwrap_or_default();
    let Some(first) = hops.first() else {
      let socket = self.connect_host(&dest.host, dest.port, dest.resolved).await?;
      return if dest.tls {
        self.upgrade_to_tls(socket, &dest.host).await
      } else {
        Ok(socket)
      };
    };
    let mut socket = self.connect_host(first.host(), first.port(), None).await?;
    if first.is_tls() {
      socket = self.upgrade_to_tls(socket, first.host()).await?;
    }
    for (i, hop) in hops.iter().enumerate() {
      let next = hops.get(i + 1);
      let (host, port) = match next {
        Some(next) => (next.host().to_string(), next.port()),
        None => (
          dest
            .resolved
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| dest.host.clone()),
          dest.port,
        ),
      };
      tracing::debug!("tunnel via {}:{} to {}:{}", hop.host(), hop.port(), host, port);
      match hop {
        Proxy::HTTP(h) => h.open_tunnel(&mut socket, &join_host_port(&host, port)).await?,
        Proxy::Socket(s) => {
          s.open_tunnel(&mut socket, &host, port).await?;
        }
      }
      if let Some(next) = next.filter(|n| n.is_tls()) {
        socket = self.upgrade_to_tls(socket, next.host()).await?;
      }
    }
    if dest.tls {
      socket = self.upgrade_to_tls(socket, &dest.host).await?;
    }
    Ok(socket)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_port_brackets_ipv6() {
    let dest = Destination {
      host: "::1".to_string(),
      port: 443,
      tls: true,
      resolved: None,
    };
    assert_eq!(dest.host_port(), "[::1]:443");
    assert_eq!(join_host_port("example.com", 80), "example.com:80");
  }

  #[tokio::test]
  async fn direct_connect_to_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = Connector::new(&ProxyConfig::default()).unwrap();
    let dest = Destination {
      host: "localhost".to_string(),
      port,
      tls: false,
      resolved: Some("127.0.0.1".parse().unwrap()),
    };
    let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
    let socket = connector.establish(&dest, None).await.unwrap();
    assert_eq!(socket.tls_depth(), 0);
    accept.await.unwrap().unwrap();
  }
}
