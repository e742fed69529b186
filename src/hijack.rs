//! Hooks that inspect, reroute or answer proxied requests.
//!
//! A [`HijackerPool`] hands out one [`Hijacker`] per request. The forwarder
//! calls the hooks in this order: `before_request`, `resolve`, `super_proxy`,
//! `block`, `hijack_response`, `on_request`, then `on_response` once the
//! response head arrives, and `on_finish` in every case.
use crate::body::Observer;
use crate::header::Header;
use crate::line::StatusLine;
use crate::proxy::ProxyChain;
use http::Method;
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncRead;

/// Bytes sent to the client verbatim in place of an upstream response.
pub type OverrideSource = Box<dyn AsyncRead + Send + Unpin>;

/// Per-request hooks.
#[async_trait::async_trait]
pub trait Hijacker: Send {
  /// Called once the request head is parsed. May return a new path and a new
  /// raw header block (all header lines plus the terminating empty line).
  async fn before_request(
    &mut self,
    _method: &Method,
    _path: &str,
    _header: &Header,
    _raw_header: &[u8],
  ) -> (Option<String>, Option<Vec<u8>>) {
    (None, None)
  }
  /// Dial this address instead of resolving the host.
  async fn resolve(&mut self) -> Option<IpAddr> {
    None
  }
  /// Reach the origin through these proxies.
  async fn super_proxy(&mut self) -> Option<ProxyChain> {
    None
  }
  /// Refuse the request with `403 Forbidden`.
  async fn block(&mut self) -> bool {
    false
  }
  /// Answer the request from this source instead of the origin.
  async fn hijack_response(&mut self) -> Option<OverrideSource> {
    None
  }
  /// Observer for the request body.
  async fn on_request(&mut self, _header: &Header, _raw_header: &[u8]) -> Option<Box<dyn Observer>> {
    None
  }
  /// Observer for the response body.
  async fn on_response(
    &mut self,
    _status: &StatusLine,
    _header: &Header,
    _raw_header: &[u8],
  ) -> Option<Box<dyn Observer>> {
    None
  }
  /// The request is over, successfully or not.
  async fn on_finish(&mut self) {}
}

/// Source of hijackers.
#[async_trait::async_trait]
pub trait HijackerPool: Send + Sync {
  /// A hijacker for one request from `client_addr` to `host:port`.
  async fn get(&self, client_addr: SocketAddr, is_tls: bool, host: &str, port: u16) -> Box<dyn Hijacker>;
  /// Return a hijacker after `on_finish`.
  async fn put(&self, _hijacker: Box<dyn Hijacker>) {}
}

/// What the forwarder does with a request, fixed before any upstream I/O.
pub enum Verdict {
  /// Forward without observers
  Continue,
  /// Answer `403 Forbidden`
  Block,
  /// Answer from the given source
  Override(OverrideSource),
  /// Forward, mirroring the request body to the observer
  Inspect(Box<dyn Observer>),
}

impl std::fmt::Debug for Verdict {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Verdict::Continue => "Continue",
      Verdict::Block => "Block",
      Verdict::Override(_) => "Override",
      Verdict::Inspect(_) => "Inspect",
    };
    f.write_str(name)
  }
}

impl Verdict {
  /// Ask the hijacker, in hook order.
  pub async fn decide(hijacker: &mut dyn Hijacker, header: &Header, raw_header: &[u8]) -> Verdict {
    if hijacker.block().await {
      return Verdict::Block;
    }
    if let Some(source) = hijacker.hijack_response().await {
      return Verdict::Override(source);
    }
    match hijacker.on_request(header, raw_header).await {
      Some(observer) => Verdict::Inspect(observer),
      None => Verdict::Continue,
    }
  }
}

/// Forwards everything untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait::async_trait]
impl Hijacker for PassThrough {}

/// Hands out [`PassThrough`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughPool;

#[async_trait::async_trait]
impl HijackerPool for PassThroughPool {
  async fn get(&self, _client_addr: SocketAddr, _is_tls: bool, _host: &str, _port: u16) -> Box<dyn Hijacker> {
    Box::new(PassThrough)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Blocking;

  #[async_trait::async_trait]
  impl Hijacker for Blocking {
    async fn block(&mut self) -> bool {
      true
    }
    async fn hijack_response(&mut self) -> Option<OverrideSource> {
      Some(Box::new(&b"HTTP/1.1 200 OK\r\n\r\n"[..]))
    }
  }

  struct Overriding;

  #[async_trait::async_trait]
  impl Hijacker for Overriding {
    async fn hijack_response(&mut self) -> Option<OverrideSource> {
      Some(Box::new(&b"HTTP/1.1 200 OK\r\n\r\n"[..]))
    }
  }

  #[tokio::test]
  async fn block_wins_over_override() {
    let header = Header::default();
    let verdict = Verdict::decide(&mut Blocking, &header, b"\r\n").await;
    assert!(matches!(verdict, Verdict::Block));
    let verdict = Verdict::decide(&mut Overriding, &header, b"\r\n").await;
    assert!(matches!(verdict, Verdict::Override(_)));
    let verdict = Verdict::decide(&mut PassThrough, &header, b"\r\n").await;
    assert!(matches!(verdict, Verdict::Continue));
  }
}
