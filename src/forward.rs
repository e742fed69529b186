//! Per-connection request loop.
//!
//! Each request goes through `AwaitLine → AwaitHeaders → verdict` and is then
//! blocked, answered from an override source, or streamed to the origin and
//! back. `CONNECT` either becomes a raw tunnel or, when the host is selected
//! for decryption, a TLS session terminated here with the loop running again
//! over the decrypted stream.
use crate::body::BodyStreamer;
use crate::buffer::BufferedStream;
use crate::ca::CertificateManager;
use crate::client::{ProxyClient, ProxyRequest, Upstream};
use crate::config::ProxyConfig;
use crate::connector::Destination;
use crate::errors::{Error, Result};
use crate::header::{BodyFraming, Header};
use crate::hijack::{Hijacker, HijackerPool, Verdict};
use crate::line::RequestLine;
use crate::proxy::ProxyChain;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// A client connection: plain TCP or a TLS session terminated by the proxy.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

type ClientStream = BufferedStream<Box<dyn ClientIo>>;

/// What happens to the client connection after a request.
enum Next {
  KeepAlive,
  Close,
  Intercept { authority: String },
  Tunnel { dest: Destination, chain: Option<ProxyChain> },
  Upgrade(Upstream),
}

/// Serves client connections.
pub struct Forwarder {
  config: ProxyConfig,
  client: ProxyClient,
  certs: Arc<CertificateManager>,
  hijackers: Arc<dyn HijackerPool>,
}

impl Forwarder {
  /// Forwarder with its own upstream client and pools
  pub fn new(
    config: ProxyConfig,
    certs: Arc<CertificateManager>,
    hijackers: Arc<dyn HijackerPool>,
  ) -> Result<Self> {
    let client = ProxyClient::new(&config)?;
    Ok(Forwarder {
      config,
      client,
      certs,
      hijackers,
    })
  }

  /// The upstream client
  pub fn client(&self) -> &ProxyClient {
    &self.client
  }

  /// The certificate manager used for interception
  pub fn certs(&self) -> &CertificateManager {
    &self.certs
  }

  /// Serve one client connection until it closes or fails.
  pub async fn serve<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    self.serve_boxed(Box::new(stream), peer, None).await
  }

  /// `authority` is the `CONNECT` target when serving a decrypted tunnel.
  fn serve_boxed<'a>(
    &'a self,
    stream: Box<dyn ClientIo>,
    peer: SocketAddr,
    authority: Option<String>,
  ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
      let mut client: ClientStream =
        BufferedStream::with_timeouts(stream, None, self.config.write_timeout);
      let mut line = RequestLine::default();
      loop {
        line.reset();
        client.set_read_timeout(None);
        let read = tokio::time::timeout(
          self.config.max_client_idle_duration,
          line.read(&mut client, self.config.max_header_size),
        )
        .await;
        match read {
          Err(_) => {
            tracing::debug!("{} idle, dropping connection", peer);
            return Ok(());
          }
          Ok(Err(Error::ConnectionClosed)) => return Ok(()),
          Ok(Err(e)) => {
            respond_error(&mut client, &e).await;
            return Err(e);
          }
          Ok(Ok(())) => {}
        }
        client.set_read_timeout(self.config.read_timeout);
        let mut raw_header = Vec::new();
        let header = Header::read(&mut client, &mut raw_header, true, self.config.max_header_size)
          .await
          .and_then(|header| header.for_request().map_err(Error::from));
        let header = match header {
          Ok(header) => header,
          Err(e) => {
            respond_error(&mut client, &e).await;
            return Err(e);
          }
        };
        let tls = authority.is_some();
        if let Err(e) = line.resolve(authority.as_deref().or(header.host()), tls) {
          let e = Error::from(e);
          respond_error(&mut client, &e).await;
          return Err(e);
        }
        tracing::debug!("{} {} {}", peer, line.method(), line.target());

        let mut hijacker = self
          .hijackers
          .get(peer, tls, line.host(), line.port())
          .await;
        let next = self
          .handle(&mut client, &mut line, header, raw_header, hijacker.as_mut(), tls)
          .await;
        hijacker.on_finish().await;
        self.hijackers.put(hijacker).await;

        match next? {
          Next::KeepAlive => continue,
          Next::Close => return Ok(()),
          Next::Upgrade(mut upstream) => {
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
            return Ok(());
          }
          Next::Tunnel { dest, chain } => return self.tunnel(client, dest, chain).await,
          Next::Intercept { authority } => return self.intercept(client, peer, authority).await,
        }
      }
    })
  }

  async fn handle(
    &self,
    client: &mut ClientStream,
    line: &mut RequestLine,
    header: Header,
    raw_header: Vec<u8>,
    hijacker: &mut dyn Hijacker,
    tls: bool,
  ) -> Result<Next> {
    let (path, rewritten) = hijacker
      .before_request(line.method(), line.path(), &header, &raw_header)
      .await;
    if let Some(path) = path {
      line.set_path(path);
    }
    let raw_header = rewritten.unwrap_or(raw_header);
    let resolved = hijacker.resolve().await;
    let chain = hijacker
      .super_proxy()
      .await
      .or_else(|| self.config.upstream_proxy.clone());

    let verdict = Verdict::decide(hijacker, &header, &raw_header).await;
    tracing::debug!("{} {}: {:?}", line.method(), line.host_port(), verdict);
    let observer = match verdict {
      Verdict::Block => {
        write_canned(client, 403).await?;
        return Ok(Next::Close);
      }
      Verdict::Override(mut source) => {
        tokio::io::copy(&mut source, client.get_mut()).await?;
        client.flush().await?;
        return Ok(Next::Close);
      }
      Verdict::Continue => None,
      Verdict::Inspect(observer) => Some(observer),
    };

    if line.is_connect() {
      if self.config.decrypt.decrypts(line.host()) {
        return Ok(Next::Intercept {
          authority: line.host_port(),
        });
      }
      let dest = Destination {
        host: line.host().to_string(),
        port: line.port(),
        tls: false,
        resolved,
      };
      return Ok(Next::Tunnel { dest, chain });
    }

    let mut observer = observer;
    let request = ProxyRequest {
      line: &*line,
      header: &header,
      raw_header: &raw_header,
      dest: Destination {
        host: line.host().to_string(),
        port: line.port(),
        tls: tls || line.is_https(),
        resolved,
      },
      chain,
    };
    let mut exchange = match self
      .client
      .execute(request, client, observer.as_deref_mut())
      .await
    {
      Ok(exchange) => exchange,
      Err(e) => {
        tracing::warn!("{} {}: {}", line.method(), line.host_port(), e);
        respond_error(client, &e).await;
        return Ok(Next::Close);
      }
    };

    while exchange.status().is_informational() && exchange.status().code() != 101 {
      client.write_all(&exchange.head()).await?;
      client.flush().await?;
      exchange.next_head().await?;
    }
    if exchange.status().code() == 101 {
      client.write_all(&exchange.head()).await?;
      client.flush().await?;
      return Ok(match exchange.into_upstream() {
        Some(upstream) => Next::Upgrade(upstream),
        None => Next::Close,
      });
    }

    let mut observer = hijacker
      .on_response(exchange.status(), exchange.header(), exchange.raw_header())
      .await;
    let framing = exchange.header().framing();
    let origin_close = exchange.header().connection_close();
    client.write_all(&exchange.head()).await?;
    let streamed = BodyStreamer::new(framing)
      .write_timeout(self.config.write_timeout)
      .stream(exchange.upstream()?, client, observer.as_deref_mut())
      .await;
    exchange.finish(streamed.is_ok()).await;
    streamed?;

    let keep_alive = !header.connection_close()
      && !header.proxy_connection_close()
      && !origin_close
      && framing != BodyFraming::UntilClose
      && line.version() != "HTTP/1.0";
    Ok(if keep_alive { Next::KeepAlive } else { Next::Close })
  }

  async fn intercept(&self, mut client: ClientStream, peer: SocketAddr, authority: String) -> Result<()> {
    let host = authority
      .rsplit_once(':')
      .map(|(host, _)| host)
      .unwrap_or(&authority)
      .to_string();
    let leaf = match self.certs.sign_leaf(&host).await {
      Ok(leaf) => leaf,
      Err(e) => {
        let e = Error::from(e);
        tracing::warn!("cannot intercept {}: {}", authority, e);
        respond_error(&mut client, &e).await;
        return Err(e);
      }
    };
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let tls = acceptor.accept(client).await?;
    self.serve_boxed(Box::new(tls), peer, Some(authority)).await
  }

  async fn tunnel(&self, mut client: ClientStream, dest: Destination, chain: Option<ProxyChain>) -> Result<()> {
    let mut upstream = match self.client.connect(&dest, chain.as_ref()).await {
      Ok(upstream) => upstream,
      Err(e) => {
        tracing::warn!("tunnel to {}: {}", dest.host_port(), e);
        respond_error(&mut client, &e).await;
        return Err(e);
      }
    };
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
  }
}

fn canned(code: u16) -> Vec<u8> {
  let reason = http::StatusCode::from_u16(code)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("Error");
  format!(
    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    code, reason
  )
  .into_bytes()
}

async fn write_canned<W: AsyncWrite + Unpin>(client: &mut BufferedStream<W>, code: u16) -> Result<()> {
  client.write_all(&canned(code)).await?;
  client.flush().await
}

/// Best effort, the connection is closed right after.
async fn respond_error<W: AsyncWrite + Unpin>(client: &mut BufferedStream<W>, e: &Error) {
  if e.is_closed() {
    return;
  }
  if let Err(write_error) = write_canned(client, e.status_code()).await {
    tracing::debug!("cannot report {} to client: {}", e, write_error);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn canned_responses_close() {
    let forbidden = String::from_utf8(canned(403)).unwrap();
    assert!(forbidden.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(forbidden.contains("Connection: close\r\n"));
    let unavailable = String::from_utf8(canned(503)).unwrap();
    assert!(unavailable.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
  }
}
