use crate::body::{BodyStreamer, Observer};
use crate::buffer::BufferedStream;
use crate::config::ProxyConfig;
use crate::connector::{Connector, Destination};
use crate::errors::{Error, Result};
use crate::header::{BodyFraming, Header};
use crate::line::{RequestLine, StatusLine};
use crate::pool::{DestinationPool, DestinationPoolRegistry, PoolKey, PooledConnection};
use crate::proxy::{ProxyChain, Route};
use crate::socket::Socket;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Attempts per request, the first one included.
pub const MAX_ATTEMPTS: usize = 5;

/// A pooled upstream connection.
pub type Upstream = BufferedStream<Socket>;

/// A request as the client sends it upstream.
#[derive(Debug)]
pub struct ProxyRequest<'a> {
  /// Request line; sent in origin form
  pub line: &'a RequestLine,
  /// Classified header; its framing drives the body
  pub header: &'a Header,
  /// Header block sent verbatim after the request line
  pub raw_header: &'a [u8],
  /// Where to send it
  pub dest: Destination,
  /// Proxies to go through
  pub chain: Option<ProxyChain>,
}

/// Upstream side of the proxy: pooled connections and bounded retries.
pub struct ProxyClient {
  connector: Connector,
  pools: DestinationPoolRegistry<Upstream>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  max_header_size: usize,
  max_replay_body_size: usize,
}

impl ProxyClient {
  /// Client with its own pools
  pub fn new(config: &ProxyConfig) -> Result<Self> {
    Ok(ProxyClient {
      connector: Connector::new(config)?,
      pools: DestinationPoolRegistry::new(config.pool),
      read_timeout: config.read_timeout,
      write_timeout: config.write_timeout,
      max_header_size: config.max_header_size,
      max_replay_body_size: config.max_replay_body_size,
    })
  }

  /// The connection pools
  pub fn pools(&self) -> &DestinationPoolRegistry<Upstream> {
    &self.pools
  }

  /// A fresh, unpooled connection, e.g. for a raw `CONNECT` tunnel.
  pub async fn connect(&self, dest: &Destination, chain: Option<&ProxyChain>) -> Result<Socket> {
    self.connector.establish(dest, chain).await
  }

  /// Send the request and read the response head.
  ///
  /// The request body is read from `body` once and kept for replay, up to
  /// `max_replay_body_size`. When the origin closes the connection before the
  /// first response byte, `GET`, `HEAD`, `PUT` and `DELETE` are resent on a
  /// new connection, up to [`MAX_ATTEMPTS`] times in all. Everything else
  /// ends in [`Error::ConnectionClosedBeforeResponse`].
  pub async fn execute<S>(
    &self,
    request: ProxyRequest<'_>,
    body: &mut BufferedStream<S>,
    observer: Option<&mut (dyn Observer + 'static)>,
  ) -> Result<Exchange>
  where
    S: AsyncRead + Unpin,
  {
    let key = PoolKey {
      addr: request.dest.host_port(),
      resolved: request.dest.resolved,
      proxy: request.chain.as_ref().map(|c| c.to_string()),
      tls: request.dest.tls,
    };
    let route = Route::classify(request.chain.as_ref(), request.dest.tls);
    let via_proxy = route.via_proxy();
    tracing::debug!("{} {} via {:?}", request.line.method(), key.addr, route);
    let mut head = request.line.to_origin_line();
    head.extend_from_slice(request.raw_header);

    let connector = &self.connector;
    let dest = &request.dest;
    let chain = request.chain.as_ref();
    let (read_timeout, write_timeout) = (self.read_timeout, self.write_timeout);
    let dial = move || async move {
      let socket = connector.establish(dest, chain).await?;
      Ok(BufferedStream::with_timeouts(socket, read_timeout, write_timeout))
    };

    let mut observer = observer;
    let mut replay: Option<Vec<u8>> = None;
    let mut attempts = 0;
    loop {
      attempts += 1;
      let (pool, mut conn) = self.pools.acquire(&key, dial).await?;
      let sent = if let Some(bytes) = replay.as_deref() {
        send_replay(conn.stream_mut(), bytes).await
      } else if attempts == 1 {
        let framing = request.header.framing();
        match self
          .send_first(conn.stream_mut(), &head, framing, body, observer.take())
          .await
        {
          Ok(recorded) => {
            replay = recorded;
            Ok(())
          }
          Err(e) => Err(e),
        }
      } else {
        Err(Error::ConnectionClosedBeforeResponse)
      };
      if let Err(e) = sent {
        pool.close(conn);
        return Err(e);
      }
      match first_byte(conn.stream_mut()).await {
        Ok(true) => {}
        Ok(false) => {
          pool.close(conn);
          if request.line.is_idempotent() && replay.is_some() && attempts < MAX_ATTEMPTS {
            tracing::debug!(
              "{} closed before responding, attempt {} of {}",
              key.addr,
              attempts,
              MAX_ATTEMPTS
            );
            continue;
          }
          return Err(Error::ConnectionClosedBeforeResponse);
        }
        Err(e) => {
          pool.close(conn);
          return Err(e);
        }
      }
      let mut exchange = Exchange {
        pool,
        conn: Some(conn),
        status: StatusLine::default(),
        header: Header::default(),
        raw_header: Vec::new(),
        request_was_head: request.line.is_head(),
        request_close: request.header.connection_close(),
        via_proxy,
        attempts,
        max_header_size: self.max_header_size,
      };
      exchange.next_head().await?;
      return Ok(exchange);
    }
  }

  async fn send_first<S>(
    &self,
    upstream: &mut Upstream,
    head: &[u8],
    framing: BodyFraming,
    body: &mut BufferedStream<S>,
    observer: Option<&mut (dyn Observer + 'static)>,
  ) -> Result<Option<Vec<u8>>>
  where
    S: AsyncRead + Unpin,
  {
    let mut recorder = Recorder::new(upstream, head.len() + self.max_replay_body_size);
    timed(self.write_timeout, recorder.write_all(head)).await?;
    BodyStreamer::new(framing)
      .write_timeout(self.write_timeout)
      .stream(body, &mut recorder, observer)
      .await?;
    timed(self.write_timeout, recorder.flush()).await?;
    Ok(recorder.into_replay())
  }
}

async fn send_replay(upstream: &mut Upstream, bytes: &[u8]) -> Result<()> {
  upstream.write_all(bytes).await?;
  upstream.flush().await
}

/// `false` when the peer closed before sending anything.
async fn first_byte(upstream: &mut Upstream) -> Result<bool> {
  match upstream.peek(1).await {
    Ok(peeked) => Ok(!peeked.is_empty()),
    Err(Error::IO(e))
      if matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
      ) =>
    {
      Ok(false)
    }
    Err(e) => Err(e),
  }
}

async fn timed<F, T>(timeout: Option<Duration>, f: F) -> Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match timeout {
    None => Ok(f.await?),
    Some(t) => Ok(tokio::time::timeout(t, f).await??),
  }
}

/// One response in flight and the connection it arrives on.
pub struct Exchange {
  pool: Arc<DestinationPool<Upstream>>,
  conn: Option<PooledConnection<Upstream>>,
  status: StatusLine,
  header: Header,
  raw_header: Vec<u8>,
  request_was_head: bool,
  request_close: bool,
  via_proxy: bool,
  attempts: usize,
  max_header_size: usize,
}

impl std::fmt::Debug for Exchange {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Exchange")
      .field("status", &self.status)
      .field("header", &self.header)
      .field("via_proxy", &self.via_proxy)
      .field("attempts", &self.attempts)
      .finish()
  }
}

impl Exchange {
  /// Response status line
  pub fn status(&self) -> &StatusLine {
    &self.status
  }
  /// Classified response header, framing settled for the request method
  pub fn header(&self) -> &Header {
    &self.header
  }
  /// Response header block with proxy-only headers removed
  pub fn raw_header(&self) -> &[u8] {
    &self.raw_header
  }
  /// Status line and header block as sent to the client
  pub fn head(&self) -> Vec<u8> {
    let mut head = self.status.to_bytes();
    head.extend_from_slice(&self.raw_header);
    head
  }
  /// Attempts it took to get a response
  pub fn attempts(&self) -> usize {
    self.attempts
  }
  /// The upstream connection, positioned at the response body.
  pub fn upstream(&mut self) -> Result<&mut Upstream> {
    self
      .conn
      .as_mut()
      .map(|c| c.stream_mut())
      .ok_or(Error::ConnectionClosed)
  }
  /// Read the next response head, after an interim `1xx` was relayed.
  pub async fn next_head(&mut self) -> Result<()> {
    let max_header_size = self.max_header_size;
    let request_was_head = self.request_was_head;
    let result = async {
      let upstream = self.upstream()?;
      let status = StatusLine::read(upstream, max_header_size).await?;
      let mut raw_header = Vec::new();
      let header = Header::read(upstream, &mut raw_header, true, max_header_size)
        .await?
        .for_response(request_was_head, &status);
      Ok::<_, Error>((status, header, raw_header))
    }
    .await;
    match result {
      Ok((status, header, raw_header)) => {
        self.status = status;
        self.header = header;
        self.raw_header = raw_header;
        Ok(())
      }
      Err(e) => {
        self.discard();
        Err(e)
      }
    }
  }
  /// Whether the connection may serve another request once the body is read.
  pub fn reusable(&self) -> bool {
    !self.via_proxy
      && !self.request_close
      && !self.header.connection_close()
      && self.header.framing() != BodyFraming::UntilClose
      && self.status.code() != 101
  }
  /// Take the connection out of the pool's hands, e.g. after `101`.
  pub fn into_upstream(mut self) -> Option<Upstream> {
    let conn = self.conn.take()?;
    Some(self.pool.detach(conn))
  }
  /// Return the connection: pooled when `complete` and [`Exchange::reusable`],
  /// closed otherwise.
  pub async fn finish(mut self, complete: bool) {
    let Some(conn) = self.conn.take() else {
      return;
    };
    if complete && self.reusable() {
      self.pool.release(conn).await;
    } else {
      self.pool.close(conn);
    }
  }
  fn discard(&mut self) {
    if let Some(conn) = self.conn.take() {
      self.pool.close(conn);
    }
  }
}

impl Drop for Exchange {
  fn drop(&mut self) {
    self.discard();
  }
}

/// Writes through to the upstream and keeps a copy for replay while the copy
/// fits its budget.
struct Recorder<'a, W: ?Sized> {
  inner: &'a mut W,
  record: Vec<u8>,
  cap: usize,
  overflowed: bool,
}

impl<'a, W: ?Sized> Recorder<'a, W> {
  fn new(inner: &'a mut W, cap: usize) -> Self {
    Recorder {
      inner,
      record: Vec::new(),
      cap,
      overflowed: false,
    }
  }
  fn keep(&mut self, data: &[u8]) {
    if self.overflowed {
      return;
    }
    if self.record.len() + data.len() > self.cap {
      self.overflowed = true;
      self.record = Vec::new();
      return;
    }
    self.record.extend_from_slice(data);
  }
  fn into_replay(self) -> Option<Vec<u8>> {
    (!self.overflowed).then_some(self.record)
  }
}

impl<W: AsyncWrite + Unpin + ?Sized> AsyncWrite for Recorder<'_, W> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    let this = self.get_mut();
    let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
    if let Poll::Ready(Ok(n)) = poll {
      this.keep(&buf[..n]);
    }
    poll
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
  }
}
