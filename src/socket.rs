//! Upstream transport: TCP with any number of TLS layers on top.
//!
//! A tunnel through an `https` super-proxy is TLS to the proxy carrying TLS to
//! the origin, so [`MaybeTlsStream`] nests.
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// TCP, or TLS over another `MaybeTlsStream`.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<MaybeTlsStream>>),
}

trait Io: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Io for T {}

impl MaybeTlsStream {
  fn io(&mut self) -> Pin<&mut dyn Io> {
    match self {
      MaybeTlsStream::Tcp(tcp) => Pin::new(tcp),
      MaybeTlsStream::Tls(tls) => Pin::new(tls.as_mut()),
    }
  }
  /// The TCP connection under every TLS layer.
  pub fn tcp(&self) -> &TcpStream {
    match self {
      MaybeTlsStream::Tcp(tcp) => tcp,
      MaybeTlsStream::Tls(tls) => tls.get_ref().0.tcp(),
    }
  }
  /// Number of TLS layers
  pub fn tls_depth(&self) -> usize {
    match self {
      MaybeTlsStream::Tcp(_) => 0,
      MaybeTlsStream::Tls(tls) => 1 + tls.get_ref().0.tls_depth(),
    }
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    self.get_mut().io().poll_read(cx, buf)
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    self.get_mut().io().poll_write(cx, buf)
  }
  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.get_mut().io().poll_flush(cx)
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.get_mut().io().poll_shutdown(cx)
  }
}

/// Upstream connection with the deadlines configured on the connector.
///
/// The deadlines bind the handshake helpers below. Once wrapped in a
/// [`BufferedStream`](crate::BufferedStream) the wrapper applies its own.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Socket {
  pub(crate) fn new(inner: MaybeTlsStream, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
    Socket {
      inner,
      read_timeout,
      write_timeout,
    }
  }
  /// Run a TLS client handshake over whatever this socket already is.
  pub(crate) async fn tls(self, connector: &TlsConnector, domain: ServerName<'static>) -> io::Result<Self> {
    let handshake = connector.connect(domain, self.inner);
    let stream = within(self.read_timeout, handshake).await?;
    Ok(Socket {
      inner: MaybeTlsStream::Tls(Box::new(stream)),
      ..self
    })
  }
  /// Timeout of each handshake read
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
  /// Timeout of each handshake write
  pub fn write_timeout(&self) -> Option<Duration> {
    self.write_timeout
  }
  /// Number of TLS layers
  pub fn tls_depth(&self) -> usize {
    self.inner.tls_depth()
  }
  /// Address of the first hop, the super-proxy when there is one
  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    self.inner.tcp().peer_addr()
  }
  /// The transport
  pub fn get_ref(&self) -> &MaybeTlsStream {
    &self.inner
  }

  pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    within(self.read_timeout, self.inner.read_exact(buf)).await
  }
  pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    within(self.write_timeout, self.inner.write_all(buf)).await
  }
  pub(crate) async fn flush(&mut self) -> io::Result<()> {
    within(self.write_timeout, self.inner.flush()).await
  }
}

async fn within<T>(deadline: Option<Duration>, f: impl Future<Output = io::Result<T>>) -> io::Result<T> {
  match deadline {
    None => f.await,
    Some(t) => tokio::time::timeout(t, f).await?,
  }
}

impl AsyncRead for Socket {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }
  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
