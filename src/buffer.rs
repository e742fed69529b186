//! Buffered byte source with peek/discard, shared by the parsers and the body streamer.
use crate::errors::Result;
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// A stream wrapper that keeps unread bytes so callers can look ahead.
///
/// Reads through [`AsyncRead`] drain the look-ahead buffer before touching the
/// inner stream, writes pass straight through.
#[derive(Debug)]
pub struct BufferedStream<S> {
  inner: S,
  buf: BytesMut,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl<S> BufferedStream<S> {
  /// Wrap a stream without timeouts.
  pub fn new(inner: S) -> Self {
    Self::with_timeouts(inner, None, None)
  }
  /// Wrap a stream, applying the timeouts to every read from and write to the inner stream.
  pub fn with_timeouts(
    inner: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner,
      buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
      read_timeout,
      write_timeout,
    }
  }
  /// Number of bytes read from the inner stream but not consumed yet.
  pub fn buffered(&self) -> usize {
    self.buf.len()
  }
  /// The unconsumed bytes.
  pub fn buffer(&self) -> &[u8] {
    &self.buf
  }
  /// Drop up to `n` buffered bytes.
  pub fn discard(&mut self, n: usize) -> usize {
    let n = n.min(self.buf.len());
    self.buf.advance(n);
    n
  }
  /// Gets a reference to the underlying stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Gets a mutable reference to the underlying stream.
  ///
  /// Reading from it directly skips whatever is still buffered.
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }
  /// Consumes the wrapper, returning the stream and the unread bytes.
  pub fn into_parts(self) -> (S, BytesMut) {
    (self.inner, self.buf)
  }
  pub(crate) fn set_read_timeout(&mut self, timeout: Option<Duration>) {
    self.read_timeout = timeout;
  }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
  /// Read once from the inner stream into the buffer.
  ///
  /// Returns the number of new bytes, `0` at end of stream.
  pub async fn fill_buf(&mut self) -> Result<usize> {
    if self.buf.capacity() - self.buf.len() < DEFAULT_BUF_SIZE / 4 {
      self.buf.reserve(DEFAULT_BUF_SIZE);
    }
    let n = match self.read_timeout {
      None => self.inner.read_buf(&mut self.buf).await?,
      Some(t) => tokio::time::timeout(t, self.inner.read_buf(&mut self.buf)).await??,
    };
    Ok(n)
  }
  /// Look at the next `n` bytes without consuming them.
  ///
  /// Waits until `n` bytes are buffered or the stream ends, so the returned
  /// slice is shorter than `n` only at end of stream.
  pub async fn peek(&mut self, n: usize) -> Result<&[u8]> {
    while self.buf.len() < n {
      if self.fill_buf().await? == 0 {
        break;
      }
    }
    let end = n.min(self.buf.len());
    Ok(&self.buf[..end])
  }
}

impl<S: AsyncWrite + Unpin> BufferedStream<S> {
  /// Attempts to write an entire buffer into the inner stream.
  pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
    match self.write_timeout {
      None => self.inner.write_all(buf).await?,
      Some(t) => tokio::time::timeout(t, self.inner.write_all(buf)).await??,
    }
    Ok(())
  }
  /// Flushes the inner stream.
  pub async fn flush(&mut self) -> Result<()> {
    match self.write_timeout {
      None => self.inner.flush().await?,
      Some(t) => tokio::time::timeout(t, self.inner.flush()).await??,
    }
    Ok(())
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let me = self.get_mut();
    if !me.buf.is_empty() {
      let amt = me.buf.len().min(buf.remaining());
      buf.put_slice(&me.buf[..amt]);
      me.buf.advance(amt);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut me.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn peek_waits_for_bytes_and_discard_consumes() {
    let (mut a, b) = tokio::io::duplex(64);
    let mut stream = BufferedStream::new(b);
    tokio::spawn(async move {
      a.write_all(b"he").await.unwrap();
      tokio::task::yield_now().await;
      a.write_all(b"llo").await.unwrap();
    });
    assert_eq!(stream.peek(5).await.unwrap(), b"hello");
    assert_eq!(stream.discard(2), 2);
    let mut rest = String::new();
    stream.read_to_string(&mut rest).await.unwrap();
    assert_eq!(rest, "llo");
  }

  #[tokio::test]
  async fn peek_is_short_at_eof() {
    let mut stream = BufferedStream::new(&b"ab"[..]);
    assert_eq!(stream.peek(10).await.unwrap(), b"ab");
    assert_eq!(stream.buffered(), 2);
  }

  #[tokio::test]
  async fn read_timeout_fires() {
    let (_a, b) = tokio::io::duplex(64);
    let mut stream = BufferedStream::with_timeouts(b, Some(Duration::from_millis(20)), None);
    let err = stream.peek(1).await.unwrap_err();
    assert!(matches!(err, crate::Error::Timeout));
  }
}
