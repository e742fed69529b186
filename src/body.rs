//! Body streaming.
//!
//! A [`BodyStreamer`] moves one message body from a [`BufferedStream`] to a
//! primary writer, handing every segment to an optional [`Observer`] at the
//! same time. Nothing is buffered beyond what the source already holds.
use crate::buffer::BufferedStream;
use crate::errors::{Error, ParseError, Result};
use crate::header::BodyFraming;
use crate::line::peek_line;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const MAX_CHUNK_LINE: usize = 4096;

/// Side channel that sees a copy of a body while it is forwarded.
#[async_trait]
pub trait Observer: Send {
  /// A chunk size line, verbatim including its CRLF.
  async fn on_chunk_header(&mut self, _line: &[u8]) -> std::io::Result<()> {
    Ok(())
  }
  /// A slice of body payload. Chunk framing is never passed here.
  async fn on_body(&mut self, data: &[u8]) -> std::io::Result<()>;
  /// The body is complete.
  async fn on_end(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

/// Observer that writes payload bytes into any [`AsyncWrite`].
#[derive(Debug)]
pub struct WriterObserver<W> {
  inner: W,
}

impl<W> WriterObserver<W> {
  /// Wrap a writer
  pub fn new(inner: W) -> Self {
    WriterObserver { inner }
  }
  /// Unwrap
  pub fn into_inner(self) -> W {
    self.inner
  }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Observer for WriterObserver<W> {
  async fn on_body(&mut self, data: &[u8]) -> std::io::Result<()> {
    self.inner.write_all(data).await
  }
  async fn on_end(&mut self) -> std::io::Result<()> {
    self.inner.flush().await
  }
}

/// An observer that is dropped after its first failure.
struct ObserverSlot<'a> {
  inner: Option<&'a mut (dyn Observer + 'static)>,
}

#[derive(Clone, Copy)]
enum Segment {
  Body,
  ChunkHeader,
  Framing,
}

impl ObserverSlot<'_> {
  async fn deliver(&mut self, data: &[u8], segment: Segment) {
    let Some(observer) = self.inner.as_mut() else {
      return;
    };
    let result = match segment {
      Segment::Body => observer.on_body(data).await,
      Segment::ChunkHeader => observer.on_chunk_header(data).await,
      Segment::Framing => Ok(()),
    };
    if let Err(e) = result {
      tracing::warn!("body observer failed, detaching it: {}", e);
      self.inner = None;
    }
  }
  async fn end(&mut self) {
    if let Some(observer) = self.inner.as_mut() {
      if let Err(e) = observer.on_end().await {
        tracing::warn!("body observer failed at end of body: {}", e);
      }
    }
    self.inner = None;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Fixed(u64),
  UntilClose,
  ChunkSize,
  ChunkData(u64),
  ChunkEnd,
  Trailer,
  Done,
}

/// Streams exactly one body according to its framing.
#[derive(Debug)]
pub struct BodyStreamer {
  state: State,
  write_timeout: Option<Duration>,
  transferred: u64,
}

impl BodyStreamer {
  /// Streamer for a body with the given framing
  pub fn new(framing: BodyFraming) -> Self {
    let state = match framing {
      BodyFraming::FixedLength(0) => State::Done,
      BodyFraming::FixedLength(n) => State::Fixed(n),
      BodyFraming::Chunked => State::ChunkSize,
      BodyFraming::UntilClose => State::UntilClose,
    };
    BodyStreamer {
      state,
      write_timeout: None,
      transferred: 0,
    }
  }
  /// Apply a timeout to every write into the primary sink.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.write_timeout = timeout;
    self
  }
  /// The body has been forwarded completely.
  pub fn is_done(&self) -> bool {
    self.state == State::Done
  }
  /// Payload bytes forwarded so far, chunk framing excluded.
  pub fn transferred(&self) -> u64 {
    self.transferred
  }

  /// Forward the body from `src` to `primary`, mirroring it to `observer`.
  ///
  /// A failing primary aborts the transfer. A failing observer is logged and
  /// detached, the transfer goes on without it.
  pub async fn stream<S, W>(
    &mut self,
    src: &mut BufferedStream<S>,
    primary: &mut W,
    observer: Option<&mut (dyn Observer + 'static)>,
  ) -> Result<u64>
  where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
  {
    let mut observer = ObserverSlot { inner: observer };
    if self.state == State::Done {
      observer.end().await;
      return Ok(self.transferred);
    }
    loop {
      match self.state {
        State::Done => break,
        State::Fixed(remaining) => {
          let n = self.forward_payload(src, primary, &mut observer, Some(remaining)).await?;
          self.state = if n == remaining {
            State::Done
          } else {
            State::Fixed(remaining - n)
          };
        }
        State::UntilClose => {
          if self.forward_payload(src, primary, &mut observer, None).await? == 0 {
            self.state = State::Done;
          }
        }
        State::ChunkSize => {
          let len = peek_line(src, MAX_CHUNK_LINE).await.map_err(eof_in_body)?;
          let size = parse_chunk_size(&src.buffer()[..len])?;
          self
            .deliver(primary, &mut observer, &src.buffer()[..len], Segment::ChunkHeader)
            .await?;
          src.discard(len);
          self.state = if size == 0 {
            State::Trailer
          } else {
            State::ChunkData(size)
          };
        }
        State::ChunkData(remaining) => {
          let n = self.forward_payload(src, primary, &mut observer, Some(remaining)).await?;
          self.state = if n == remaining {
            State::ChunkEnd
          } else {
            State::ChunkData(remaining - n)
          };
        }
        State::ChunkEnd => {
          let peeked = src.peek(2).await?;
          let len = if peeked.starts_with(b"\r\n") {
            2
          } else if peeked.starts_with(b"\n") {
            1
          } else if peeked.is_empty() || peeked == b"\r" {
            return Err(Error::UnexpectedEof);
          } else {
            return Err(ParseError::MalformedChunk.into());
          };
          let line = &src.buffer()[..len];
          self.deliver(primary, &mut observer, line, Segment::Framing).await?;
          src.discard(len);
          self.state = State::ChunkSize;
        }
        State::Trailer => {
          let len = peek_line(src, MAX_CHUNK_LINE).await.map_err(eof_in_body)?;
          let line = &src.buffer()[..len];
          let last = line == b"\r\n" || line == b"\n";
          self.deliver(primary, &mut observer, line, Segment::Framing).await?;
          src.discard(len);
          if last {
            self.state = State::Done;
          }
        }
      }
    }
    self.flush(primary).await?;
    observer.end().await;
    Ok(self.transferred)
  }

  /// Forward whatever is buffered, at most `limit` bytes. Returns 0 only at
  /// end of stream of an unbounded body.
  async fn forward_payload<S, W>(
    &mut self,
    src: &mut BufferedStream<S>,
    primary: &mut W,
    observer: &mut ObserverSlot<'_>,
    limit: Option<u64>,
  ) -> Result<u64>
  where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
  {
    if src.buffered() == 0 && src.fill_buf().await? == 0 {
      return match limit {
        Some(_) => Err(Error::UnexpectedEof),
        None => Ok(0),
      };
    }
    let available = src.buffered();
    let n = match limit {
      Some(limit) => available.min(usize::try_from(limit).unwrap_or(usize::MAX)),
      None => available,
    };
    self
      .deliver(primary, observer, &src.buffer()[..n], Segment::Body)
      .await?;
    src.discard(n);
    self.transferred += n as u64;
    Ok(n as u64)
  }

  async fn deliver<W>(
    &self,
    primary: &mut W,
    observer: &mut ObserverSlot<'_>,
    data: &[u8],
    segment: Segment,
  ) -> Result<()>
  where
    W: AsyncWrite + Unpin + ?Sized,
  {
    let write = async {
      match self.write_timeout {
        None => primary.write_all(data).await?,
        Some(t) => tokio::time::timeout(t, primary.write_all(data)).await??,
      }
      Ok::<(), Error>(())
    };
    let (written, ()) = tokio::join!(write, observer.deliver(data, segment));
    written
  }

  async fn flush<W: AsyncWrite + Unpin + ?Sized>(&self, primary: &mut W) -> Result<()> {
    match self.write_timeout {
      None => primary.flush().await?,
      Some(t) => tokio::time::timeout(t, primary.flush()).await??,
    }
    Ok(())
  }
}

fn eof_in_body(e: Error) -> Error {
  match e {
    Error::ConnectionClosed => Error::UnexpectedEof,
    e => e,
  }
}

/// Parse `hex[;ext]CRLF`.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
  let line = line.strip_suffix(b"\n").ok_or(ParseError::InvalidChunkSize)?;
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let size = match memchr::memchr(b';', line) {
    Some(p) => &line[..p],
    None => line,
  };
  let size = std::str::from_utf8(size)
    .map_err(|_| ParseError::InvalidChunkSize)?
    .trim();
  if size.is_empty() || size.len() > 16 {
    return Err(ParseError::InvalidChunkSize);
  }
  u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunkSize)
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Recorder {
    headers: Vec<Vec<u8>>,
    body: Vec<u8>,
    ended: bool,
  }

  #[async_trait]
  impl Observer for Recorder {
    async fn on_chunk_header(&mut self, line: &[u8]) -> std::io::Result<()> {
      self.headers.push(line.to_vec());
      Ok(())
    }
    async fn on_body(&mut self, data: &[u8]) -> std::io::Result<()> {
      self.body.extend_from_slice(data);
      Ok(())
    }
    async fn on_end(&mut self) -> std::io::Result<()> {
      self.ended = true;
      Ok(())
    }
  }

  struct Broken(usize);

  #[async_trait]
  impl Observer for Broken {
    async fn on_body(&mut self, _data: &[u8]) -> std::io::Result<()> {
      self.0 += 1;
      Err(std::io::Error::other("observer gone"))
    }
  }

  fn recorder() -> Recorder {
    Recorder {
      headers: vec![],
      body: vec![],
      ended: false,
    }
  }

  #[tokio::test]
  async fn fixed_length_forwards_exactly_n() {
    let mut src = BufferedStream::new(&b"hello worldNEXT"[..]);
    let mut out = Vec::new();
    let mut obs = recorder();
    let mut streamer = BodyStreamer::new(BodyFraming::FixedLength(11));
    let n = streamer.stream(&mut src, &mut out, Some(&mut obs)).await.unwrap();
    assert_eq!(n, 11);
    assert_eq!(out, b"hello world");
    assert_eq!(obs.body, b"hello world");
    assert!(obs.ended);
    assert!(streamer.is_done());
    assert_eq!(src.buffer(), b"NEXT");
  }

  #[tokio::test]
  async fn fixed_length_early_close() {
    let mut src = BufferedStream::new(&b"short"[..]);
    let mut streamer = BodyStreamer::new(BodyFraming::FixedLength(10));
    let err = streamer
      .stream(&mut src, &mut Vec::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::UnexpectedEof));
  }

  #[tokio::test]
  async fn chunked_keeps_framing_on_primary_and_payload_on_observer() {
    let wire = b"5;name=v\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nGET /";
    let mut src = BufferedStream::new(&wire[..]);
    let mut out = Vec::new();
    let mut obs = recorder();
    let mut streamer = BodyStreamer::new(BodyFraming::Chunked);
    let n = streamer.stream(&mut src, &mut out, Some(&mut obs)).await.unwrap();
    assert_eq!(n, 11);
    assert_eq!(out, &wire[..wire.len() - 5]);
    assert_eq!(obs.body, b"hello world");
    assert_eq!(
      obs.headers,
      vec![b"5;name=v\r\n".to_vec(), b"6\r\n".to_vec(), b"0\r\n".to_vec()]
    );
    assert!(streamer.is_done());
    assert_eq!(src.buffer(), b"GET /");
  }

  #[tokio::test]
  async fn chunked_rejects_bad_framing() {
    let mut src = BufferedStream::new(&b"zz\r\n"[..]);
    let err = BodyStreamer::new(BodyFraming::Chunked)
      .stream(&mut src, &mut Vec::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Parse(ParseError::InvalidChunkSize)));
    let mut src = BufferedStream::new(&b"2\r\nabXY"[..]);
    let err = BodyStreamer::new(BodyFraming::Chunked)
      .stream(&mut src, &mut Vec::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Parse(ParseError::MalformedChunk)));
  }

  #[tokio::test]
  async fn until_close_ends_at_eof() {
    let mut src = BufferedStream::new(&b"everything"[..]);
    let mut out = Vec::new();
    let n = BodyStreamer::new(BodyFraming::UntilClose)
      .stream(&mut src, &mut out, None)
      .await
      .unwrap();
    assert_eq!(n, 10);
    assert_eq!(out, b"everything");
  }

  #[tokio::test]
  async fn failing_observer_is_detached() {
    let (mut tx, rx) = tokio::io::duplex(4);
    let feeder = tokio::spawn(async move {
      for _ in 0..3 {
        tx.write_all(b"abcd").await.unwrap();
      }
    });
    let mut src = BufferedStream::new(rx);
    let mut out = Vec::new();
    let mut broken = Broken(0);
    let n = BodyStreamer::new(BodyFraming::FixedLength(12))
      .stream(&mut src, &mut out, Some(&mut broken))
      .await
      .unwrap();
    feeder.await.unwrap();
    assert_eq!(n, 12);
    assert_eq!(out, b"abcdabcdabcd");
    assert_eq!(broken.0, 1);
  }
}
