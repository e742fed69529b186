//! Header block parsing.
//!
//! The block is located with a peek-grow-retry loop over a [`BufferedStream`]:
//! peek a little, try to parse everything buffered, and when the terminating
//! empty line is not there yet wait for one byte more than is buffered.
use crate::buffer::BufferedStream;
use crate::errors::{Error, ParseError, Result};
use crate::line::StatusLine;
use tokio::io::AsyncRead;

/// How the end of a message body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFraming {
  /// `Content-Length: n`
  FixedLength(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Body runs until the peer closes
  #[default]
  UntilClose,
}

/// The fields the engine cares about, classified from a header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
  connection_close: bool,
  proxy_connection_close: bool,
  framing: BodyFraming,
  // Transfer-Encoding present with a final coding other than chunked
  unchunked_coding: bool,
  content_type: Option<String>,
  host: Option<String>,
}

fn is_proxy_header(name: &[u8]) -> bool {
  name.eq_ignore_ascii_case(b"proxy-connection")
    || name.eq_ignore_ascii_case(b"proxy-authenticate")
    || name.eq_ignore_ascii_case(b"proxy-authorization")
}

fn has_token(value: &str, token: &str) -> bool {
  value
    .split(',')
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

impl Header {
  /// Parse a header block from the start of `buf`.
  ///
  /// On success the block (up to and including the empty line) has been
  /// appended to `out`, minus proxy-only headers when `strip_proxy_headers`
  /// is set, and the number of bytes the block spans in `buf` is returned.
  /// An incomplete block yields [`ParseError::NeedMoreData`] and leaves `out`
  /// untouched.
  pub fn parse(
    buf: &[u8],
    out: &mut Vec<u8>,
    strip_proxy_headers: bool,
  ) -> Result<(Header, usize), ParseError> {
    let start = out.len();
    let result = Self::parse_into(buf, out, strip_proxy_headers);
    if result.is_err() {
      out.truncate(start);
    }
    result
  }

  fn parse_into(
    buf: &[u8],
    out: &mut Vec<u8>,
    strip_proxy_headers: bool,
  ) -> Result<(Header, usize), ParseError> {
    let mut header = Header::default();
    let mut content_length: Option<u64> = None;
    let mut transfer_encoding: Option<String> = None;
    let mut pos = 0;
    let mut skipping = false;
    let mut seen_field = false;
    loop {
      let nl = memchr::memchr(b'\n', &buf[pos..]).ok_or(ParseError::NeedMoreData)?;
      let line = &buf[pos..pos + nl + 1];
      pos += nl + 1;
      let content = line.strip_suffix(b"\n").unwrap_or(line);
      let content = content.strip_suffix(b"\r").unwrap_or(content);
      if content.is_empty() {
        out.extend_from_slice(line);
        break;
      }
      // obsolete line folding continues the previous field
      if content[0] == b' ' || content[0] == b'\t' {
        if !seen_field {
          return Err(ParseError::MalformedHeader);
        }
        if !skipping {
          out.extend_from_slice(line);
        }
        continue;
      }
      let colon = memchr::memchr(b':', content).ok_or(ParseError::MalformedHeader)?;
      let name = &content[..colon];
      if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::MalformedHeader);
      }
      let value = String::from_utf8_lossy(&content[colon + 1..]);
      let value = value.trim();
      if name.eq_ignore_ascii_case(b"connection") {
        header.connection_close |= has_token(value, "close");
      } else if name.eq_ignore_ascii_case(b"proxy-connection") {
        header.proxy_connection_close |= has_token(value, "close");
      } else if name.eq_ignore_ascii_case(b"content-length") {
        let n = value
          .parse::<u64>()
          .map_err(|_| ParseError::MalformedHeader)?;
        if content_length.is_some_and(|c| c != n) {
          return Err(ParseError::MalformedHeader);
        }
        content_length = Some(n);
      } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
        transfer_encoding = Some(value.to_string());
      } else if name.eq_ignore_ascii_case(b"content-type") {
        header.content_type = Some(value.to_string());
      } else if name.eq_ignore_ascii_case(b"host") {
        header.host = Some(value.to_string());
      }
      seen_field = true;
      skipping = strip_proxy_headers && is_proxy_header(name);
      if !skipping {
        out.extend_from_slice(line);
      }
    }
    header.framing = match (transfer_encoding, content_length) {
      (Some(te), _) => {
        let last = te.rsplit(',').next().unwrap_or_default().trim();
        if last.eq_ignore_ascii_case("chunked") {
          BodyFraming::Chunked
        } else {
          header.unchunked_coding = true;
          BodyFraming::UntilClose
        }
      }
      (None, Some(n)) => BodyFraming::FixedLength(n),
      (None, None) => BodyFraming::UntilClose,
    };
    Ok((header, pos))
  }

  /// Read and consume a header block from the source.
  pub async fn read<S: AsyncRead + Unpin>(
    src: &mut BufferedStream<S>,
    out: &mut Vec<u8>,
    strip_proxy_headers: bool,
    max_size: usize,
  ) -> Result<Header> {
    let mut n = 1;
    loop {
      src.peek(n).await?;
      let buf = src.buffer();
      match Header::parse(buf, out, strip_proxy_headers) {
        Ok((header, consumed)) => {
          src.discard(consumed);
          return Ok(header);
        }
        Err(ParseError::NeedMoreData) => {
          if buf.len() < n {
            return Err(if buf.is_empty() {
              Error::ConnectionClosed
            } else {
              Error::UnexpectedEof
            });
          }
          if buf.len() >= max_size {
            return Err(ParseError::HeaderTooLarge.into());
          }
          n = buf.len() + 1;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  /// Settle the framing of a request. Requests never run until close.
  ///
  /// A `Transfer-Encoding` whose final coding is not `chunked` leaves the
  /// request body without a length, so the request is rejected with
  /// [`ParseError::MalformedHeader`].
  pub fn for_request(mut self) -> Result<Self, ParseError> {
    if self.unchunked_coding {
      return Err(ParseError::MalformedHeader);
    }
    if self.framing == BodyFraming::UntilClose {
      self.framing = BodyFraming::FixedLength(0);
    }
    Ok(self)
  }

  /// Settle the framing of a response to a request with the given method.
  pub fn for_response(mut self, request_was_head: bool, status: &StatusLine) -> Self {
    let code = status.code();
    if request_was_head || status.is_informational() || code == 204 || code == 304 {
      self.framing = BodyFraming::FixedLength(0);
    }
    self
  }

  /// `Connection: close`
  pub fn connection_close(&self) -> bool {
    self.connection_close
  }
  /// `Proxy-Connection: close`
  pub fn proxy_connection_close(&self) -> bool {
    self.proxy_connection_close
  }
  /// Body framing
  pub fn framing(&self) -> BodyFraming {
    self.framing
  }
  /// `Content-Type` value
  pub fn content_type(&self) -> Option<&str> {
    self.content_type.as_deref()
  }
  /// `Host` value
  pub fn host(&self) -> Option<&str> {
    self.host.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  #[test]
  fn classifies_case_insensitively() {
    let raw = b"HOST: example.com\r\nconnection: Keep-Alive, Close\r\nContent-TYPE: text/plain\r\ncontent-length: 12\r\n\r\n";
    let mut out = Vec::new();
    let (header, consumed) = Header::parse(raw, &mut out, false).unwrap();
    assert_eq!(consumed, raw.len());
    assert_eq!(out, raw);
    assert!(header.connection_close());
    assert_eq!(header.content_type(), Some("text/plain"));
    assert_eq!(header.host(), Some("example.com"));
    assert_eq!(header.framing(), BodyFraming::FixedLength(12));
  }

  #[test]
  fn transfer_encoding_wins() {
    let raw = b"Content-Length: 5\r\nTransfer-Encoding: gzip, chunked\r\n\r\nbody";
    let mut out = Vec::new();
    let (header, consumed) = Header::parse(raw, &mut out, false).unwrap();
    assert_eq!(header.framing(), BodyFraming::Chunked);
    assert_eq!(consumed, raw.len() - 4);
  }

  #[test]
  fn request_body_must_end_chunked() {
    let raw = b"Host: a\r\nTransfer-Encoding: gzip\r\n\r\nGET http://b/ HTTP/1.1\r\n\r\n";
    let mut out = Vec::new();
    let (header, _) = Header::parse(raw, &mut out, false).unwrap();
    assert_eq!(header.clone().for_request(), Err(ParseError::MalformedHeader));

    // a response may still run until close
    let ok = StatusLine::parse(b"HTTP/1.1 200 OK\r\n").unwrap();
    assert_eq!(header.for_response(false, &ok).framing(), BodyFraming::UntilClose);
  }

  #[test]
  fn strips_proxy_headers() {
    let raw = b"Host: a\r\nProxy-Connection: close\r\nProxy-Authorization: Basic eA==\r\nAccept: */*\r\n\r\n";
    let mut out = Vec::new();
    let (header, _) = Header::parse(raw, &mut out, true).unwrap();
    assert!(header.proxy_connection_close());
    assert_eq!(out, b"Host: a\r\nAccept: */*\r\n\r\n");
  }

  #[test]
  fn incomplete_block_leaves_output_untouched() {
    let mut out = b"GET / HTTP/1.1\r\n".to_vec();
    assert_eq!(
      Header::parse(b"Host: a\r\nAcc", &mut out, false),
      Err(ParseError::NeedMoreData)
    );
    assert_eq!(out, b"GET / HTTP/1.1\r\n");
    assert_eq!(
      Header::parse(b"Host a\r\n\r\n", &mut out, false),
      Err(ParseError::MalformedHeader)
    );
  }

  #[test]
  fn bodiless_messages() {
    let mut out = Vec::new();
    let (header, _) = Header::parse(b"\r\n", &mut out, false).unwrap();
    assert_eq!(
      header.clone().for_request().unwrap().framing(),
      BodyFraming::FixedLength(0)
    );
    assert_eq!(header.framing(), BodyFraming::UntilClose);
    let no_content = StatusLine::parse(b"HTTP/1.1 204 No Content\r\n").unwrap();
    assert_eq!(
      header.clone().for_response(false, &no_content).framing(),
      BodyFraming::FixedLength(0)
    );
    let ok = StatusLine::parse(b"HTTP/1.1 200 OK\r\n").unwrap();
    assert_eq!(
      header.for_response(true, &ok).framing(),
      BodyFraming::FixedLength(0)
    );
  }

  #[tokio::test]
  async fn read_grows_until_block_complete() {
    let (mut client, server) = tokio::io::duplex(16);
    let mut src = BufferedStream::new(server);
    let writer = tokio::spawn(async move {
      for piece in [&b"Host: exa"[..], b"mple.com\r", b"\nX-A: 1\r\n", b"\r\nrest"] {
        client.write_all(piece).await.unwrap();
        tokio::task::yield_now().await;
      }
      client
    });
    let mut out = Vec::new();
    let header = Header::read(&mut src, &mut out, true, 1024).await.unwrap();
    assert_eq!(header.host(), Some("example.com"));
    assert_eq!(out, b"Host: example.com\r\nX-A: 1\r\n\r\n");
    let _client = writer.await.unwrap();
    assert_eq!(src.peek(4).await.unwrap(), b"rest");
  }

  #[tokio::test]
  async fn read_rejects_oversized_block() {
    let data = vec![b'a'; 300];
    let mut src = BufferedStream::new(&data[..]);
    let err = Header::read(&mut src, &mut Vec::new(), false, 128)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Parse(ParseError::HeaderTooLarge)));
  }
}
