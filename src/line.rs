//! Request and status line parsing.
use crate::buffer::BufferedStream;
use crate::errors::{Error, ParseError, Result};
use http::uri::Authority;
use http::Method;
use std::str::FromStr;
use tokio::io::AsyncRead;

/// Shape of the request target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetForm {
  /// `/path?query`
  #[default]
  Origin,
  /// `host:port`, only for CONNECT
  Authority,
  /// `scheme://host[:port]/path`
  Absolute,
}

/// First line of a request, decomposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
  method: Method,
  target: String,
  form: TargetForm,
  https: bool,
  host: String,
  port: u16,
  path: String,
  version: String,
}

impl Default for RequestLine {
  fn default() -> Self {
    RequestLine {
      method: Method::GET,
      target: String::new(),
      form: TargetForm::Origin,
      https: false,
      host: String::new(),
      port: 0,
      path: String::new(),
      version: String::new(),
    }
  }
}

/// Locate the end of the next line, waiting for more bytes as needed.
///
/// Returns the line length including its `\n`.
pub(crate) async fn peek_line<S: AsyncRead + Unpin>(
  src: &mut BufferedStream<S>,
  max_len: usize,
) -> Result<usize> {
  let mut searched = 0;
  loop {
    let buffered = src.buffer();
    if let Some(p) = memchr::memchr(b'\n', &buffered[searched..]) {
      return Ok(searched + p + 1);
    }
    searched = buffered.len();
    if searched >= max_len {
      return Err(ParseError::HeaderTooLarge.into());
    }
    if src.fill_buf().await? == 0 {
      return if searched == 0 {
        Err(Error::ConnectionClosed)
      } else {
        Err(Error::UnexpectedEof)
      };
    }
  }
}

fn trim_line(line: &[u8]) -> Result<&str, ParseError> {
  let line = line.strip_suffix(b"\n").ok_or(ParseError::MalformedLine)?;
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  std::str::from_utf8(line).map_err(|_| ParseError::MalformedLine)
}

fn split_host_port(authority: &str) -> Result<(String, Option<u16>), ParseError> {
  let authority = Authority::from_str(authority).map_err(|_| ParseError::NoHostProvided)?;
  if authority.host().is_empty() {
    return Err(ParseError::NoHostProvided);
  }
  Ok((authority.host().to_string(), authority.port_u16()))
}

impl RequestLine {
  /// Parse a complete line (terminated by `\n`) into a fresh value.
  pub fn from_bytes(line: &[u8]) -> Result<Self, ParseError> {
    let mut request_line = RequestLine::default();
    request_line.parse(line)?;
    Ok(request_line)
  }
  /// Clear every field so the value can be reused for the next request.
  pub fn reset(&mut self) {
    self.method = Method::GET;
    self.target.clear();
    self.form = TargetForm::Origin;
    self.https = false;
    self.host.clear();
    self.port = 0;
    self.path.clear();
    self.version.clear();
  }
  /// Parse a complete line in place. The method is upper-cased.
  pub fn parse(&mut self, line: &[u8]) -> Result<(), ParseError> {
    self.reset();
    let line = trim_line(line)?;
    if line.len() < 2 {
      return Err(ParseError::MalformedLine);
    }
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or_default();
    if method.is_empty() {
      return Err(ParseError::MissingMethod);
    }
    let target = parts
      .next()
      .filter(|t| !t.is_empty())
      .ok_or(ParseError::MissingTarget)?;
    let version = parts
      .next()
      .map(str::trim)
      .filter(|v| !v.is_empty())
      .ok_or(ParseError::MissingProtocol)?;
    if !version.starts_with("HTTP/") {
      return Err(ParseError::MissingProtocol);
    }
    self.method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
      .map_err(|_| ParseError::MissingMethod)?;
    self.target.push_str(target);
    self.version.push_str(version);

    if self.method == Method::CONNECT {
      self.form = TargetForm::Authority;
      let (host, port) = split_host_port(target)?;
      self.host = host;
      self.port = port.unwrap_or(443);
      self.https = true;
    } else if target.starts_with('/') || target == "*" {
      self.form = TargetForm::Origin;
      self.path.push_str(target);
    } else if let Some((scheme, rest)) = target.split_once("://") {
      self.form = TargetForm::Absolute;
      self.https = scheme.eq_ignore_ascii_case("https");
      let (authority, path) = match rest.find('/') {
        Some(p) => rest.split_at(p),
        None => match rest.find('?') {
          Some(p) => rest.split_at(p),
          None => (rest, ""),
        },
      };
      let (host, port) = split_host_port(authority)?;
      self.host = host;
      self.port = port.unwrap_or(if self.https { 443 } else { 80 });
      if !path.starts_with('/') {
        self.path.push('/');
      }
      self.path.push_str(path);
    } else {
      // bare authority on a non-CONNECT request
      self.form = TargetForm::Authority;
      let (host, port) = split_host_port(target)?;
      self.host = host;
      self.port = port.unwrap_or(80);
      self.path.push('/');
    }
    Ok(())
  }
  /// Fill in host and port from the hint when the target did not carry them.
  ///
  /// `host_hint` is the `Host` header, or the CONNECT authority for requests
  /// arriving inside an intercepted tunnel. `tls` selects the default port.
  pub fn resolve(&mut self, host_hint: Option<&str>, tls: bool) -> Result<(), ParseError> {
    if tls {
      self.https = true;
    }
    if self.host.is_empty() {
      let hint = host_hint
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::NoHostProvided)?;
      let (host, port) = split_host_port(hint)?;
      self.host = host;
      self.port = port.unwrap_or(if self.https { 443 } else { 80 });
    }
    Ok(())
  }
  /// Read one request line from the source and consume it.
  pub async fn read<S: AsyncRead + Unpin>(
    &mut self,
    src: &mut BufferedStream<S>,
    max_len: usize,
  ) -> Result<()> {
    let len = peek_line(src, max_len).await?;
    let parsed = self.parse(&src.buffer()[..len]);
    src.discard(len);
    parsed?;
    Ok(())
  }
  /// Upper-cased method
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Raw request target as received
  pub fn target(&self) -> &str {
    &self.target
  }
  /// Target form
  pub fn form(&self) -> TargetForm {
    self.form
  }
  /// Host without port
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Port, defaulted from the scheme
  pub fn port(&self) -> u16 {
    self.port
  }
  /// `host:port`
  pub fn host_port(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
  /// Path and query, empty for CONNECT
  pub fn path(&self) -> &str {
    &self.path
  }
  /// Replace the path, used when a hijacker rewrites the request.
  pub fn set_path(&mut self, path: impl Into<String>) {
    self.path = path.into();
  }
  /// Protocol version, e.g. `HTTP/1.1`
  pub fn version(&self) -> &str {
    &self.version
  }
  /// Whether the origin speaks TLS
  pub fn is_https(&self) -> bool {
    self.https
  }
  /// CONNECT request
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }
  /// HEAD request
  pub fn is_head(&self) -> bool {
    self.method == Method::HEAD
  }
  /// Methods that may be replayed on a fresh connection.
  pub fn is_idempotent(&self) -> bool {
    matches!(
      self.method,
      Method::GET | Method::HEAD | Method::PUT | Method::DELETE
    )
  }
  /// The line sent upstream, always in origin form.
  pub fn to_origin_line(&self) -> Vec<u8> {
    let path = if self.path.is_empty() { "/" } else { &self.path };
    format!("{} {} {}\r\n", self.method, path, self.version).into_bytes()
  }
}

/// First line of a response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusLine {
  version: String,
  code: u16,
  reason: String,
}

impl StatusLine {
  /// Parse a complete status line.
  pub fn parse(line: &[u8]) -> Result<Self, ParseError> {
    let line = trim_line(line)?;
    if line.is_empty() {
      return Err(ParseError::MalformedLine);
    }
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
      return Err(ParseError::MissingProtocol);
    }
    let code = parts
      .next()
      .filter(|c| !c.is_empty())
      .ok_or(ParseError::MissingStatusCode)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
      return Err(ParseError::InvalidStatusCode);
    }
    let code = code
      .parse::<u16>()
      .map_err(|_| ParseError::InvalidStatusCode)?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok(StatusLine {
      version: version.to_string(),
      code,
      reason,
    })
  }
  /// Read one status line from the source and consume it.
  pub async fn read<S: AsyncRead + Unpin>(
    src: &mut BufferedStream<S>,
    max_len: usize,
  ) -> Result<Self> {
    let len = peek_line(src, max_len).await?;
    let parsed = StatusLine::parse(&src.buffer()[..len]);
    src.discard(len);
    Ok(parsed?)
  }
  /// Protocol version
  pub fn version(&self) -> &str {
    &self.version
  }
  /// Three digit code
  pub fn code(&self) -> u16 {
    self.code
  }
  /// Reason phrase, may be empty
  pub fn reason(&self) -> &str {
    &self.reason
  }
  /// `1xx`
  pub fn is_informational(&self) -> bool {
    (100..200).contains(&self.code)
  }
  /// Serialized form including CRLF
  pub fn to_bytes(&self) -> Vec<u8> {
    if self.reason.is_empty() {
      format!("{} {}\r\n", self.version, self.code).into_bytes()
    } else {
      format!("{} {} {}\r\n", self.version, self.code, self.reason).into_bytes()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn origin_form_needs_host_hint() {
    let mut line = RequestLine::from_bytes(b"get /index.html?a=1 HTTP/1.1\r\n").unwrap();
    assert_eq!(line.method(), Method::GET);
    assert_eq!(line.form(), TargetForm::Origin);
    assert_eq!(line.resolve(None, false), Err(ParseError::NoHostProvided));
    line.resolve(Some("example.com"), false).unwrap();
    assert_eq!(line.host_port(), "example.com:80");
    assert_eq!(line.path(), "/index.html?a=1");
  }

  #[test]
  fn absolute_form() {
    let line = RequestLine::from_bytes(b"GET https://example.com:8443/a HTTP/1.1\n").unwrap();
    assert_eq!(line.form(), TargetForm::Absolute);
    assert!(line.is_https());
    assert_eq!(line.host_port(), "example.com:8443");
    assert_eq!(line.to_origin_line(), b"GET /a HTTP/1.1\r\n");
    let line = RequestLine::from_bytes(b"GET http://example.com HTTP/1.0\r\n").unwrap();
    assert_eq!(line.host_port(), "example.com:80");
    assert_eq!(line.path(), "/");
  }

  #[test]
  fn connect_defaults_to_443() {
    let line = RequestLine::from_bytes(b"CONNECT example.com HTTP/1.1\r\n").unwrap();
    assert!(line.is_connect());
    assert_eq!(line.form(), TargetForm::Authority);
    assert_eq!(line.host_port(), "example.com:443");
  }

  #[test]
  fn request_line_errors() {
    assert_eq!(
      RequestLine::from_bytes(b"\r\n"),
      Err(ParseError::MalformedLine)
    );
    assert_eq!(
      RequestLine::from_bytes(b" / HTTP/1.1\r\n"),
      Err(ParseError::MissingMethod)
    );
    assert_eq!(
      RequestLine::from_bytes(b"GET\r\n"),
      Err(ParseError::MissingTarget)
    );
    assert_eq!(
      RequestLine::from_bytes(b"GET /\r\n"),
      Err(ParseError::MissingProtocol)
    );
    assert_eq!(
      RequestLine::from_bytes(b"GET / HTTP/1.1"),
      Err(ParseError::MalformedLine)
    );
  }

  #[test]
  fn status_line() {
    let s = StatusLine::parse(b"HTTP/1.1 200 OK\r\n").unwrap();
    assert_eq!(s.code(), 200);
    assert_eq!(s.reason(), "OK");
    let s = StatusLine::parse(b"HTTP/1.1 204\r\n").unwrap();
    assert_eq!(s.reason(), "");
    assert_eq!(s.to_bytes(), b"HTTP/1.1 204\r\n");
    assert_eq!(
      StatusLine::parse(b"HTTP/1.1\r\n"),
      Err(ParseError::MissingStatusCode)
    );
    assert_eq!(
      StatusLine::parse(b"HTTP/1.1 20x OK\r\n"),
      Err(ParseError::InvalidStatusCode)
    );
    assert_eq!(
      StatusLine::parse(b"ICY 200 OK\r\n"),
      Err(ParseError::MissingProtocol)
    );
  }

  #[tokio::test]
  async fn read_reports_closed_and_truncated() {
    let mut src = BufferedStream::new(&b""[..]);
    let mut line = RequestLine::default();
    assert!(matches!(
      line.read(&mut src, 1024).await,
      Err(Error::ConnectionClosed)
    ));
    let mut src = BufferedStream::new(&b"GET / HT"[..]);
    assert!(matches!(
      line.read(&mut src, 1024).await,
      Err(Error::UnexpectedEof)
    ));
  }
}
