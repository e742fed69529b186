//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `ballista::Error`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
/// The Errors that may occur while forwarding traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  #[error(transparent)]
  /// tls Error
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Malformed HTTP message
  #[error(transparent)]
  Parse(#[from] ParseError),
  /// Proxy ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Certificate signing failed
  #[error(transparent)]
  Certificate(#[from] CertError),
  /// An HTTP super-proxy answered the CONNECT with a non-200 status
  #[error("proxy rejected tunnel with status {0}")]
  TunnelRejected(u16),
  /// The destination pool is at its connection limit
  #[error("no free connections available to host")]
  NoFreeConnections,
  /// Every attempt saw the upstream close before the first response byte
  #[error("the server closed connection before returning the first response byte")]
  ConnectionClosedBeforeResponse,
  /// The peer closed the stream in the middle of a message
  #[error("unexpected end of stream")]
  UnexpectedEof,
  /// The peer closed the stream cleanly between messages
  #[error("connection closed")]
  ConnectionClosed,
  /// An operation did not finish within its deadline
  #[error("timeout")]
  Timeout,
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// The status code the forwarder answers with when this error aborts a request
  /// before any response byte has been written.
  pub fn status_code(&self) -> u16 {
    match self {
      Error::Parse(_) | Error::Http(_) => 400,
      Error::NoFreeConnections => 503,
      Error::Timeout => 504,
      Error::IO(e) if e.kind() == ErrorKind::TimedOut => 504,
      _ => 502,
    }
  }
  /// Whether the error only means the peer went away.
  pub fn is_closed(&self) -> bool {
    match self {
      Error::ConnectionClosed | Error::UnexpectedEof => true,
      Error::IO(e) => matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
          | ErrorKind::ConnectionReset
          | ErrorKind::BrokenPipe
          | ErrorKind::ConnectionAborted
      ),
      _ => false,
    }
  }
}

/// Protocol level failures of the message parsers.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  /// line is empty or not terminated
  #[error("malformed message line")]
  MalformedLine,
  /// request line without a method
  #[error("missing method in request line")]
  MissingMethod,
  /// request line without a target
  #[error("missing target in request line")]
  MissingTarget,
  /// message line without a protocol version
  #[error("missing protocol version")]
  MissingProtocol,
  /// status line without a code
  #[error("missing status code")]
  MissingStatusCode,
  /// status code is not three digits
  #[error("invalid status code")]
  InvalidStatusCode,
  /// neither the request target nor the Host header names a host
  #[error("no host provided")]
  NoHostProvided,
  /// the header block is not complete yet
  #[error("need more data")]
  NeedMoreData,
  /// a header line is not `name: value`
  #[error("malformed header line")]
  MalformedHeader,
  /// the header block outgrew the configured limit
  #[error("header too large")]
  HeaderTooLarge,
  /// a chunk size line is not valid hex
  #[error("invalid chunk size")]
  InvalidChunkSize,
  /// a chunk payload is not followed by CRLF
  #[error("malformed chunk framing")]
  MalformedChunk,
}

/// Failures of the MITM certificate authority.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum CertError {
  /// the domain is empty or cannot be put into a SAN
  #[error("invalid domain: {0:?}")]
  InvalidDomain(String),
  /// the configured root is not a usable certificate authority
  #[error("invalid certificate authority: {0}")]
  InvalidCertificateAuthority(String),
  /// key or certificate generation failed
  #[error("certificate generation failed: {0}")]
  Generate(String),
}

/// SOCKS5 reply codes other than success.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  #[error("general failure")]
  /// 0x01
  GeneralFailure,
  #[error("connection not allowed by ruleset")]
  /// 0x02
  ConnectionNotAllowed,
  #[error("network unreachable")]
  /// 0x03
  NetworkUnreachable,
  #[error("host unreachable")]
  /// 0x04
  HostUnreachable,
  #[error("connection refused")]
  /// 0x05
  ConnectionRefused,
  #[error("ttl expired")]
  /// 0x06
  TtlExpired,
  #[error("command not supported")]
  /// 0x07
  CommandNotSupported,
  #[error("address type not supported")]
  /// 0x08
  AddressTypeNotSupported,
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(_: tokio::time::error::Elapsed) -> Self {
    Error::Timeout
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_mapping() {
    assert_eq!(Error::Parse(ParseError::NoHostProvided).status_code(), 400);
    assert_eq!(Error::NoFreeConnections.status_code(), 503);
    assert_eq!(Error::Timeout.status_code(), 504);
    assert_eq!(Error::TunnelRejected(407).status_code(), 502);
    assert_eq!(Error::ConnectionClosedBeforeResponse.status_code(), 502);
    assert_eq!(
      new_io_error(ErrorKind::TimedOut, "connect").status_code(),
      504
    );
  }

  #[test]
  fn reply_messages_are_lowercase() {
    let e = Error::from(ReplyError::ConnectionRefused);
    assert!(e.to_string().contains("connection refused"));
  }
}
