//! Intercepting proxy that logs every exchange
//!
//! Requests to hosts ending in `.blocked.test` are refused. The root
//! certificate is kept under `.ballista/` and printed at startup; import it
//! into the client before browsing through `127.0.0.1:8080`.
//!
//! To run:
//! ```bash
//! RUST_LOG=ballista=debug cargo run --example simple_proxy
//! ```

use async_trait::async_trait;
use ballista::{Header, Hijacker, HijackerPool, Method, Observer, ProxyConfig, ProxyServer, StatusLine};
use std::net::SocketAddr;
use std::sync::Arc;

/// Counts body bytes as they pass.
struct ByteCounter {
  label: String,
  seen: usize,
}

#[async_trait]
impl Observer for ByteCounter {
  async fn on_body(&mut self, data: &[u8]) -> std::io::Result<()> {
    self.seen += data.len();
    Ok(())
  }
  async fn on_end(&mut self) -> std::io::Result<()> {
    println!("{}: {} body bytes", self.label, self.seen);
    Ok(())
  }
}

struct Logger {
  client: SocketAddr,
  host: String,
  target: String,
}

#[async_trait]
impl Hijacker for Logger {
  async fn before_request(
    &mut self,
    method: &Method,
    path: &str,
    _header: &Header,
    _raw_header: &[u8],
  ) -> (Option<String>, Option<Vec<u8>>) {
    println!("{} -> {} {}{}", self.client, method, self.target, path);
    (None, None)
  }

  async fn block(&mut self) -> bool {
    self.host.ends_with(".blocked.test")
  }

  async fn on_response(
    &mut self,
    status: &StatusLine,
    _header: &Header,
    _raw_header: &[u8],
  ) -> Option<Box<dyn Observer>> {
    Some(Box::new(ByteCounter {
      label: format!("{} <- {} {}", self.client, status.code(), self.target),
      seen: 0,
    }))
  }
}

struct Loggers;

#[async_trait]
impl HijackerPool for Loggers {
  async fn get(&self, client_addr: SocketAddr, is_tls: bool, host: &str, port: u16) -> Box<dyn Hijacker> {
    let scheme = if is_tls { "https" } else { "http" };
    Box::new(Logger {
      client: client_addr,
      host: host.to_string(),
      target: format!("{}://{}:{}", scheme, host, port),
    })
  }
}

#[tokio::main]
async fn main() -> ballista::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let config = ProxyConfig {
    ca_storage_path: Some(".ballista".into()),
    ..Default::default()
  };
  let server = ProxyServer::builder()
    .config(config)
    .hijackers(Arc::new(Loggers))
    .build()
    .await?;
  println!("{}", server.ca_cert_pem());
  server.run("127.0.0.1:8080").await
}
