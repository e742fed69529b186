//! Keep-alive connections per upstream destination.
//!
//! A [`DestinationPool`] bounds the connections open to one destination and
//! keeps released ones for reuse. The first successful dial starts an evictor
//! task that wakes every `max_idle_conn_duration`, closes connections idle for
//! at least that long and exits once the pool holds no connection at all.
use crate::errors::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

/// Limits of every [`DestinationPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
  /// Connections open at once to one destination, idle or in use.
  pub max_conns: usize,
  /// Idle connections older than this are closed. Also the evictor period.
  pub max_idle_conn_duration: Duration,
  /// Connections older than this are never reused.
  pub max_conn_duration: Option<Duration>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    PoolConfig {
      max_conns: 512,
      max_idle_conn_duration: Duration::from_secs(10),
      max_conn_duration: None,
    }
  }
}

/// Identity of a destination: same origin through the same proxies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
  /// `host:port` of the origin
  pub addr: String,
  /// Address a hijacker forced the origin to, bypassing DNS
  pub resolved: Option<IpAddr>,
  /// Display form of the proxy chain, if any
  pub proxy: Option<String>,
  /// TLS to the origin
  pub tls: bool,
}

/// A connection owned by a pool while checked out.
#[derive(Debug)]
pub struct PooledConnection<C> {
  stream: C,
  created_at: Instant,
  last_used: Instant,
}

impl<C> PooledConnection<C> {
  fn new(stream: C) -> Self {
    let now = Instant::now();
    PooledConnection {
      stream,
      created_at: now,
      last_used: now,
    }
  }
  /// The stream
  pub fn stream(&self) -> &C {
    &self.stream
  }
  /// The stream
  pub fn stream_mut(&mut self) -> &mut C {
    &mut self.stream
  }
  /// Time since the connection was dialed
  pub fn age(&self) -> Duration {
    self.created_at.elapsed()
  }
  fn expired(&self, max_conn_duration: Option<Duration>) -> bool {
    max_conn_duration.is_some_and(|max| self.age() >= max)
  }
  fn stale(&self, now: Instant, config: &PoolConfig) -> bool {
    now.duration_since(self.last_used) >= config.max_idle_conn_duration
      || self.expired(config.max_conn_duration)
  }
}

#[derive(Debug)]
struct PoolState<C> {
  idle: Vec<PooledConnection<C>>,
  conns_count: usize,
  evictor_running: bool,
  retired: bool,
}

type PoolMap<C> = Mutex<HashMap<PoolKey, Arc<DestinationPool<C>>>>;

enum Checkout<C> {
  Idle(PooledConnection<C>),
  Dial,
  Retired,
}

/// Connections to one destination.
#[derive(Debug)]
pub struct DestinationPool<C> {
  key: PoolKey,
  config: PoolConfig,
  state: Mutex<PoolState<C>>,
  registry: Option<Weak<PoolMap<C>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<C> DestinationPool<C>
where
  C: AsyncRead + Unpin + Send + 'static,
{
  /// A standalone pool, not tracked by any registry
  pub fn new(key: PoolKey, config: PoolConfig) -> Arc<Self> {
    Arc::new(Self::with_registry(key, config, None))
  }

  fn with_registry(key: PoolKey, config: PoolConfig, registry: Option<Weak<PoolMap<C>>>) -> Self {
    DestinationPool {
      key,
      config,
      state: Mutex::new(PoolState {
        idle: Vec::new(),
        conns_count: 0,
        evictor_running: false,
        retired: false,
      }),
      registry,
    }
  }

  /// The destination this pool serves
  pub fn key(&self) -> &PoolKey {
    &self.key
  }
  /// Open connections, idle or in use
  pub fn conns_count(&self) -> usize {
    lock(&self.state).conns_count
  }
  /// Connections waiting for reuse
  pub fn idle_count(&self) -> usize {
    lock(&self.state).idle.len()
  }
  /// Whether an evictor task is alive for this pool
  pub fn evictor_running(&self) -> bool {
    lock(&self.state).evictor_running
  }

  /// Take an idle connection or dial a new one.
  ///
  /// Fails with [`Error::NoFreeConnections`] when `max_conns` connections are
  /// already open and none of them is idle.
  pub async fn acquire<F, Fut>(self: &Arc<Self>, mut dial: F) -> Result<PooledConnection<C>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C>>,
  {
    match self.try_acquire(&mut dial).await? {
      Some(conn) => Ok(conn),
      None => Err(Error::ConnectionClosed),
    }
  }

  /// `None` when the pool was retired by its registry.
  async fn try_acquire<F, Fut>(self: &Arc<Self>, dial: &mut F) -> Result<Option<PooledConnection<C>>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C>>,
  {
    match self.checkout()? {
      Checkout::Idle(conn) => return Ok(Some(conn)),
      Checkout::Retired => return Ok(None),
      Checkout::Dial => {}
    }
    match dial().await {
      Ok(stream) => {
        self.start_evictor();
        Ok(Some(PooledConnection::new(stream)))
      }
      Err(e) => {
        self.forget_one();
        Err(e)
      }
    }
  }

  fn checkout(&self) -> Result<Checkout<C>> {
    let mut state = lock(&self.state);
    if state.retired {
      return Ok(Checkout::Retired);
    }
    let now = Instant::now();
    while let Some(conn) = state.idle.pop() {
      if conn.stale(now, &self.config) {
        state.conns_count = state.conns_count.saturating_sub(1);
        continue;
      }
      return Ok(Checkout::Idle(conn));
    }
    if state.conns_count < self.config.max_conns {
      state.conns_count += 1;
      return Ok(Checkout::Dial);
    }
    Err(Error::NoFreeConnections)
  }

  fn forget_one(&self) {
    let mut state = lock(&self.state);
    state.conns_count = state.conns_count.saturating_sub(1);
  }

  /// Hand a connection back after a complete exchange.
  ///
  /// The connection is kept only if the peer has neither closed it nor sent
  /// anything unsolicited, and it is younger than `max_conn_duration`.
  pub async fn release(self: &Arc<Self>, mut conn: PooledConnection<C>) {
    if conn.expired(self.config.max_conn_duration) || !is_alive(&mut conn.stream).await {
      self.close(conn);
      return;
    }
    conn.last_used = Instant::now();
    let mut state = lock(&self.state);
    if state.retired {
      state.conns_count = state.conns_count.saturating_sub(1);
      return;
    }
    state.idle.push(conn);
  }

  /// Drop a connection that must not be reused.
  pub fn close(&self, conn: PooledConnection<C>) {
    drop(conn);
    self.forget_one();
  }

  /// Keep the stream but stop counting it, e.g. once it carries a tunnel.
  pub fn detach(&self, conn: PooledConnection<C>) -> C {
    self.forget_one();
    conn.stream
  }

  fn start_evictor(self: &Arc<Self>) {
    {
      let mut state = lock(&self.state);
      if state.evictor_running {
        return;
      }
      state.evictor_running = true;
    }
    let pool = Arc::downgrade(self);
    let period = self.config.max_idle_conn_duration;
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(period).await;
        let Some(pool) = pool.upgrade() else {
          return;
        };
        if pool.evict() {
          tracing::debug!("evictor for {} stopped", pool.key.addr);
          return;
        }
      }
    });
  }

  /// Close stale idle connections. Returns `true` once the evictor should stop.
  fn evict(&self) -> bool {
    let now = Instant::now();
    {
      let mut state = lock(&self.state);
      let before = state.idle.len();
      state.idle.retain(|c| !c.stale(now, &self.config));
      let evicted = before - state.idle.len();
      state.conns_count = state.conns_count.saturating_sub(evicted);
      if evicted > 0 {
        tracing::debug!("evicted {} idle connections to {}", evicted, self.key.addr);
      }
      if state.conns_count > 0 {
        return false;
      }
    }
    // registry before pool, same order as `DestinationPoolRegistry::pool`
    let registry = self.registry.as_ref().and_then(Weak::upgrade);
    let mut pools = registry.as_ref().map(|r| lock(&**r));
    let mut state = lock(&self.state);
    if state.conns_count > 0 {
      return false;
    }
    state.evictor_running = false;
    if let Some(pools) = pools.as_mut() {
      let same = pools
        .get(&self.key)
        .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), self));
      if same {
        state.retired = true;
        pools.remove(&self.key);
      }
    }
    true
  }
}

/// The peer is still there and has nothing to say.
///
/// A single zero-time read: pending means alive, EOF or data means the
/// connection is unusable.
async fn is_alive<C: AsyncRead + Unpin>(stream: &mut C) -> bool {
  let mut byte = [0u8; 1];
  tokio::time::timeout(Duration::ZERO, stream.read(&mut byte))
    .await
    .is_err()
}

/// All pools of a proxy, keyed by destination.
#[derive(Debug)]
pub struct DestinationPoolRegistry<C> {
  config: PoolConfig,
  pools: Arc<PoolMap<C>>,
}

impl<C> DestinationPoolRegistry<C>
where
  C: AsyncRead + Unpin + Send + 'static,
{
  /// Empty registry
  pub fn new(config: PoolConfig) -> Self {
    DestinationPoolRegistry {
      config,
      pools: Arc::new(Mutex::new(HashMap::new())),
    }
  }
  /// The pool for a destination, created on first use.
  pub fn pool(&self, key: &PoolKey) -> Arc<DestinationPool<C>> {
    let mut pools = lock(&*self.pools);
    if let Some(pool) = pools.get(key) {
      return pool.clone();
    }
    let pool = Arc::new(DestinationPool::with_registry(
      key.clone(),
      self.config,
      Some(Arc::downgrade(&self.pools)),
    ));
    pools.insert(key.clone(), pool.clone());
    pool
  }
  /// Acquire from the destination's pool, returning the pool to release to.
  pub async fn acquire<F, Fut>(
    &self,
    key: &PoolKey,
    mut dial: F,
  ) -> Result<(Arc<DestinationPool<C>>, PooledConnection<C>)>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C>>,
  {
    loop {
      let pool = self.pool(key);
      if let Some(conn) = pool.try_acquire(&mut dial).await? {
        return Ok((pool, conn));
      }
    }
  }
  /// Destinations with a live pool
  pub fn len(&self) -> usize {
    lock(&*self.pools).len()
  }
  /// No live pool
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
  /// Close every idle connection and forget all pools.
  ///
  /// Connections checked out at this point are closed on release.
  pub fn clear(&self) {
    let mut pools = lock(&*self.pools);
    for pool in pools.values() {
      let mut state = lock(&pool.state);
      let idle = state.idle.len();
      state.idle.clear();
      state.conns_count = state.conns_count.saturating_sub(idle);
      state.retired = true;
    }
    pools.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::io::DuplexStream;

  fn key() -> PoolKey {
    PoolKey {
      addr: "example.com:80".to_string(),
      resolved: None,
      proxy: None,
      tls: false,
    }
  }

  fn dial_once(stream: DuplexStream) -> impl FnMut() -> std::future::Ready<Result<DuplexStream>> {
    let mut stream = Some(stream);
    move || std::future::ready(stream.take().ok_or(Error::ConnectionClosed))
  }

  fn config(max_conns: usize) -> PoolConfig {
    PoolConfig {
      max_conns,
      ..PoolConfig::default()
    }
  }

  #[tokio::test]
  async fn bounded_and_reused() {
    let pool = DestinationPool::<DuplexStream>::new(key(), config(2));
    let dials = AtomicUsize::new(0);
    let mut peers = Vec::new();
    let mut dial = || {
      dials.fetch_add(1, Ordering::SeqCst);
      let (a, b) = tokio::io::duplex(64);
      peers.push(b);
      async move { Ok(a) }
    };
    let first = pool.acquire(&mut dial).await.unwrap();
    let _second = pool.acquire(&mut dial).await.unwrap();
    let third = pool.acquire(&mut dial).await;
    assert!(matches!(third, Err(Error::NoFreeConnections)));
    assert_eq!(pool.conns_count(), 2);

    pool.release(first).await;
    assert_eq!(pool.idle_count(), 1);
    let _reused = pool.acquire(&mut dial).await.unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 2);
    assert_eq!(pool.idle_count(), 0);
  }

  #[tokio::test]
  async fn release_drops_closed_or_chatty_connections() {
    let pool = DestinationPool::<DuplexStream>::new(key(), config(4));
    let (a, b) = tokio::io::duplex(64);
    let conn = pool.acquire(dial_once(a)).await.unwrap();
    drop(b);
    pool.release(conn).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.conns_count(), 0);

    let (a, mut b) = tokio::io::duplex(64);
    let conn = pool.acquire(dial_once(a)).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut b, b"HTTP/1.1 200 OK\r\n")
      .await
      .unwrap();
    pool.release(conn).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.conns_count(), 0);
  }

  #[tokio::test]
  async fn failed_dial_frees_its_slot() {
    let pool = DestinationPool::<DuplexStream>::new(key(), config(1));
    let err = pool
      .acquire(|| async { Err(Error::ConnectionClosed) })
      .await;
    assert!(err.is_err());
    assert_eq!(pool.conns_count(), 0);
    assert!(!pool.evictor_running());
  }

  #[tokio::test(start_paused = true)]
  async fn evictor_closes_idle_and_stops() {
    let pool = DestinationPool::<DuplexStream>::new(key(), config(4));
    let (a, _b) = tokio::io::duplex(64);
    let conn = pool.acquire(dial_once(a)).await.unwrap();
    assert!(pool.evictor_running());
    pool.release(conn).await;
    assert_eq!(pool.idle_count(), 1);

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.conns_count(), 0);
    assert!(!pool.evictor_running());
  }

  #[tokio::test(start_paused = true)]
  async fn idle_limit_holds_between_evictor_ticks() {
    let pool = DestinationPool::<DuplexStream>::new(key(), config(4));
    let (a, _b) = tokio::io::duplex(64);
    let conn = pool.acquire(dial_once(a)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    pool.release(conn).await;
    // the tick at 10s sees 9s of idleness, the next one is at 20s
    tokio::time::sleep(Duration::from_secs(14)).await;
    assert_eq!(pool.idle_count(), 1);

    let err = pool
      .acquire(|| async { Err(Error::ConnectionClosed) })
      .await;
    assert!(matches!(err, Err(Error::ConnectionClosed)));
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.conns_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn evictor_prunes_registry() {
    let registry = DestinationPoolRegistry::<DuplexStream>::new(config(4));
    let (a, _b) = tokio::io::duplex(64);
    let (pool, conn) = registry.acquire(&key(), dial_once(a)).await.unwrap();
    pool.release(conn).await;
    assert_eq!(registry.len(), 1);

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn clear_retires_pools() {
    let registry = DestinationPoolRegistry::<DuplexStream>::new(config(4));
    let (a, _b) = tokio::io::duplex(64);
    let (pool, conn) = registry.acquire(&key(), dial_once(a)).await.unwrap();
    registry.clear();
    assert!(registry.is_empty());
    pool.release(conn).await;
    assert_eq!(pool.conns_count(), 0);
  }
}
