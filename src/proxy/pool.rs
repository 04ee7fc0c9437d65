//! Upstream connection pool.
//!
//! Connections move by value: the pool owns them while idle, a session owns
//! them while in use, and dropping one closes its socket. A connection can
//! therefore never be handed to two sessions, and every exit path of a
//! session (including cancellation) either releases or closes it.

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::PoolConfig;
use crate::http::stream::HttpStream;
use crate::proxy::outcome::ProxyError;
use crate::proxy::target::Target;
use crate::proxy::tls::{UpstreamStream, UpstreamTls};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Parked in the pool
    Idle,
    /// Owned by a session
    InUse,
    /// Failed or framing lost; will be closed instead of re-pooled
    Closing,
}

/// A connection to the upstream, over TLS for `https` targets.
#[derive(Debug)]
pub struct UpstreamConnection {
    id: u64,
    target: Target,
    stream: HttpStream<UpstreamStream>,
    state: ConnState,
    reused: bool,
    idle_since: Instant,
    request_complete: bool,
    response_complete: bool,
    keep_alive: bool,
    open: Arc<AtomicUsize>,
}

impl UpstreamConnection {
    fn new(id: u64, target: Target, stream: UpstreamStream, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            target,
            stream: HttpStream::new(stream),
            state: ConnState::InUse,
            reused: false,
            idle_since: Instant::now(),
            request_complete: false,
            response_complete: false,
            keep_alive: true,
            open,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Whether this connection served an earlier exchange.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn stream(&mut self) -> &mut HttpStream<UpstreamStream> {
        &mut self.stream
    }

    /// Whether any bytes from the upstream are buffered but unconsumed.
    pub fn has_unread_bytes(&self) -> bool {
        !self.stream.buffered().is_empty()
    }

    /// Resets exchange tracking before a new request is written.
    pub fn begin_exchange(&mut self) {
        self.request_complete = false;
        self.response_complete = false;
        self.keep_alive = true;
    }

    pub fn mark_request_complete(&mut self) {
        self.request_complete = true;
    }

    /// Records that the response body was read to its end; `keep_alive` is
    /// whether the upstream agreed to further requests.
    pub fn mark_response_complete(&mut self, keep_alive: bool) {
        self.response_complete = true;
        self.keep_alive = keep_alive;
    }

    pub fn mark_broken(&mut self) {
        self.state = ConnState::Closing;
    }

    /// The connection sits at a message boundary with no error and both
    /// sides willing to continue.
    pub fn is_reusable(&self) -> bool {
        self.state != ConnState::Closing
            && self.request_complete
            && self.response_complete
            && self.keep_alive
            && !self.has_unread_bytes()
    }

    fn is_expired(&self, now: Instant, idle_timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.idle_since) >= idle_timeout
    }

    /// Non-blocking check that the upstream has neither closed the socket nor
    /// sent anything unsolicited while the connection was parked.
    ///
    /// Reads the raw socket, below any TLS layer: a byte consumed there
    /// breaks the TLS stream, but such a connection is discarded anyway.
    fn still_open(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.get_ref().tcp().try_read(&mut byte) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Ok(_) | Err(_) => false,
        }
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(conn = self.id, target = %self.target, "upstream connection closed");
    }
}

/// An in-use connection together with its slot in the per-target limit.
#[derive(Debug)]
pub struct PooledConnection {
    conn: UpstreamConnection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = UpstreamConnection;

    fn deref(&self) -> &UpstreamConnection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut UpstreamConnection {
        &mut self.conn
    }
}

#[derive(Debug)]
struct TargetSlot {
    idle: Vec<UpstreamConnection>,
    permits: Arc<Semaphore>,
}

/// Bounded per-target pool of upstream connections.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    tls: Option<UpstreamTls>,
    slots: Mutex<HashMap<Target, TargetSlot>>,
    next_id: AtomicU64,
    open: Arc<AtomicUsize>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            tls: None,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connector used for `https` targets.
    pub fn with_tls(mut self, tls: UpstreamTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Target, TargetSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn permits(&self, target: &Target) -> Arc<Semaphore> {
        let max = self.config.max_size_per_target;
        self.slots()
            .entry(target.clone())
            .or_insert_with(|| TargetSlot {
                idle: Vec::new(),
                permits: Arc::new(Semaphore::new(max)),
            })
            .permits
            .clone()
    }

    fn pop_idle(&self, target: &Target) -> Option<UpstreamConnection> {
        self.slots().get_mut(target).and_then(|slot| slot.idle.pop())
    }

    /// Hands out a connection to `target`, reusing the most recently parked
    /// live one or opening a new one.
    ///
    /// Waits while `max_size_per_target` connections are in use.
    pub async fn acquire(&self, target: &Target) -> Result<PooledConnection, ProxyError> {
        let permit = self.wait_for_slot(target).await?;

        let now = Instant::now();
        while let Some(mut conn) = self.pop_idle(target) {
            if conn.is_expired(now, self.config.idle_timeout()) || !conn.still_open() {
                tracing::debug!(conn = conn.id, target = %target, "discarding stale idle connection");
                continue;
            }
            conn.state = ConnState::InUse;
            conn.reused = true;
            tracing::trace!(conn = conn.id, target = %target, "reusing pooled connection");
            return Ok(PooledConnection {
                conn,
                _permit: permit,
            });
        }

        let conn = self.connect(target).await?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Opens a brand-new connection, bypassing the idle set.
    pub async fn connect_fresh(&self, target: &Target) -> Result<PooledConnection, ProxyError> {
        let permit = self.wait_for_slot(target).await?;
        let conn = self.connect(target).await?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    async fn wait_for_slot(&self, target: &Target) -> Result<OwnedSemaphorePermit, ProxyError> {
        self.permits(target)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::PoolClosed)
    }

    async fn connect(&self, target: &Target) -> Result<UpstreamConnection, ProxyError> {
        let addr = target.addr();
        let connect_timeout = self.config.connect_timeout();

        // The TLS handshake counts against the connect timeout.
        let stream = timeout(connect_timeout, self.open_stream(target, &addr))
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                addr: addr.clone(),
                timeout: connect_timeout,
            })??;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, target = %target, tls = stream.is_tls(), "opened upstream connection");
        Ok(UpstreamConnection::new(
            id,
            target.clone(),
            stream,
            self.open.clone(),
        ))
    }

    async fn open_stream(&self, target: &Target, addr: &str) -> Result<UpstreamStream, ProxyError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY on upstream socket");
        }

        if !target.is_tls() {
            return Ok(UpstreamStream::Plain(tcp));
        }

        let handshake = match &self.tls {
            Some(tls) => tls.connect(tcp, target.host()).await,
            None => Err(io::Error::other("no TLS connector configured")),
        };
        let stream = handshake.map_err(|source| ProxyError::TlsHandshake {
            addr: addr.to_string(),
            source,
        })?;
        Ok(UpstreamStream::Tls(Box::new(stream)))
    }

    /// Returns a connection after use.
    ///
    /// It is parked only when `healthy` and the connection itself reports a
    /// clean message boundary; otherwise it is closed.
    pub fn release(&self, pooled: PooledConnection, healthy: bool) {
        let PooledConnection { mut conn, _permit } = pooled;

        if !healthy || !conn.is_reusable() {
            tracing::debug!(conn = conn.id, target = %conn.target, healthy, "closing upstream connection");
            return;
        }

        conn.state = ConnState::Idle;
        conn.idle_since = Instant::now();

        let max = self.config.max_size_per_target;
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&conn.target) else {
            return;
        };
        if slot.idle.len() >= max {
            drop(slots);
            tracing::debug!(conn = conn.id, "idle set full, closing upstream connection");
            return;
        }
        tracing::trace!(conn = conn.id, target = %conn.target, "parking upstream connection");
        slot.idle.push(conn);
        // `_permit` drops after the connection is visible to waiters.
    }

    /// Closes idle connections whose inactivity window has passed.
    /// Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut evicted = Vec::new();

        {
            let mut slots = self.slots();
            for slot in slots.values_mut() {
                let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut slot.idle)
                    .into_iter()
                    .partition(|c| c.is_expired(now, idle_timeout));
                slot.idle = live;
                evicted.extend(expired);
            }
        }

        let count = evicted.len();
        if count > 0 {
            tracing::debug!(count, "evicted idle upstream connections");
        }
        count
    }

    /// Starts the background eviction sweep. The task ends once the pool is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_expired();
            }
        })
    }

    pub fn idle_count(&self, target: &Target) -> usize {
        self.slots().get(target).map_or(0, |slot| slot.idle.len())
    }

    /// Upstream sockets currently open, idle or in use.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}
