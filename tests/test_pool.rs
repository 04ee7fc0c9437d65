//! Upstream connection pool behavior against a bare TCP listener

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use ferry::config::PoolConfig;
use ferry::proxy::pool::{ConnState, ConnectionPool, PooledConnection};
use ferry::proxy::target::Target;

/// Accepts connections and holds the server side open until dropped.
struct Sink {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    sockets: Arc<Mutex<Vec<TcpStream>>>,
}

impl Sink {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let sockets = Arc::new(Mutex::new(Vec::new()));

        let (count, held) = (accepted.clone(), sockets.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                held.lock().unwrap().push(socket);
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self {
            addr,
            accepted,
            sockets,
        }
    }

    fn target(&self) -> Target {
        Target::parse(&format!("http://{}", self.addr)).unwrap()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn close_all(&self) {
        self.sockets.lock().unwrap().clear();
    }
}

fn pool(max: usize, idle_timeout_ms: u64) -> ConnectionPool {
    ConnectionPool::new(PoolConfig {
        max_size_per_target: max,
        idle_timeout_ms,
        ..PoolConfig::default()
    })
}

/// Marks a full keep-alive exchange as done on `conn`.
fn complete_exchange(conn: &mut PooledConnection) {
    conn.begin_exchange();
    conn.mark_request_complete();
    conn.mark_response_complete(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_released_connection_is_reused() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 60_000);

    let mut conn = pool.acquire(&target).await.unwrap();
    let first_id = conn.id();
    assert_eq!(conn.state(), ConnState::InUse);
    assert!(!conn.is_reused());

    complete_exchange(&mut conn);
    pool.release(conn, true);
    assert_eq!(pool.idle_count(&target), 1);

    let conn = pool.acquire(&target).await.unwrap();
    assert_eq!(conn.id(), first_id);
    assert!(conn.is_reused());
    assert_eq!(pool.idle_count(&target), 0);
    assert_eq!(sink.accepted(), 1);
}

#[tokio::test]
async fn test_unhealthy_release_closes_connection() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 60_000);

    let mut conn = pool.acquire(&target).await.unwrap();
    complete_exchange(&mut conn);
    assert_eq!(pool.open_connections(), 1);

    pool.release(conn, false);
    assert_eq!(pool.idle_count(&target), 0);
    assert_eq!(pool.open_connections(), 0);
}

#[tokio::test]
async fn test_unfinished_exchange_is_not_pooled() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 60_000);

    let mut conn = pool.acquire(&target).await.unwrap();
    conn.begin_exchange();
    conn.mark_request_complete();
    pool.release(conn, true);
    assert_eq!(pool.idle_count(&target), 0);

    let mut conn = pool.acquire(&target).await.unwrap();
    complete_exchange(&mut conn);
    conn.mark_broken();
    assert!(!conn.is_reusable());
    pool.release(conn, true);
    assert_eq!(pool.idle_count(&target), 0);
    assert_eq!(pool.open_connections(), 0);
}

#[tokio::test]
async fn test_dropped_connection_is_closed() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 60_000);

    let conn = pool.acquire(&target).await.unwrap();
    assert_eq!(pool.open_connections(), 1);
    drop(conn);
    assert_eq!(pool.open_connections(), 0);
    assert_eq!(pool.idle_count(&target), 0);
}

#[tokio::test]
async fn test_expired_connections_are_evicted() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 50);

    let mut conn = pool.acquire(&target).await.unwrap();
    complete_exchange(&mut conn);
    pool.release(conn, true);
    assert_eq!(pool.evict_expired(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.evict_expired(), 1);
    assert_eq!(pool.idle_count(&target), 0);
    assert_eq!(pool.open_connections(), 0);
}

#[tokio::test]
async fn test_expired_connection_is_never_handed_out() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 50);

    let mut conn = pool.acquire(&target).await.unwrap();
    let first_id = conn.id();
    complete_exchange(&mut conn);
    pool.release(conn, true);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let conn = pool.acquire(&target).await.unwrap();
    assert_ne!(conn.id(), first_id);
    assert!(!conn.is_reused());
    assert_eq!(pool.open_connections(), 1);
}

#[tokio::test]
async fn test_sweeper_evicts_in_background() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        idle_timeout_ms: 20,
        sweep_interval_ms: 20,
        ..PoolConfig::default()
    }));
    let sweeper = pool.spawn_sweeper();

    let mut conn = pool.acquire(&target).await.unwrap();
    complete_exchange(&mut conn);
    pool.release(conn, true);
    assert_eq!(pool.idle_count(&target), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.idle_count(&target), 0);
    assert_eq!(pool.open_connections(), 0);

    // The sweep ends by itself once the pool is gone
    drop(pool);
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_closed_by_upstream_is_discarded() {
    let sink = Sink::start().await;
    let target = sink.target();
    let pool = pool(4, 60_000);

    let mut conn = pool.acquire(&target).await.unwrap();
    let first_id = conn.id();
    complete_exchange(&mut conn);
    pool.release(conn, true);

    while sink.accepted() < 1 {
        tokio::task::yield_now().await;
    }
    sink.close_all();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conn = pool.acquire(&target).await.unwrap();
    assert_ne!(conn.id(), first_id);
    assert_eq!(sink.accepted(), 2);
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let target = Target::parse(&format!("http://{addr}")).unwrap();
    let pool = pool(4, 60_000);

    let err = pool.acquire(&target).await.unwrap_err();
    assert!(err.to_string().contains(&addr.to_string()));
    assert_eq!(pool.open_connections(), 0);

    // The failed attempt gave its slot back
    for _ in 0..4 {
        assert!(pool.acquire(&target).await.is_err());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_respects_bound_and_exclusivity() {
    const MAX: usize = 3;
    const TASKS: usize = 24;

    let sink = Sink::start().await;
    let target = sink.target();
    let pool = Arc::new(pool(MAX, 60_000));

    let in_use = Arc::new(Mutex::new(HashSet::new()));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let (pool, target, in_use, peak) = (pool.clone(), target.clone(), in_use.clone(), peak.clone());
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let mut conn = pool.acquire(&target).await.unwrap();
                {
                    let mut held = in_use.lock().unwrap();
                    assert!(held.insert(conn.id()), "connection handed out twice");
                    peak.fetch_max(held.len(), Ordering::SeqCst);
                }

                tokio::time::sleep(Duration::from_millis(2)).await;
                complete_exchange(&mut conn);

                in_use.lock().unwrap().remove(&conn.id());
                pool.release(conn, true);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert!(sink.accepted() <= MAX);
    assert!(pool.open_connections() <= MAX);
    assert!(pool.idle_count(&target) <= MAX);
}
