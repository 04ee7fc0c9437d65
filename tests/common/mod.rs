//! Shared utilities for integration testing: stub upstreams, a proxy on an
//! ephemeral port and a minimal HTTP client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use ferry::config::Config;
use ferry::http::body::{BodyDecoder, request_framing, response_framing};
use ferry::http::headers::HeaderMap;
use ferry::http::parser::{parse_request_head, parse_response_head};
use ferry::http::request::Method;
use ferry::http::response::ResponseHead;
use ferry::http::stream::HttpStream;
use ferry::proxy::events::{EventSink, SessionEvent};
use ferry::server::{ProxyServer, listener};

/// A request as the stub upstream saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Position of this request on its upstream connection, from 0
    pub seq: usize,
}

/// What the stub upstream does with a request.
pub enum Reply {
    /// Write these bytes and keep reading requests
    Send(Vec<u8>),
    /// Write these bytes, then close the socket
    SendAndClose(Vec<u8>),
    /// Write these bytes, then stall with the socket open
    SendAndHang(Vec<u8>),
    /// Never answer, keep the socket open
    Hang,
    /// Close the socket without answering
    Close,
}

pub fn ok_json(body: &str) -> Reply {
    Reply::Send(
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes(),
    )
}

pub type Handler = Arc<dyn Fn(&Received) -> Reply + Send + Sync>;

pub struct Upstream {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl Upstream {
    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections the proxy closed (EOF or reset seen by the stub).
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start a keep-alive stub upstream on an ephemeral port.
pub async fn start_upstream(handler: impl Fn(&Received) -> Reply + Send + Sync + 'static) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler: Handler = Arc::new(handler);

    let accepted = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));

    let upstream = Upstream {
        addr,
        accepted: accepted.clone(),
        closed: closed.clone(),
        received: received.clone(),
    };

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            let closed = closed.clone();
            let received = received.clone();
            tokio::spawn(async move {
                serve_upstream(socket, handler, received).await;
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    upstream
}

async fn serve_upstream(socket: TcpStream, handler: Handler, log: Arc<Mutex<Vec<Received>>>) {
    let mut stream = HttpStream::new(socket);
    let mut seq = 0;

    loop {
        let Ok(Some(head)) = stream.read_head(parse_request_head).await else {
            return;
        };
        let Ok(framing) = request_framing(&head) else {
            return;
        };

        let mut decoder = BodyDecoder::new(framing);
        let mut body = Vec::new();
        loop {
            match decoder.next_chunk(&mut stream).await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => return,
            }
        }

        let req = Received {
            method: head.method.clone(),
            target: head.target.clone(),
            headers: head.headers.clone(),
            body,
            seq,
        };
        seq += 1;
        log.lock().unwrap().push(req.clone());

        match handler(&req) {
            Reply::Send(bytes) => {
                if stream.write_all(&bytes).await.is_err() || stream.flush().await.is_err() {
                    return;
                }
            }
            Reply::SendAndClose(bytes) => {
                let _ = stream.write_all(&bytes).await;
                let _ = stream.shutdown().await;
                return;
            }
            Reply::SendAndHang(bytes) => {
                if stream.write_all(&bytes).await.is_err() || stream.flush().await.is_err() {
                    return;
                }
                stream.closed().await;
                return;
            }
            Reply::Hang => {
                // Hold the socket until the proxy gives up on it
                stream.closed().await;
                return;
            }
            Reply::Close => return,
        }
    }
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Collects session events for assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl EventSink for CollectingSink {
    fn record(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl CollectingSink {
    /// Waits until at least `n` events were recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<SessionEvent> {
        for _ in 0..500 {
            {
                let events = self.events.lock().unwrap();
                if events.len() >= n {
                    return events.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} session events");
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub server: Arc<ProxyServer>,
    pub events: Arc<CollectingSink>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

/// Start a proxy on an ephemeral port forwarding to `target`.
pub async fn start_proxy(target: &str, tweak: impl FnOnce(&mut Config)) -> TestProxy {
    let mut config = Config {
        target: target.to_string(),
        ..Config::default()
    };
    tweak(&mut config);

    let events = Arc::new(CollectingSink::default());
    let server = Arc::new(ProxyServer::new(config).unwrap().with_sink(events.clone()));

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(listener::serve(tcp, server.clone(), async move {
        let _ = rx.await;
    }));

    TestProxy {
        addr,
        server,
        events,
        shutdown: Some(tx),
        handle,
    }
}

/// A response as a client received it.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub struct Client {
    stream: HttpStream<TcpStream>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: HttpStream::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Reads only the head of the next response.
    pub async fn head(&mut self) -> ResponseHead {
        self.stream
            .read_head(parse_response_head)
            .await
            .unwrap()
            .expect("connection closed before a response")
    }

    /// Reads whatever arrives until the proxy closes the connection.
    pub async fn read_to_close(&mut self) -> Vec<u8> {
        let mut out = self.stream.take(usize::MAX).to_vec();
        while let Ok(n) = self.stream.fill_buf().await {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&self.stream.take(usize::MAX));
        }
        out
    }

    /// Reads one complete response to a request made with `method`.
    pub async fn response(&mut self, method: Method) -> ClientResponse {
        let head = self.head().await;
        let framing = response_framing(&method, &head).unwrap();

        let mut decoder = BodyDecoder::new(framing);
        let mut body = Vec::new();
        while let Some(chunk) = decoder.next_chunk(&mut self.stream).await.unwrap() {
            body.extend_from_slice(&chunk);
        }

        ClientResponse {
            status: head.status.as_u16(),
            headers: head.headers,
            body,
        }
    }

    /// Whether the proxy closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.stream.closed())
            .await
            .is_ok()
    }
}

/// Polls `cond` for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
