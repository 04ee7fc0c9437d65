//! One proxied request, end to end.
//!
//! ```text
//! Started -> Acquiring -> Sending -> AwaitingResponse -> Relaying -> Done
//!     \__________\___________\______________\_______________\_____> Done(error)
//! ```
//!
//! The whole exchange runs under a single deadline. When it fires, the
//! in-flight future is dropped, which closes whatever upstream connection it
//! held; what the client sees then depends on whether the response head was
//! already committed.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, timeout, timeout_at};

use crate::http::body::Framing;
use crate::http::request::InboundRequest;
use crate::http::response::StatusCode;
use crate::http::stream::HttpStream;
use crate::http::writer::write_response;
use crate::proxy::downstream::{RelayContext, Relayed, ResponseRelay};
use crate::proxy::events::SessionEvent;
use crate::proxy::outcome::{Outcome, ProxyError};
use crate::proxy::pool::PooledConnection;
use crate::proxy::upstream::RequestRelay;
use crate::server::ProxyServer;

/// Bound on writing a synthesized error response to a client.
const ERROR_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Started,
    Acquiring,
    Sending,
    AwaitingResponse,
    Relaying,
    Done,
}

/// What the client connection needs to know once a session is over.
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub outcome: Outcome,
    /// Status the client received, if any
    pub status: Option<StatusCode>,
    /// Whether the client connection may carry another request
    pub client_keep_alive: bool,
}

pub struct ProxySession<'a> {
    server: &'a ProxyServer,
    state: SessionState,
    started: Instant,
    deadline: Instant,
}

impl<'a> ProxySession<'a> {
    pub fn new(server: &'a ProxyServer) -> Self {
        let started = Instant::now();
        Self {
            server,
            state: SessionState::Started,
            started,
            deadline: started + server.config().session_timeout(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, state: SessionState) {
        tracing::trace!(from = ?self.state, to = ?state, "session state change");
        self.state = state;
    }

    /// Forwards `req` and relays the response to `client`, reporting the
    /// outcome to the server's event sink.
    ///
    /// Never fails: every error becomes an [`Outcome`].
    pub async fn run<C>(mut self, req: &mut InboundRequest, client: &mut HttpStream<C>) -> SessionReport
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let server = self.server;
        let deadline = self.deadline;

        let result = timeout_at(deadline, self.drive(req, client)).await;
        let result = match result {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout(server.config().session_timeout())),
        };

        let committed = self.state >= SessionState::Relaying;
        self.enter(SessionState::Done);

        let (outcome, status, client_keep_alive, error) = match result {
            Ok(relayed) => (
                Outcome::Success(relayed.status),
                Some(relayed.status),
                relayed.client_keep_alive,
                None,
            ),
            Err(err) => {
                let outcome = err.outcome();
                let mut status = None;
                if !committed {
                    if let Some(response) = outcome.error_response() {
                        status = Some(response.status);
                        match timeout(ERROR_WRITE_TIMEOUT, write_response(client, &response)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::debug!(error = %e, "failed to send error response"),
                            Err(_) => tracing::debug!("timed out sending error response"),
                        }
                    }
                }
                (outcome, status, false, Some(err.to_string()))
            }
        };

        server.sink().record(&SessionEvent {
            method: req.method().clone(),
            path: req.path().to_string(),
            target: server.target().to_string(),
            outcome,
            status: status.map(|s| s.as_u16()),
            error,
            duration: self.started.elapsed(),
        });

        SessionReport {
            outcome,
            status,
            client_keep_alive,
        }
    }

    async fn drive<C>(&mut self, req: &mut InboundRequest, client: &mut HttpStream<C>) -> Result<Relayed, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let server = self.server;
        let target = server.target();
        let pool = server.pool();
        let relay = RequestRelay::new(target, server.config().forward_headers);
        let mut fresh = false;

        loop {
            self.enter(SessionState::Acquiring);
            let acquire = async move {
                if fresh {
                    pool.connect_fresh(target).await
                } else {
                    pool.acquire(target).await
                }
            };
            let mut conn = tokio::select! {
                conn = acquire => conn?,
                _ = client.closed() => return Err(ProxyError::ClientDisconnected),
            };

            self.enter(SessionState::Sending);
            if let Err(err) = relay.send(&mut conn, req, client).await {
                if self.may_retry(&conn, req, &err, fresh) {
                    tracing::debug!(conn = conn.id(), error = %err, "retrying on a fresh connection");
                    pool.release(conn, false);
                    fresh = true;
                    continue;
                }
                pool.release(conn, false);
                return Err(err);
            }

            self.enter(SessionState::AwaitingResponse);
            let response = tokio::select! {
                response = ResponseRelay::read_head(&mut conn, req.method()) => response,
                _ = client.closed() => Err(ProxyError::ClientDisconnected),
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if self.may_retry(&conn, req, &err, fresh) {
                        tracing::debug!(conn = conn.id(), error = %err, "retrying on a fresh connection");
                        pool.release(conn, false);
                        fresh = true;
                        continue;
                    }
                    pool.release(conn, false);
                    return Err(err);
                }
            };

            self.enter(SessionState::Relaying);
            let ctx = RelayContext::for_request(&req.head);
            let result = ResponseRelay::relay(response, &mut conn, client, ctx).await;
            pool.release(conn, result.is_ok());
            return result;
        }
    }

    /// A failed attempt may be replayed once, on a fresh connection, when it
    /// went to a reused pooled connection that died before answering and
    /// the request is safe to repeat and carries no body.
    fn may_retry(&self, conn: &PooledConnection, req: &InboundRequest, err: &ProxyError, fresh: bool) -> bool {
        self.server.config().retry_idempotent
            && !fresh
            && conn.is_reused()
            && !conn.has_unread_bytes()
            && req.method().is_retry_safe()
            && req.body.framing() == Framing::Empty
            && err.is_stale_connection()
    }
}
