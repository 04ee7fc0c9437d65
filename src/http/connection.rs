use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::http::body::request_framing;
use crate::http::parser::parse_request_head;
use crate::http::request::InboundRequest;
use crate::http::response::{Response, StatusCode};
use crate::http::stream::{HeadError, HttpStream};
use crate::http::writer::write_response;
use crate::proxy::session::ProxySession;
use crate::server::{ProxyServer, ShutdownSignal};

/// One client connection, served request by request.
pub struct Connection<S> {
    stream: HttpStream<S>,
    peer: SocketAddr,
    local: SocketAddr,
    server: Arc<ProxyServer>,
    shutdown: ShutdownSignal,
    state: ConnectionState,
}

pub enum ConnectionState {
    /// Waiting for the next request head
    Reading,
    /// A request is being forwarded
    Proxying(InboundRequest),
    /// The connection will not carry another request
    Closing,
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
        server: Arc<ProxyServer>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            stream: HttpStream::new(stream),
            peer,
            local,
            server,
            shutdown,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
            self.state = match state {
                ConnectionState::Reading => self.read_request().await?,

                ConnectionState::Proxying(mut req) => {
                    let report = ProxySession::new(&self.server).run(&mut req, &mut self.stream).await;

                    // A body left unread would be taken for the next request.
                    if report.client_keep_alive && req.body.is_done() && !self.shutdown.is_triggered() {
                        ConnectionState::Reading
                    } else {
                        ConnectionState::Closing
                    }
                }

                ConnectionState::Closing => {
                    if let Err(e) = self.stream.shutdown().await {
                        tracing::debug!(peer = %self.peer, error = %e, "client shutdown failed");
                    }
                    ConnectionState::Closed
                }

                ConnectionState::Closed => break,
            };
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<ConnectionState> {
        if self.shutdown.is_triggered() {
            return Ok(ConnectionState::Closing);
        }

        let idle_timeout = self.server.config().client_idle_timeout();
        let read = tokio::select! {
            read = timeout(idle_timeout, self.stream.read_head(parse_request_head)) => read,
            _ = self.shutdown.triggered() => return Ok(ConnectionState::Closing),
        };

        let head = match read {
            Ok(Ok(Some(head))) => head,
            // Client closed the connection between requests
            Ok(Ok(None)) => return Ok(ConnectionState::Closed),
            Ok(Err(HeadError::TooLarge)) => {
                return self.reject(StatusCode::HEADERS_TOO_LARGE, "Request header section is too large.").await;
            }
            Ok(Err(HeadError::Parse(e))) => {
                tracing::debug!(peer = %self.peer, error = %e, "malformed request");
                return self.reject(StatusCode::BAD_REQUEST, "Malformed request.").await;
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %self.peer, error = %e, "client connection lost");
                return Ok(ConnectionState::Closed);
            }
            Err(_) => {
                tracing::debug!(peer = %self.peer, "client idle timeout");
                return Ok(ConnectionState::Closing);
            }
        };

        let framing = match request_framing(&head) {
            Ok(framing) => framing,
            Err(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "unusable request framing");
                return self.reject(StatusCode::BAD_REQUEST, "Request body framing is invalid.").await;
            }
        };

        Ok(ConnectionState::Proxying(InboundRequest::new(
            head, framing, self.peer, self.local,
        )))
    }

    async fn reject(&mut self, status: StatusCode, detail: &str) -> anyhow::Result<ConnectionState> {
        write_response(&mut self.stream, &Response::error(status, detail)).await?;
        Ok(ConnectionState::Closing)
    }
}
