//! Terminal results of a proxied request.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::http::body::{BodyError, EncodeError};
use crate::http::response::{Response, StatusCode};
use crate::http::stream::HeadError;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream response was relayed completely.
    Success(StatusCode),
    /// Connecting to or talking to the upstream failed before a response
    /// head was received.
    UpstreamUnreachable,
    /// The session deadline fired.
    UpstreamTimeout,
    /// The client went away before the exchange finished.
    ClientDisconnected,
    /// Broken framing on either side.
    ProtocolError,
    /// Anything else.
    InternalError,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::UpstreamUnreachable => "upstream_unreachable",
            Outcome::UpstreamTimeout => "upstream_timeout",
            Outcome::ClientDisconnected => "client_disconnected",
            Outcome::ProtocolError => "protocol_error",
            Outcome::InternalError => "internal_error",
        }
    }

    /// Response to send when the failure happened before anything was
    /// written to the client.
    pub fn error_response(&self) -> Option<Response> {
        match self {
            Outcome::UpstreamUnreachable | Outcome::ProtocolError => Some(Response::bad_gateway()),
            Outcome::UpstreamTimeout => Some(Response::gateway_timeout()),
            Outcome::InternalError => Some(Response::internal_error()),
            Outcome::Success(_) | Outcome::ClientDisconnected => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(status) => write!(f, "success({})", status.as_u16()),
            other => f.write_str(other.kind()),
        }
    }
}

/// Failure inside one proxied exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connecting to upstream {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("TLS handshake with upstream {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write request to upstream: {0}")]
    UpstreamWrite(#[source] io::Error),
    #[error("failed to read upstream response head: {0}")]
    UpstreamHead(#[source] HeadError),
    #[error("upstream closed the connection without responding")]
    UpstreamClosed,
    #[error("upstream switched protocols although no upgrade was forwarded")]
    UnexpectedUpgrade,
    #[error("upstream response body failed: {0}")]
    UpstreamBody(#[source] BodyError),
    #[error("upstream response has invalid framing: {0}")]
    UpstreamFraming(#[source] crate::http::parser::ParseError),
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("client request body is malformed: {0}")]
    ClientBody(#[source] BodyError),
    #[error(transparent)]
    BodyLength(EncodeError),
    #[error("session deadline of {0:?} elapsed")]
    Timeout(Duration),
    #[error("connection pool is closed")]
    PoolClosed,
}

impl ProxyError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ProxyError::Connect { .. }
            | ProxyError::ConnectTimeout { .. }
            | ProxyError::TlsHandshake { .. }
            | ProxyError::UpstreamWrite(_)
            | ProxyError::UpstreamHead(_)
            | ProxyError::UpstreamClosed => Outcome::UpstreamUnreachable,
            ProxyError::UnexpectedUpgrade
            | ProxyError::UpstreamBody(_)
            | ProxyError::UpstreamFraming(_)
            | ProxyError::ClientBody(_)
            | ProxyError::BodyLength(_) => Outcome::ProtocolError,
            ProxyError::ClientDisconnected => Outcome::ClientDisconnected,
            ProxyError::Timeout(_) => Outcome::UpstreamTimeout,
            ProxyError::PoolClosed => Outcome::InternalError,
        }
    }

    /// Whether the upstream may have seen nothing worth acting on, i.e. the
    /// socket died before a single response byte arrived.
    pub fn is_stale_connection(&self) -> bool {
        matches!(self, ProxyError::UpstreamWrite(_) | ProxyError::UpstreamClosed)
            || matches!(self, ProxyError::UpstreamHead(HeadError::Io(_)))
    }

    /// Maps a failure reading the client body.
    pub(crate) fn from_client_body(err: BodyError) -> Self {
        match err {
            BodyError::Io(_) | BodyError::UnexpectedEof => ProxyError::ClientDisconnected,
            BodyError::Malformed(_) => ProxyError::ClientBody(err),
        }
    }

    /// Maps a failure writing to the upstream.
    pub(crate) fn from_upstream_write(err: EncodeError) -> Self {
        match err {
            EncodeError::Io(e) => ProxyError::UpstreamWrite(e),
            EncodeError::LengthMismatch { .. } => ProxyError::BodyLength(err),
        }
    }

    /// Maps a failure writing to the client.
    pub(crate) fn from_client_write(err: EncodeError) -> Self {
        match err {
            EncodeError::Io(_) => ProxyError::ClientDisconnected,
            EncodeError::LengthMismatch { .. } => ProxyError::BodyLength(err),
        }
    }
}
