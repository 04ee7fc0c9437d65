//! Response relaying back to the client.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::body::{BodyDecoder, BodyEncoder, Framing, response_framing};
use crate::http::parser::parse_response_head;
use crate::http::request::{Method, RequestHead};
use crate::http::response::{ResponseHead, StatusCode};
use crate::http::stream::HttpStream;
use crate::http::writer::serialize_response_head;
use crate::proxy::outcome::ProxyError;
use crate::proxy::pool::UpstreamConnection;

/// A response head received from the upstream with its body still unread.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub body: BodyDecoder,
}

/// What the client side of the exchange negotiated.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub method: Method,
    pub client_http10: bool,
    pub client_keep_alive: bool,
}

impl RelayContext {
    pub fn for_request(head: &RequestHead) -> Self {
        Self {
            method: head.method.clone(),
            client_http10: head.is_http10(),
            client_keep_alive: head.keep_alive(),
        }
    }
}

/// Result of a completely relayed response.
#[derive(Debug, Clone, Copy)]
pub struct Relayed {
    pub status: StatusCode,
    /// Whether the client connection may carry another request
    pub client_keep_alive: bool,
    /// Body bytes delivered to the client
    pub body_bytes: u64,
}

pub struct ResponseRelay;

impl ResponseRelay {
    /// Reads the final response head from the upstream, skipping interim
    /// `1xx` responses.
    ///
    /// Nothing has reached the client when this fails, so the caller can
    /// still answer with an error response.
    pub async fn read_head(
        conn: &mut UpstreamConnection,
        method: &Method,
    ) -> Result<UpstreamResponse, ProxyError> {
        let result = Self::read_final_head(conn, method).await;
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }

    async fn read_final_head(
        conn: &mut UpstreamConnection,
        method: &Method,
    ) -> Result<UpstreamResponse, ProxyError> {
        loop {
            let head = conn
                .stream()
                .read_head(parse_response_head)
                .await
                .map_err(ProxyError::UpstreamHead)?
                .ok_or(ProxyError::UpstreamClosed)?;

            if head.status == StatusCode::SWITCHING_PROTOCOLS {
                return Err(ProxyError::UnexpectedUpgrade);
            }
            if head.status.is_informational() {
                tracing::trace!(conn = conn.id(), status = head.status.as_u16(), "skipping interim response");
                continue;
            }

            let framing = response_framing(method, &head).map_err(ProxyError::UpstreamFraming)?;
            return Ok(UpstreamResponse {
                head,
                body: BodyDecoder::new(framing),
            });
        }
    }

    /// Framing used towards the client for a body the upstream framed as
    /// `upstream`.
    ///
    /// Bodies of unknown length go out chunked to HTTP/1.1 clients so their
    /// connection survives; HTTP/1.0 clients only understand
    /// close-delimited bodies.
    pub fn client_framing(upstream: Framing, client_http10: bool) -> Framing {
        match upstream {
            Framing::Empty => Framing::Empty,
            Framing::Length(n) => Framing::Length(n),
            Framing::Chunked | Framing::CloseDelimited if client_http10 => Framing::CloseDelimited,
            Framing::Chunked | Framing::CloseDelimited => Framing::Chunked,
        }
    }

    /// Response head for the client with hop-by-hop headers removed and
    /// framing rewritten for `framing`.
    pub fn build_client_head(
        head: &ResponseHead,
        upstream: Framing,
        framing: Framing,
        keep_alive: bool,
        client_http10: bool,
    ) -> Vec<u8> {
        let mut headers = head.headers.clone();
        headers.strip_hop_by_hop();

        // A bodyless response keeps the upstream's Content-Length: for HEAD
        // and 304 it describes the representation, not this message.
        if upstream != Framing::Empty {
            headers.remove("Content-Length");
        }
        match framing {
            Framing::Length(n) => headers.append("Content-Length", n.to_string()),
            Framing::Chunked => headers.append("Transfer-Encoding", "chunked"),
            Framing::Empty | Framing::CloseDelimited => {}
        }

        if !keep_alive {
            headers.append("Connection", "close");
        } else if client_http10 {
            headers.append("Connection", "keep-alive");
        }

        serialize_response_head(head.status, &head.reason, &headers)
    }

    /// Streams `resp` to the client.
    ///
    /// The head is committed first; after that a failure can only truncate
    /// the response. A client that goes away, whether noticed through a
    /// failed write or while waiting on a stalled upstream, stops the relay
    /// at once and the upstream connection is discarded.
    pub async fn relay<C>(
        resp: UpstreamResponse,
        conn: &mut UpstreamConnection,
        client: &mut HttpStream<C>,
        ctx: RelayContext,
    ) -> Result<Relayed, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let UpstreamResponse { head, mut body } = resp;
        let upstream_framing = body.framing();
        let framing = Self::client_framing(upstream_framing, ctx.client_http10);
        let keep_alive = ctx.client_keep_alive && framing.is_self_delimiting();

        let client_head =
            Self::build_client_head(&head, upstream_framing, framing, keep_alive, ctx.client_http10);
        client
            .write_all(&client_head)
            .await
            .map_err(|_| ProxyError::ClientDisconnected)?;

        let mut encoder = BodyEncoder::new(framing);
        loop {
            let next = tokio::select! {
                next = body.next_chunk(conn.stream()) => Some(next),
                _ = client.closed() => None,
            };
            let Some(next) = next else {
                conn.mark_broken();
                return Err(ProxyError::ClientDisconnected);
            };

            match next {
                Ok(Some(chunk)) => {
                    if let Err(e) = encoder.write_chunk(client, &chunk).await {
                        conn.mark_broken();
                        return Err(ProxyError::from_client_write(e));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    conn.mark_broken();
                    return Err(ProxyError::UpstreamBody(e));
                }
            }
        }

        let trailers = if framing == Framing::Chunked {
            body.trailers()
        } else {
            None
        };
        encoder
            .finish(client, trailers)
            .await
            .map_err(ProxyError::from_client_write)?;

        conn.mark_response_complete(head.keep_alive() && upstream_framing.is_self_delimiting());

        Ok(Relayed {
            status: head.status,
            client_keep_alive: keep_alive,
            body_bytes: encoder.written(),
        })
    }
}
