//! Request forwarding towards the upstream.
//!
//! Writes the rewritten request head to an upstream connection and streams
//! the client body behind it with the framing the client used.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::body::{BodyEncoder, Framing};
use crate::http::headers::HeaderMap;
use crate::http::request::InboundRequest;
use crate::http::stream::HttpStream;
use crate::http::writer::{serialize_request_head, write_continue};
use crate::proxy::outcome::ProxyError;
use crate::proxy::pool::UpstreamConnection;
use crate::proxy::target::Target;

/// Scheme the proxy accepts clients on.
const CLIENT_SCHEME: &str = "http";

/// Sends inbound requests to one upstream target.
#[derive(Debug, Clone, Copy)]
pub struct RequestRelay<'a> {
    target: &'a Target,
    forward_headers: bool,
}

impl<'a> RequestRelay<'a> {
    pub fn new(target: &'a Target, forward_headers: bool) -> Self {
        Self {
            target,
            forward_headers,
        }
    }

    /// Builds the request line and headers sent upstream.
    ///
    /// `Host` names the target, hop-by-hop headers are dropped, framing
    /// headers are regenerated from the body framing and, when enabled, the
    /// `X-Forwarded-*` set records the client.
    pub fn build_request_head(&self, req: &InboundRequest) -> Vec<u8> {
        let mut headers = req.head.headers.clone();
        let original_host = headers.get("Host").map(str::to_string);

        headers.strip_hop_by_hop();
        headers.remove("Content-Length");
        if req.head.expects_continue() {
            headers.remove("Expect");
        }
        headers.insert("Host", self.target.authority());

        if self.forward_headers {
            append_list(&mut headers, "X-Forwarded-For", &req.peer.ip().to_string());
            append_list(&mut headers, "X-Forwarded-Port", &req.local.port().to_string());
            append_list(&mut headers, "X-Forwarded-Proto", CLIENT_SCHEME);
            if let Some(host) = original_host {
                if !headers.contains("X-Forwarded-Host") {
                    headers.append("X-Forwarded-Host", host);
                }
            }
        }

        match req.body.framing() {
            Framing::Length(n) => headers.append("Content-Length", n.to_string()),
            Framing::Chunked => headers.append("Transfer-Encoding", "chunked"),
            Framing::Empty | Framing::CloseDelimited => {}
        }

        let path = self.target.request_path(&req.head.origin_form());
        serialize_request_head(req.head.method.as_str(), &path, &headers)
    }

    /// Writes `req` to `conn`, streaming its body from `client`.
    ///
    /// Body chunks are read from the client only after the previous one was
    /// written upstream, so a slow upstream stalls the client instead of
    /// growing a buffer. A client that closes while an upstream write is
    /// blocked ends the exchange. On any error the connection is marked
    /// broken.
    pub async fn send<C>(
        &self,
        conn: &mut UpstreamConnection,
        req: &mut InboundRequest,
        client: &mut HttpStream<C>,
    ) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        conn.begin_exchange();
        let result = self.write_request(conn, req, client).await;
        match &result {
            Ok(()) => conn.mark_request_complete(),
            Err(_) => conn.mark_broken(),
        }
        result
    }

    async fn write_request<C>(
        &self,
        conn: &mut UpstreamConnection,
        req: &mut InboundRequest,
        client: &mut HttpStream<C>,
    ) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let head = self.build_request_head(req);
        conn.stream()
            .write_all(&head)
            .await
            .map_err(ProxyError::UpstreamWrite)?;

        tracing::trace!(conn = conn.id(), method = %req.method(), "request head sent upstream");

        if req.head.expects_continue() && !req.body.is_done() {
            write_continue(client)
                .await
                .map_err(|_| ProxyError::ClientDisconnected)?;
        }

        let mut encoder = BodyEncoder::new(req.body.framing());
        while let Some(chunk) = req
            .body
            .next_chunk(client)
            .await
            .map_err(ProxyError::from_client_body)?
        {
            let written = tokio::select! {
                written = encoder.write_chunk(conn.stream(), &chunk) => written,
                _ = client.closed() => return Err(ProxyError::ClientDisconnected),
            };
            written.map_err(ProxyError::from_upstream_write)?;
        }

        let finished = tokio::select! {
            finished = encoder.finish(conn.stream(), req.body.trailers()) => finished,
            _ = client.closed() => return Err(ProxyError::ClientDisconnected),
        };
        finished.map_err(ProxyError::from_upstream_write)?;

        tracing::trace!(conn = conn.id(), bytes = encoder.written(), "request body sent upstream");
        Ok(())
    }
}

/// Appends `value` to a comma-separated list header, creating it if absent.
fn append_list(headers: &mut HeaderMap, name: &str, value: &str) {
    let mut combined = Vec::new();
    for (_, existing) in headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case(name)) {
        combined.extend_from_slice(existing);
        combined.extend_from_slice(b", ");
    }
    combined.extend_from_slice(value.as_bytes());
    headers.insert(name, combined);
}
