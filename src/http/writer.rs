use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::headers::HeaderMap;
use crate::http::response::{Response, StatusCode};
use crate::http::stream::HttpStream;

const HTTP_VERSION: &str = "HTTP/1.1";

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v);
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
}

/// Request line plus header block, always sent as HTTP/1.1.
pub fn serialize_request_head(method: &str, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(format!("{method} {target} {HTTP_VERSION}\r\n").as_bytes());
    write_headers(&mut buf, headers);
    buf
}

/// Status line plus header block. An empty `reason` falls back to the
/// standard phrase for the code.
pub fn serialize_response_head(status: StatusCode, reason: &[u8], headers: &HeaderMap) -> Vec<u8> {
    let reason = if reason.is_empty() {
        status.reason_phrase().as_bytes()
    } else {
        reason
    };

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(format!("{HTTP_VERSION} {} ", status.as_u16()).as_bytes());
    buf.extend_from_slice(reason);
    buf.extend_from_slice(b"\r\n");
    write_headers(&mut buf, headers);
    buf
}

fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = serialize_response_head(resp.status, b"", &resp.headers);
    buf.extend_from_slice(&resp.body);
    buf
}

/// Writes a complete proxy-generated response.
pub async fn write_response<S>(stream: &mut HttpStream<S>, response: &Response) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&serialize_response(response)).await?;
    stream.flush().await
}

/// Interim `100 Continue` sent before reading a body the client is holding
/// back.
pub async fn write_continue<S>(stream: &mut HttpStream<S>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    stream.flush().await
}
