use crate::http::headers::HeaderMap;
use crate::http::request::{Method, RequestHead};
use crate::http::response::{ResponseHead, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("invalid method token")]
    InvalidMethod,
    #[error("malformed status line")]
    InvalidStatus,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    InvalidTransferEncoding,
    #[error("message head is incomplete")]
    Incomplete,
}

/// Parses a request line and header block.
///
/// Returns the head and the number of bytes it occupied; the body (if any)
/// starts right after and is left in the buffer.
pub fn parse_request_head(buf: &[u8]) -> Result<(RequestHead, usize), ParseError> {
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let mut lines = split_lines(&buf[..headers_end]);

    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    // The request line is plain ASCII; only field values may carry obs-text.
    let request_line = std::str::from_utf8(request_line)
        .ok()
        .filter(|line| line.is_ascii())
        .ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::parse(method_str).ok_or(ParseError::InvalidMethod)?;
    check_version(version)?;
    let headers = parse_header_lines(lines)?;

    let head = RequestHead {
        method,
        target: target.to_string(),
        version: version.to_string(),
        headers,
    };
    Ok((head, headers_end + 4))
}

/// Parses a status line and header block.
pub fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let mut lines = split_lines(&buf[..headers_end]);

    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, |&b| b == b' ');

    let version = parts
        .next()
        .and_then(|v| std::str::from_utf8(v).ok())
        .ok_or(ParseError::InvalidStatus)?;
    check_version(version)?;

    let code = parts.next().ok_or(ParseError::InvalidStatus)?;
    if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::InvalidStatus);
    }
    let status = code
        .iter()
        .fold(0u16, |n, d| n * 10 + u16::from(d - b'0'));
    let status = StatusCode::from_u16(status).ok_or(ParseError::InvalidStatus)?;
    // Reason phrases may contain obs-text and are forwarded byte for byte.
    let reason = parts.next().unwrap_or_default().to_vec();
    if reason.iter().any(|&b| is_forbidden_in_value(b)) {
        return Err(ParseError::InvalidStatus);
    }

    let headers = parse_header_lines(lines)?;

    let head = ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
    };
    Ok((head, headers_end + 4))
}

fn check_version(version: &str) -> Result<(), ParseError> {
    match version {
        "HTTP/1.1" | "HTTP/1.0" => Ok(()),
        _ => Err(ParseError::InvalidVersion),
    }
}

fn split_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(head);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.windows(2).position(|w| w == b"\r\n") {
            Some(at) => {
                rest = Some(&current[at + 2..]);
                Some(&current[..at])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

/// CR, LF and NUL never appear in a field value, even as obs-text.
fn is_forbidden_in_value(b: u8) -> bool {
    matches!(b, b'\r' | b'\n' | b'\0')
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a [u8]>) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Obsolete line folding is rejected rather than unfolded.
        if matches!(line[0], b' ' | b'\t') {
            return Err(ParseError::InvalidHeader);
        }

        let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::InvalidHeader)?;
        let (key, value) = (&line[..colon], &line[colon + 1..]);
        let key = std::str::from_utf8(key).map_err(|_| ParseError::InvalidHeader)?;
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ParseError::InvalidHeader);
        }

        let value = value.trim_ascii();
        if value.iter().any(|&b| is_forbidden_in_value(b)) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value);
    }

    Ok(headers)
}

pub(crate) fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_request_head(req).unwrap();

        assert_eq!(parsed.target, "/");
        assert_eq!(parsed.headers.get("host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn body_bytes_are_left_in_place() {
        let req = b"POST /api HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";

        let (_, consumed) = parse_request_head(req).unwrap();

        assert_eq!(&req[consumed..], b"hello");
    }

    #[test]
    fn parse_status_line_keeps_reason() {
        let resp = b"HTTP/1.1 418 I'm a teapot\r\nContent-Length: 0\r\n\r\n";

        let (head, consumed) = parse_response_head(resp).unwrap();

        assert_eq!(head.status.as_u16(), 418);
        assert_eq!(head.reason, b"I'm a teapot");
        assert_eq!(consumed, resp.len());
    }

    #[test]
    fn rejects_folded_headers() {
        let resp = b"HTTP/1.1 200 OK\r\nX-A: 1\r\n  continued\r\n\r\n";
        assert_eq!(parse_response_head(resp).unwrap_err(), ParseError::InvalidHeader);
    }

    #[test]
    fn rejects_bare_cr_and_nul_in_values() {
        let cr = b"GET / HTTP/1.1\r\nX-A: one\rtwo\r\n\r\n";
        assert_eq!(parse_request_head(cr).unwrap_err(), ParseError::InvalidHeader);

        let nul = b"HTTP/1.1 200 OK\r\nX-A: a\0b\r\n\r\n";
        assert_eq!(parse_response_head(nul).unwrap_err(), ParseError::InvalidHeader);
    }

    #[test]
    fn keeps_obs_text_in_values() {
        let resp = b"HTTP/1.1 200 D\xe9j\xe0 vu\r\nX-Name: caf\xe9\r\n\r\n";

        let (head, _) = parse_response_head(resp).unwrap();

        assert_eq!(head.reason, b"D\xe9j\xe0 vu");
        assert_eq!(head.headers.get_bytes("x-name"), Some(&b"caf\xe9"[..]));
    }
}
