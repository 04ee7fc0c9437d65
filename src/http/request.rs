use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

use crate::http::body::{BodyDecoder, Framing};
use crate::http::headers::HeaderMap;

/// HTTP request methods.
///
/// The registered methods get their own variants; any other syntactically
/// valid method token (WebDAV's `PROPFIND`, `MKCOL` and friends) is carried
/// as `Other` and forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// TRACE - Message loop-back test
    TRACE,
    /// Extension method token
    Other(String),
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Method tokens are case-sensitive. Returns `None` only when `s` is not
    /// a valid token.
    ///
    /// ```
    /// # use ferry::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Some(Method::GET));
    /// assert_eq!(Method::parse("get"), Some(Method::Other("get".to_string())));
    /// assert_eq!(Method::parse("GE(T"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let method = match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "TRACE" => Method::TRACE,
            other if is_token(other) => Method::Other(other.to_string()),
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::Other(token) => token,
        }
    }

    /// Methods a half-finished exchange may be replayed for.
    ///
    /// PUT and DELETE are idempotent on paper but are never replayed: a
    /// request that reached the upstream once may already have taken effect.
    /// Extension methods are never replayed either.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RFC 9110 `token`: one or more tchar.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// Request line and headers of a parsed request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target as sent by the client (e.g. "/items?x=1")
    pub target: String,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// Request headers in wire order
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn is_http10(&self) -> bool {
        self.version == "HTTP/1.0"
    }

    /// Determines whether the client connection may carry another request
    /// after this one.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.is_http10() {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }

    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("Expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Path and query in origin form.
    ///
    /// Absolute-form targets (`GET http://host/path HTTP/1.1`) are reduced to
    /// their path and query.
    pub fn origin_form(&self) -> Cow<'_, str> {
        let target = self.target.as_str();
        if let Some(rest) = target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"))
        {
            return match rest.find(['/', '?']) {
                Some(idx) if rest[idx..].starts_with('/') => Cow::Borrowed(&rest[idx..]),
                Some(idx) => Cow::Owned(format!("/{}", &rest[idx..])),
                None => Cow::Borrowed("/"),
            };
        }
        if target.is_empty() {
            Cow::Borrowed("/")
        } else {
            Cow::Borrowed(target)
        }
    }
}

/// A request accepted from a client, with its body still on the wire.
///
/// Everything but the body cursor is immutable once parsed.
#[derive(Debug)]
pub struct InboundRequest {
    pub head: RequestHead,
    /// Address of the client that sent the request
    pub peer: SocketAddr,
    /// Local address the request arrived on
    pub local: SocketAddr,
    /// Cursor over the request body on the client connection
    pub body: BodyDecoder,
}

impl InboundRequest {
    pub fn new(head: RequestHead, framing: Framing, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            head,
            peer,
            local,
            body: BodyDecoder::new(framing),
        }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.target
    }
}
