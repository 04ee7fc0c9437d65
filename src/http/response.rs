use crate::http::headers::HeaderMap;

/// HTTP status code.
///
/// Upstream responses may carry any three-digit code, so this is a thin
/// wrapper around the number with constants for the codes the proxy itself
/// produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    /// 100 Continue
    pub const CONTINUE: StatusCode = StatusCode(100);
    /// 101 Switching Protocols
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    /// 200 OK
    pub const OK: StatusCode = StatusCode(200);
    /// 204 No Content
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    /// 304 Not Modified
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    /// 400 Bad Request
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    /// 431 Request Header Fields Too Large
    pub const HEADERS_TOO_LARGE: StatusCode = StatusCode(431);
    /// 500 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    /// 502 Bad Gateway
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    /// 504 Gateway Timeout
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);

    /// Accepts codes in the `100..=999` range.
    pub fn from_u16(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(StatusCode(code))
    }

    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use ferry::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::BAD_GATEWAY.as_u16(), 502);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Whether a response with this status never carries a body.
    pub fn is_bodyless(&self) -> bool {
        self.is_informational() || *self == Self::NO_CONTENT || *self == Self::NOT_MODIFIED
    }

    /// Returns the standard reason phrase, or an empty string for codes the
    /// proxy has no phrase for.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }
}

/// Status line and headers of a response read from the upstream.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: StatusCode,
    /// Reason phrase as sent by the upstream, forwarded verbatim
    pub reason: Vec<u8>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the upstream is willing to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }
}

/// A complete response generated by the proxy itself (error pages, interim
/// responses to malformed requests).
#[derive(Debug)]
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    /// HTTP headers in the order they are written
    pub headers: HeaderMap,
    /// Response body as bytes
    pub body: Vec<u8>,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::BAD_GATEWAY)
///     .header("Content-Type", "text/plain")
///     .body(b"upstream unreachable".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the final Response.
    ///
    /// Adds a Content-Length header matching the body unless one was set.
    pub fn build(mut self) -> Response {
        if !self.headers.contains("Content-Length") {
            self.headers
                .append("Content-Length", self.body.len().to_string());
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// Plain-text error page that ends the client connection.
    pub fn error(status: StatusCode, detail: &str) -> Self {
        let body = format!("{} {}\n{}\n", status.as_u16(), status.reason_phrase(), detail);
        ResponseBuilder::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Connection", "close")
            .body(body.into_bytes())
            .build()
    }

    /// `502 Bad Gateway`
    pub fn bad_gateway() -> Self {
        Self::error(StatusCode::BAD_GATEWAY, "The upstream server could not be reached.")
    }

    /// `504 Gateway Timeout`
    pub fn gateway_timeout() -> Self {
        Self::error(
            StatusCode::GATEWAY_TIMEOUT,
            "The upstream server did not respond in time.",
        )
    }

    /// `500 Internal Server Error`
    pub fn internal_error() -> Self {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "The proxy failed to handle the request.")
    }
}
