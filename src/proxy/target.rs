//! The fixed upstream the proxy forwards to.

use std::fmt;

use anyhow::{Context, Result, bail};
use url::Url;

/// Upstream origin plus an optional path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
    /// `https` target; connections are wrapped in TLS
    tls: bool,
    /// Path prefix prepended to every forwarded request, without a trailing
    /// slash ("" for none)
    base_path: String,
}

impl Target {
    /// Parses an upstream URL such as `http://localhost:9200`,
    /// `http://10.0.0.5:8080/api` or `https://search.internal`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid target URL {raw:?}"))?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => bail!("unsupported target scheme {other:?}"),
        };
        if url.query().is_some() || url.fragment().is_some() {
            bail!("target URL must not carry a query or fragment: {url}");
        }

        let host = url.host_str().context("target URL missing host")?.to_string();
        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            host,
            port,
            tls,
            base_path,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    fn default_port(&self) -> u16 {
        if self.tls { 443 } else { 80 }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the upstream `Host` header; the default port is omitted.
    pub fn authority(&self) -> String {
        if self.port == self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Upstream request target for a client path in origin form.
    pub fn request_path(&self, path: &str) -> String {
        if self.base_path.is_empty() {
            return path.to_string();
        }
        format!("{}{path}", self.base_path)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme(), self.authority(), self.base_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_includes_non_default_port() {
        let target = Target::parse("http://localhost:9200").unwrap();
        assert_eq!(target.authority(), "localhost:9200");
        assert_eq!(target.addr(), "localhost:9200");

        let target = Target::parse("http://example.com").unwrap();
        assert_eq!(target.authority(), "example.com");
        assert_eq!(target.addr(), "example.com:80");
    }

    #[test]
    fn base_path_is_prepended() {
        let target = Target::parse("http://localhost:9200/api/").unwrap();
        assert_eq!(target.request_path("/items?x=1"), "/api/items?x=1");
        assert_eq!(target.request_path("/"), "/api/");

        let target = Target::parse("http://localhost:9200").unwrap();
        assert_eq!(target.request_path("/items?x=1"), "/items?x=1");
    }

    #[test]
    fn https_targets_default_to_443() {
        let target = Target::parse("https://search.internal/api").unwrap();
        assert!(target.is_tls());
        assert_eq!(target.addr(), "search.internal:443");
        assert_eq!(target.authority(), "search.internal");
        assert_eq!(target.to_string(), "https://search.internal/api");

        let target = Target::parse("https://search.internal:80").unwrap();
        assert_eq!(target.authority(), "search.internal:80");
    }

    #[test]
    fn other_schemes_are_rejected() {
        assert!(Target::parse("ws://localhost:9200").is_err());
    }
}
