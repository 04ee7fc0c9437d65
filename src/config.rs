//! Runtime configuration.
//!
//! Settings come from an optional YAML file named by `FERRY_CONFIG`, then
//! environment variables override individual values. `PORT` and `TARGET`
//! keep the names the proxy has always been deployed with.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::proxy::target::Target;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address to accept clients on (`host:port`)
    pub listen_addr: String,
    /// Upstream base URL, e.g. `http://localhost:9200` or
    /// `https://search.internal`
    pub target: String,
    /// Total time budget for one proxied request
    pub session_timeout_ms: u64,
    /// How long in-flight requests may run after a shutdown signal
    pub shutdown_grace_ms: u64,
    /// How long an idle client keep-alive connection is kept open
    pub client_idle_timeout_ms: u64,
    /// Replay GET/HEAD/OPTIONS/TRACE once on a fresh connection when a reused
    /// pooled connection turns out to be dead
    pub retry_idempotent: bool,
    /// Add `X-Forwarded-*` headers to upstream requests
    pub forward_headers: bool,
    pub pool: PoolConfig,
    /// Applies to `https` targets only
    pub tls: UpstreamTlsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Bound on both idle and in-use connections per target
    pub max_size_per_target: usize,
    /// Idle connections older than this are evicted
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Period of the background eviction sweep
    pub sweep_interval_ms: u64,
}

/// How the proxy authenticates an `https` upstream.
///
/// # Example YAML
/// ```yaml
/// target: https://search.internal:9243
/// tls:
///   verify: true
///   ca_path: /etc/ferry/internal-ca.pem
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamTlsConfig {
    /// Check the upstream certificate chain and host name
    pub verify: bool,
    /// PEM bundle of trust anchors used instead of the bundled web PKI roots
    pub ca_path: Option<PathBuf>,
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            target: "http://localhost:9200".to_string(),
            session_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            client_idle_timeout_ms: 60_000,
            retry_idempotent: true,
            forward_headers: true,
            pool: PoolConfig::default(),
            tls: UpstreamTlsConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size_per_target: 50,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = match lookup("FERRY_CONFIG") {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_yaml(&contents)
                    .with_context(|| format!("failed to parse config file {path}"))?
            }
            None => Self::default(),
        };

        if let Some(port) = lookup("PORT") {
            let port: u16 = port.parse().with_context(|| format!("invalid PORT {port:?}"))?;
            cfg.listen_addr = format!("0.0.0.0:{port}");
        }
        if let Some(listen) = lookup("LISTEN") {
            cfg.listen_addr = listen;
        }
        if let Some(target) = lookup("TARGET") {
            cfg.target = target;
        }
        if let Some(ms) = lookup("FERRY_SESSION_TIMEOUT_MS") {
            cfg.session_timeout_ms = parse_number("FERRY_SESSION_TIMEOUT_MS", &ms)?;
        }
        if let Some(size) = lookup("FERRY_POOL_MAX_SIZE") {
            cfg.pool.max_size_per_target = parse_number("FERRY_POOL_MAX_SIZE", &size)?;
        }
        if let Some(ms) = lookup("FERRY_POOL_IDLE_TIMEOUT_MS") {
            cfg.pool.idle_timeout_ms = parse_number("FERRY_POOL_IDLE_TIMEOUT_MS", &ms)?;
        }
        if let Some(verify) = lookup("FERRY_TLS_VERIFY") {
            cfg.tls.verify = parse_number("FERRY_TLS_VERIFY", &verify)?;
        }
        if let Some(path) = lookup("FERRY_TLS_CA_PATH") {
            cfg.tls.ca_path = Some(PathBuf::from(path));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(contents)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.target()?;
        if self.listen_addr.is_empty() {
            bail!("listen_addr must not be empty");
        }
        if self.session_timeout_ms == 0 {
            bail!("session_timeout_ms must be greater than zero");
        }
        if self.pool.max_size_per_target == 0 {
            bail!("pool.max_size_per_target must be greater than zero");
        }
        if self.pool.connect_timeout_ms == 0 {
            bail!("pool.connect_timeout_ms must be greater than zero");
        }
        if self.pool.sweep_interval_ms == 0 {
            bail!("pool.sweep_interval_ms must be greater than zero");
        }
        if self.tls.ca_path.is_some() && !self.tls.verify {
            bail!("tls.ca_path has no effect with tls.verify disabled");
        }
        Ok(())
    }

    pub fn target(&self) -> Result<Target> {
        Target::parse(&self.target)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.client_idle_timeout_ms)
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid {key} {value:?}"))
}
