//! Server assembly: the explicit proxy value and its accept loop.

pub mod listener;
pub mod shutdown;

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::proxy::events::{EventSink, TracingSink};
use crate::proxy::pool::ConnectionPool;
use crate::proxy::target::Target;
use crate::proxy::tls::UpstreamTls;

pub use shutdown::{Shutdown, ShutdownSignal};

/// A configured proxy: the upstream target, the connection pool for it and
/// the sink that receives per-request events.
///
/// Built once at startup and shared with every connection through an `Arc`.
pub struct ProxyServer {
    config: Config,
    target: Target,
    pool: Arc<ConnectionPool>,
    sink: Arc<dyn EventSink>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let target = config.target()?;
        let mut pool = ConnectionPool::new(config.pool.clone());
        if target.is_tls() {
            pool = pool.with_tls(UpstreamTls::new(&config.tls)?);
        }
        let pool = Arc::new(pool);

        Ok(Self {
            config,
            target,
            pool,
            sink: Arc::new(TracingSink),
        })
    }

    /// Replaces the default `tracing` event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }
}
