//! Reverse proxy forwarding core
//!
//! This module implements the forwarding pipeline: upstream connection
//! pooling (with TLS for `https` targets), request relaying, response
//! relaying and the per-request session that ties them together.

pub mod downstream;
pub mod events;
pub mod outcome;
pub mod pool;
pub mod session;
pub mod target;
pub mod tls;
pub mod upstream;

pub use downstream::{RelayContext, Relayed, ResponseRelay, UpstreamResponse};
pub use events::{EventSink, SessionEvent, TracingSink};
pub use outcome::{Outcome, ProxyError};
pub use pool::{ConnState, ConnectionPool, PooledConnection, UpstreamConnection};
pub use session::{ProxySession, SessionReport, SessionState};
pub use target::Target;
pub use tls::{UpstreamStream, UpstreamTls};
pub use upstream::RequestRelay;
