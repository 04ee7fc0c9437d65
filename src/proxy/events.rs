//! Per-request outcome events handed to an observability collaborator.

use std::time::Duration;

use crate::http::request::Method;
use crate::proxy::outcome::Outcome;

/// Everything known about a finished session.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub method: Method,
    /// Request target as the client sent it
    pub path: String,
    /// Upstream the request was forwarded to
    pub target: String,
    pub outcome: Outcome,
    /// Status relayed to the client, or the error status synthesized for it
    pub status: Option<u16>,
    /// Rendered cause for failed sessions
    pub error: Option<String>,
    pub duration: Duration,
}

/// Consumer of session events (logging, metrics).
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SessionEvent);
}

/// Logs every session through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &SessionEvent) {
        let elapsed_ms = event.duration.as_secs_f64() * 1000.0;
        match &event.error {
            None => tracing::info!(
                method = %event.method,
                path = %event.path,
                target = %event.target,
                outcome = event.outcome.kind(),
                status = event.status,
                elapsed_ms,
                "{} -> {}{}",
                event.method,
                event.target,
                event.path
            ),
            Some(error) => tracing::warn!(
                method = %event.method,
                path = %event.path,
                target = %event.target,
                outcome = event.outcome.kind(),
                status = event.status,
                elapsed_ms,
                error = %error,
                "request failed"
            ),
        }
    }
}
