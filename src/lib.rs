//! Ferry - single-hop HTTP/1.1 forwarding proxy
//!
//! Core library: wire-level HTTP handling, the upstream connection pool and
//! the per-request forwarding session.

pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
