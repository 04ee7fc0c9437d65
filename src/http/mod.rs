//! HTTP/1.1 protocol implementation.
//!
//! This module holds everything the proxy needs to speak HTTP/1.1 on both of
//! its sides: parsing message heads, decoding and re-encoding bodies, and the
//! client connection loop with keep-alive support.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The client connection handler implementing the request state machine
//! - **`stream`**: Buffered transport shared by client and upstream connections
//! - **`parser`**: Parses request and response heads from byte buffers
//! - **`headers`**: Ordered, case-insensitive header collection
//! - **`body`**: Body framing rules and the streaming decoder and encoder
//! - **`request`**: HTTP request representation
//! - **`response`**: Status codes and response representation with builder pattern
//! - **`writer`**: Serializes message heads and proxy-generated responses
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for the next request head
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │    Proxying      │ ← Forward upstream, relay the response
//!        └──────┬───────────┘
//!               │ Response relayed
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closing → Closed
//! ```
//!
//! Malformed requests are answered directly from `Reading` and the connection
//! moves to `Closing`.

pub mod body;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod stream;
pub mod writer;
