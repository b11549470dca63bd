//! # Transport Layer
//!
//! Byte-stream plumbing around the protocol.
//!
//! ## Components
//! - **TLS**: optional rustls wrapping of controller/agent TCP connections
//! - **Admin**: loopback channel (TCP or unix socket) for queueing commands
//!
//! Plain TCP needs no module of its own; `tokio::net` streams are used directly.

pub mod admin;
pub mod tls;
