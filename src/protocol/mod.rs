//! # Protocol Layer
//!
//! Message model, session handshake and post-authentication routing.
//!
//! ## Components
//! - **Message**: `Envelope` + closed `Message` union, JSON on the wire
//! - **Handshake**: Register/Hello/Auth state machine (server) and its client driver
//! - **Router**: per-kind handlers for authenticated traffic (OTP, logs)
//!
//! ## Rules
//! - Nothing but `register`, `hello` and `auth` is processed before authentication
//! - Replies echo the request id; server pushes carry none

pub mod handshake;
pub mod message;
pub mod router;

#[cfg(test)]
mod tests;
