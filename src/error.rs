//! # Error Types
//!
//! Error handling for the control channel.
//!
//! Every failure is local to the component that detects it and is translated into
//! a closed connection, a failure reply, or an error returned to the caller.
//!
//! ## Error Categories
//! - **Transport**: connect/read/write failures. Clients retry, servers drop the connection
//! - **Protocol**: bad frame length, decryption failure, malformed JSON. Fatal to the connection
//! - **Auth**: handshake incomplete or key mismatch. The message is rejected, the connection stays open
//! - **Timeout**: no response within the request deadline
//! - **Persistence**: identity store write failed. Logged, the in-memory update stands
//!
//! ## Example Usage
//! ```rust
//! use control_channel::error::{ChannelError, Result};
//!
//! fn parse_length(header: &[u8]) -> Result<u32> {
//!     let bytes: [u8; 4] = header
//!         .try_into()
//!         .map_err(|_| ChannelError::Protocol("short header".into()))?;
//!     Ok(u32::from_be_bytes(bytes))
//! }
//!
//! assert!(parse_length(&[0, 0, 0, 8]).is_ok());
//! assert!(parse_length(&[0, 0]).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Cipher errors
    pub const ERR_CIPHERTEXT_TOO_SHORT: &str = "Ciphertext shorter than one IV block";
    pub const ERR_INVALID_KEY_LENGTH: &str = "Key material must be at least 16 bytes";
    pub const ERR_RANDOM_SOURCE: &str = "System random source unavailable";
    pub const ERR_INVALID_BASE64: &str = "Field is not valid base64";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "Not connected";
    pub const ERR_DISPATCHER_STOPPED: &str = "Request dispatcher stopped";
    pub const ERR_WRITER_STOPPED: &str = "Connection writer stopped";

    /// Handshake errors
    pub const ERR_NOT_AUTHENTICATED: &str = "Handshake not complete";
    pub const ERR_IDENTITY_MISMATCH: &str = "Identity does not match this session";
    pub const ERR_ALREADY_AUTHENTICATED: &str = "Session already authenticated";
    pub const ERR_NO_KEY: &str = "No session key available";
    pub const ERR_UNEXPECTED_REPLY: &str = "Unexpected reply type";

    /// Store errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_UNKNOWN_IDENTITY: &str = "Unknown identity";
}

/// Primary error type for every control-channel operation
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Identity not registered")]
    NotRegistered,

    #[error("Request timed out")]
    Timeout,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl ChannelError {
    /// Whether this error ends the session it occurred on.
    ///
    /// Auth, timeout and persistence failures are reported to the caller but leave
    /// the connection usable.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_)
                | ChannelError::Json(_)
                | ChannelError::Transport(_)
                | ChannelError::ConnectionClosed
                | ChannelError::Protocol(_)
                | ChannelError::OversizedFrame(_)
                | ChannelError::Crypto(_)
        )
    }

    /// Whether a client should reconnect and try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_)
                | ChannelError::Transport(_)
                | ChannelError::ConnectionClosed
                | ChannelError::Timeout
                | ChannelError::Tls(_)
        ) || self.is_fatal_to_connection()
    }
}

/// Type alias for Results using ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;
