//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, timing and metrics.
//!
//! ## Components
//! - **Crypto**: AES-128-CFB cipher provider and session key generation
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Metrics**: per-server atomic counters
//! - **Time**: unix-millisecond timestamps
//! - **Timeout**: async deadline wrappers and default durations
//!
//! ## Security
//! - IVs and session keys come from the OS random source (getrandom)
//! - Key material is zeroized when a cipher is dropped (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
