//! # control-channel
//!
//! A controller accepts long-lived connections from remote agents, registers and
//! authenticates them, and pushes commands while receiving heartbeats, log lines and
//! OTP requests.
//!
//! ## Layers
//! - [`core`]: wire framing (length-prefixed encrypted frames, legacy JSON stream)
//! - [`protocol`]: message model, handshake state machine, request routing
//! - [`store`]: identity/key store and the pending-command queue
//! - [`service`]: controller and agent runtimes
//! - [`transport`]: TLS wrapping and the loopback admin channel
//! - [`utils`]: cipher provider, logging, metrics, timeouts
//!
//! ## Quick start
//! ```no_run
//! use control_channel::config::ControlConfig;
//! use control_channel::service::ControlServer;
//!
//! # async fn run() -> control_channel::error::Result<()> {
//! let config = ControlConfig::from_file("controller.toml")?;
//! ControlServer::new(config).await?.run().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod store;
pub mod transport;
pub mod utils;

pub use config::ControlConfig;
pub use error::{ChannelError, Result};
pub use protocol::message::{DeviceInfo, Envelope, Message};
pub use service::{Agent, ControlServer, LinkState};
