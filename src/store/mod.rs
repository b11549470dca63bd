//! # Shared Controller State
//!
//! Process-wide state mutated by every connection handler.
//!
//! - **Identity**: identities, session keys, authentication and liveness, persisted
//!   to a JSON file
//! - **Commands**: the single pending command per identity
//!
//! Both are constructed once at startup and injected into connection supervisors.

pub mod commands;
pub mod identity;

pub use commands::CommandQueue;
pub use identity::{IdentityRecord, IdentityStore};
