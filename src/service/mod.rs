//! # Service Layer
//!
//! Long-running actors built on the protocol layer.
//!
//! ## Controller side
//! - **Server**: listener, connection limit, TLS, graceful shutdown, PING broadcast
//! - **Supervisor**: one actor per framed connection with a single writer task
//! - **Legacy**: the same actor for the stream-delimited JSON mode, plus its client
//! - **Sessions**: which connection currently owns each identity
//!
//! ## Agent side
//! - **Agent**: reconnect loop and the calls an agent makes
//! - **Dispatcher**: id-correlated requests over one connection, pushes split off
//! - **IdentityCache**: credentials remembered between runs

pub mod agent;
pub mod dispatcher;
pub mod identity_cache;
pub mod legacy;
pub mod server;
pub mod sessions;
pub mod supervisor;

pub use agent::{Agent, LinkState};
pub use dispatcher::{DispatcherHandle, RequestDispatcher};
pub use identity_cache::IdentityCache;
pub use legacy::{LegacyClient, LegacySupervisor};
pub use server::ControlServer;
pub use sessions::SessionRegistry;
pub use supervisor::{ConnectionSupervisor, ServerContext, SupervisorSettings};
