//! vdagent - session agent and system daemon for a guest display channel.
//!
//! A privileged daemon owns the hypervisor's virtio port and serves session
//! agents over a Unix domain socket. Agents carry clipboard, display and
//! file-transfer traffic for their desktop session.
//!
//! # Modules
//!
//! - [`socket`] - framed Unix socket transport (server, client, event loops)
//! - [`dispatch`] - routes daemon messages to session collaborators
//! - [`agent`] - agent lifecycle: connect, serve, reconnect, restart
//! - [`daemon`] - daemon-side connection handler and run loops
//! - [`config`] - configuration loading/saving

pub mod agent;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod socket;

pub use agent::{Agent, AgentExit};
pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::TransportError;

/// Version announced by the daemon and checked by the agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
