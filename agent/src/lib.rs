//! # Tunnel Agent
//!
//! The device side of the reverse tunnel. A device behind NAT opens one
//! persistent connection to the broker and receives every stream the broker
//! dials as an accepted [`WsConnAdapter`](tunnel_protocol::WsConnAdapter).

pub mod agent;
pub mod error;
pub mod transport;

pub use agent::{Agent, AgentConfig, Listener};
pub use error::AgentError;
