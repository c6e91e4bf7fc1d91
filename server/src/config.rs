//! # Configuration
//!
//! Command-line flags with `SSH_`-prefixed environment fallbacks, matching
//! how the platform's other services are deployed. [`Config`] is what the
//! binary parses; [`BrokerConfig`] is the subset the broker itself needs.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tunnel_protocol::{CONNECTION_PATH, DIALER_PATH};

/// tunnel-broker: reverse-tunnel connection broker
#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-broker", version, about = "Reverse-tunnel connection broker")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "SSH_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Base URL of the platform's internal API
    #[arg(long, env = "SSH_API_URL", default_value = "http://api:8080")]
    pub api_url: String,

    /// Seconds a dial waits for the device to pick up
    #[arg(long, env = "SSH_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Seconds between keep-alive writes and heartbeat callbacks
    #[arg(long, env = "SSH_KEEPALIVE_INTERVAL", default_value_t = 30)]
    pub keepalive_interval: u64,

    /// Path devices open their persistent connection on
    #[arg(long, env = "SSH_CONNECTION_PATH", default_value = CONNECTION_PATH)]
    pub connection_path: String,

    /// Path devices open pickup connections on
    #[arg(long, env = "SSH_DIALER_PATH", default_value = DIALER_PATH)]
    pub dialer_path: String,

    /// Log filter, used when RUST_LOG is unset
    #[arg(long, env = "SSH_LOG_LEVEL", default_value = "tunnel_broker=info")]
    pub log_level: String,
}

impl Config {
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            connection_path: self.connection_path.clone(),
            dialer_path: self.dialer_path.clone(),
            dial_timeout: Duration::from_secs(self.connect_timeout),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
        }
    }
}

/// Runtime settings of the broker core.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub connection_path: String,
    pub dialer_path: String,
    pub dial_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connection_path: CONNECTION_PATH.to_string(),
            dialer_path: DIALER_PATH.to_string(),
            dial_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}
