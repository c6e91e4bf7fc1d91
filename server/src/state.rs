//! # Server State
//!
//! Holds the shared application state of the broker:
//! - **Connection registry**: maps device UIDs to their active connection
//! - **Reverse dialer**: opens virtual streams and tracks pending dials
//! - **Lifecycle coordinator**: serves device connections until they close
//! - **Public URL resolver**: maps public addresses to devices for HTTP bridging
//!
//! The registry is shared by the dialer and the coordinator, so a device
//! becomes dialable the moment the coordinator activates it.

use crate::config::BrokerConfig;
use crate::dialer::ReverseDialer;
use crate::hooks::{Hooks, PublicUrlResolver};
use crate::lifecycle::LifecycleCoordinator;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: BrokerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub dialer: Arc<ReverseDialer>,
    pub coordinator: Arc<LifecycleCoordinator>,
    pub resolver: Arc<dyn PublicUrlResolver>,
}

impl AppState {
    pub fn new(config: BrokerConfig, hooks: Hooks, resolver: Arc<dyn PublicUrlResolver>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dialer = Arc::new(ReverseDialer::new(
            registry.clone(),
            config.dialer_path.clone(),
            config.dial_timeout,
        ));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            registry.clone(),
            hooks,
            config.keepalive_interval,
        ));

        Self {
            config,
            registry,
            dialer,
            coordinator,
            resolver,
        }
    }
}
