//! # Tunnel Broker
//!
//! Lets a server reach devices sitting behind NAT. Each device keeps one
//! persistent WebSocket open to the broker; the broker dials back through it
//! to open as many virtual streams as it needs.
//!
//! - [`registry`]: device UID → active connection
//! - [`dialer`]: opens virtual streams over a registered connection
//! - [`lifecycle`]: identification, keep-alive and exactly-once teardown
//! - [`handlers`], [`forward`], [`api`]: the HTTP surface

pub mod api;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod hooks;
pub mod internal_client;
pub mod lifecycle;
pub mod registry;
pub mod state;
pub mod stream;
pub mod transport;

pub use config::{BrokerConfig, Config};
pub use connection::{ConnectionState, DeviceConnection};
pub use dialer::ReverseDialer;
pub use error::{BrokerError, BrokerResult};
pub use hooks::{CloseNotifier, HeaderIdentifier, Hooks, Identifier, KeepAliveNotifier, PublicDevice, PublicUrlResolver};
pub use internal_client::InternalClient;
pub use lifecycle::{CloseReason, LifecycleCoordinator};
pub use registry::ConnectionRegistry;
pub use state::AppState;
pub use stream::VirtualStream;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::cors::CorsLayer;

/// Builds the broker's HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.connection_path, get(handlers::connect_handler))
        .route(&state.config.dialer_path, get(handlers::revdial_handler))
        .route("/sessions/{uid}/close", post(handlers::close_session))
        .route("/ssh/http", any(forward::http_handler))
        .route("/api/devices", get(api::list_devices))
        .route("/healthcheck", get(api::healthcheck))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
