//! # REST API Endpoints
//!
//! Provides HTTP API endpoints for querying broker state.

use crate::connection::ConnectionState;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// Response item representing a single live device connection.
#[derive(Debug, Serialize)]
pub struct DeviceListItem {
    pub device_uid: String,
    pub state: ConnectionState,
    /// Seconds since the device connected.
    pub connected_secs: u64,
    /// Seconds since anything was last read from the device.
    pub idle_secs: u64,
}

/// `GET /api/devices`: Returns a JSON array of all live device connections.
pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceListItem>> {
    let mut devices: Vec<DeviceListItem> = state
        .registry
        .list()
        .into_iter()
        .map(|conn| DeviceListItem {
            device_uid: conn.device_uid().to_owned(),
            state: conn.state(),
            connected_secs: conn.connected_at().elapsed().as_secs(),
            idle_secs: conn.last_activity().elapsed().as_secs(),
        })
        .collect();
    devices.sort_by(|a, b| a.device_uid.cmp(&b.device_uid));
    Json(devices)
}

/// `GET /healthcheck`
pub async fn healthcheck() -> &'static str {
    "OK"
}
