//! # WebSocket Handlers
//!
//! The device-facing side of the transport bridge:
//! - Device connect: identifies the device, upgrades, and hands the
//!   connection to the lifecycle coordinator for its whole life
//! - Dial pickup: completes a pending dial with a freshly opened connection
//!   from the device that dial was sent to
//! - Session close: dials the device and delivers the close directive

use crate::connection::DeviceConnection;
use crate::error::BrokerResult;
use crate::state::AppState;
use crate::transport;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use tunnel_protocol::close_session_request;

// ─── Device Connect ─────────────────────────────────────────────

/// `GET /ssh/connection`: a device opens its persistent connection.
///
/// ## Flow:
/// 1. Identify the device from the request headers; reject with 400 on failure
/// 2. Upgrade to WebSocket and wrap the socket in a stream adapter
/// 3. Serve it through the coordinator until it closes
pub async fn connect_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> BrokerResult<Response> {
    let device_uid = state.coordinator.identify(&headers).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        let connection = DeviceConnection::new(device_uid, transport::into_adapter(socket));
        state.coordinator.serve(connection).await;
    }))
}

// ─── Dial Pickup ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PickupQuery {
    #[serde(rename = "revdial.dialer")]
    pub dialer: String,
}

/// `GET /ssh/revdial?revdial.dialer=<id>`: a device answers `conn-ready`.
///
/// The pickup must come from the device the dial was sent to: an
/// unidentified request gets 400, one from another device 403, and one for
/// a dial that is not pending 404, all before the upgrade.
pub async fn revdial_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<PickupQuery>,
    headers: HeaderMap,
) -> BrokerResult<Response> {
    let device_uid = state.coordinator.identify(&headers).await?;

    if !state.dialer.is_pending(&query.dialer) {
        debug!(dial = %query.dialer, "pickup for unknown dial");
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    if !state.dialer.is_pending_for(&query.dialer, &device_uid) {
        warn!(dial = %query.dialer, device = %device_uid, "pickup from the wrong device");
        return Ok(StatusCode::FORBIDDEN.into_response());
    }

    Ok(ws.on_upgrade(move |socket| async move {
        let adapter = transport::into_adapter(socket);
        // The dial may have given up while the upgrade was in flight.
        if let Err(orphan) = state.dialer.pickup(&query.dialer, adapter) {
            debug!(dial = %query.dialer, "dial gone before pickup");
            let _ = orphan.shutdown().await;
        }
    }))
}

// ─── Session Close ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CloseSessionRequest {
    pub device: String,
}

/// `POST /sessions/{uid}/close`: asks the device to end session `uid`.
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_uid): Path<String>,
    Json(request): Json<CloseSessionRequest>,
) -> BrokerResult<StatusCode> {
    let stream = state.dialer.dial(&request.device).await?;
    let directive = close_session_request(&session_uid);

    let written = stream.write(&directive).await;
    let _ = stream.close().await;
    written?;

    info!(device = %request.device, session = %session_uid, "session close delivered");
    Ok(StatusCode::OK)
}
