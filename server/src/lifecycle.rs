//! # Lifecycle Coordinator
//!
//! Owns every device connection from identification to teardown.
//!
//! ## Flow
//! 1. [`identify`](LifecycleCoordinator::identify) maps the inbound request
//!    to a device UID; failure rejects the connection before it is visible
//! 2. [`serve`](LifecycleCoordinator::serve) registers it, activates it and
//!    retires whatever connection it superseded
//! 3. While active: a ticker writes `keep-alive` and fires the heartbeat
//!    callback on its own task, and the control channel is read to notice
//!    the device leaving
//! 4. On EOF, transport error, abort or supersession:
//!    [`close`](LifecycleCoordinator::close) tears down exactly once
//!
//! Heartbeat callback failures are logged and otherwise ignored. At most one
//! heartbeat is in flight per connection; a tick that finds the previous one
//! still running skips it.

use crate::connection::DeviceConnection;
use crate::error::BrokerResult;
use crate::hooks::Hooks;
use crate::registry::ConnectionRegistry;
use axum::http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tunnel_protocol::ControlMessage;

/// How long teardown waits for the transport to close cleanly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The device closed its side.
    Eof,
    TransportError,
    /// A newer connection registered for the same device.
    Superseded,
    /// Closed locally through unregister or abort.
    Unregistered,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Eof => "eof",
            CloseReason::TransportError => "transport error",
            CloseReason::Superseded => "superseded",
            CloseReason::Unregistered => "unregistered",
        })
    }
}

pub struct LifecycleCoordinator {
    registry: Arc<ConnectionRegistry>,
    hooks: Hooks,
    keepalive_interval: Duration,
}

impl LifecycleCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, hooks: Hooks, keepalive_interval: Duration) -> Self {
        Self {
            registry,
            hooks,
            keepalive_interval,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Maps an inbound connection request to its device UID.
    pub async fn identify(&self, headers: &HeaderMap) -> BrokerResult<String> {
        self.hooks.identifier.identify(headers).await.inspect_err(|e| {
            warn!(error = %e, "rejecting unidentified connection");
        })
    }

    /// Registers `connection` and serves it until it closes.
    pub async fn serve(&self, connection: Arc<DeviceConnection>) {
        let device = connection.device_uid().to_owned();
        let previous = self.registry.register(connection.clone());

        if !connection.activate() {
            self.close(&connection, CloseReason::Unregistered).await;
            return;
        }
        info!(device = %device, conn = %connection.id(), "device connected");

        if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, &connection)) {
            self.close(&previous, CloseReason::Superseded).await;
        }

        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 1024];
        let mut heartbeat: Option<JoinHandle<()>> = None;

        let reason = loop {
            tokio::select! {
                _ = connection.closed() => break CloseReason::Unregistered,
                _ = ticker.tick() => {
                    if let Err(e) = connection.send_control(&ControlMessage::KeepAlive).await {
                        debug!(device = %device, error = %e, "keep-alive write failed");
                        break CloseReason::TransportError;
                    }
                    if heartbeat.as_ref().map_or(true, JoinHandle::is_finished) {
                        heartbeat = Some(self.spawn_heartbeat(&device));
                    }
                }
                read = connection.transport().read(&mut buf) => match read {
                    Ok(0) => break CloseReason::Eof,
                    // Devices send nothing we act on; reading just notices them leave.
                    Ok(_) => connection.touch(),
                    Err(e) => {
                        debug!(device = %device, error = %e, "device transport failed");
                        break CloseReason::TransportError;
                    }
                },
            }
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        self.close(&connection, reason).await;
    }

    fn spawn_heartbeat(&self, device: &str) -> JoinHandle<()> {
        let notifier = self.hooks.on_keepalive.clone();
        let device = device.to_owned();
        tokio::spawn(async move {
            if let Err(e) = notifier.device_heartbeat(&device).await {
                warn!(device = %device, error = %e, "heartbeat callback failed");
            }
        })
    }

    /// Closes the active connection of `device_uid`, if there is one.
    pub async fn unregister(&self, device_uid: &str) -> bool {
        match self.registry.lookup(device_uid) {
            Some(connection) => self.close(&connection, CloseReason::Unregistered).await,
            None => false,
        }
    }

    /// Tears `connection` down. Only the first call for a connection does
    /// anything; it returns `true`.
    pub async fn close(&self, connection: &Arc<DeviceConnection>, reason: CloseReason) -> bool {
        if !connection.begin_close() {
            return false;
        }

        self.registry.unregister(connection);

        match tokio::time::timeout(SHUTDOWN_GRACE, connection.transport().shutdown()).await {
            Ok(Err(e)) => debug!(device = %connection.device_uid(), error = %e, "transport shutdown failed"),
            Err(_) => debug!(device = %connection.device_uid(), "transport shutdown timed out"),
            Ok(Ok(())) => {}
        }

        self.hooks
            .on_close
            .device_offline(connection.device_uid())
            .await;
        connection.finish_close();

        info!(
            device = %connection.device_uid(),
            conn = %connection.id(),
            reason = %reason,
            "device disconnected"
        );
        true
    }
}
