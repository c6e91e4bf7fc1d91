//! # Device Connection
//!
//! One physical inbound transport from one device, plus the state the
//! broker keeps about it:
//! - **State**: `registering → active → closing → closed`, held in an atomic
//!   so any task can observe it without locking
//! - **Shutdown token**: cancelled the moment closing begins; every virtual
//!   stream dialed through this connection watches it
//! - **Last activity**: refreshed on every successful control write or read
//!
//! Only the lifecycle coordinator drives transitions. Anything else that
//! wants the connection gone calls [`DeviceConnection::abort`] and lets the
//! coordinator finish the teardown.

use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tunnel_protocol::{ControlMessage, WsConnAdapter};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Registering = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Registering,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

pub struct DeviceConnection {
    device_uid: String,
    id: Uuid,
    transport: WsConnAdapter,
    state: AtomicU8,
    shutdown: CancellationToken,
    connected_at: Instant,
    /// Milliseconds after `connected_at` of the last successful exchange.
    last_activity_ms: AtomicU64,
}

impl DeviceConnection {
    /// Creates a connection in the `registering` state.
    pub fn new(device_uid: impl Into<String>, transport: WsConnAdapter) -> Arc<Self> {
        Arc::new(Self {
            device_uid: device_uid.into(),
            id: Uuid::new_v4(),
            transport,
            state: AtomicU8::new(ConnectionState::Registering as u8),
            shutdown: CancellationToken::new(),
            connected_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        })
    }

    pub fn device_uid(&self) -> &str {
        &self.device_uid
    }

    /// Unique per physical connection; distinguishes reconnects of one device.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while dials may go through this connection.
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active && !self.shutdown.is_cancelled()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        self.connected_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Requests teardown. The coordinator serving this connection notices
    /// and runs it; calling this more than once is harmless.
    pub fn abort(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once closing has begun or [`abort`](Self::abort) was called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Writes one control message over the device's transport.
    pub async fn send_control(&self, message: &ControlMessage) -> io::Result<()> {
        let line = message.encode().map_err(io::Error::other)?;
        self.transport.write(&line).await?;
        self.touch();
        Ok(())
    }

    pub(crate) fn transport(&self) -> &WsConnAdapter {
        &self.transport
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `registering → active`. Fails if closing already began.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Registering as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `closing`. Exactly one caller ever gets `true`, and only
    /// that caller may run the teardown.
    pub(crate) fn begin_close(&self) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        if won {
            self.shutdown.cancel();
        }
        won
    }

    pub(crate) fn finish_close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::memory::pipe;

    fn connection() -> Arc<DeviceConnection> {
        let (local, _remote) = pipe();
        DeviceConnection::new("dev-1", local.into_adapter())
    }

    #[test]
    fn walks_the_state_machine() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Registering);
        assert!(!conn.is_active());

        assert!(conn.activate());
        assert!(conn.is_active());
        assert!(!conn.activate());

        assert!(conn.begin_close());
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.is_active());

        conn.finish_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.begin_close());
    }

    #[test]
    fn abort_deactivates_without_closing() {
        let conn = connection();
        conn.activate();
        conn.abort();

        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(!conn.is_active());
        assert!(conn.begin_close());
    }

    #[test]
    fn cannot_activate_after_close_began() {
        let conn = connection();
        assert!(conn.begin_close());
        assert!(!conn.activate());
    }

    #[tokio::test]
    async fn only_one_closer_wins() {
        let conn = connection();
        conn.activate();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.begin_close() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn control_writes_refresh_activity() {
        let (local, mut remote) = pipe();
        let conn = DeviceConnection::new("dev-1", local.into_adapter());

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.send_control(&ControlMessage::KeepAlive).await.unwrap();

        assert!(conn.last_activity() > conn.connected_at());
        let frame = futures::StreamExt::next(&mut remote.reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, "{\"command\":\"keep-alive\"}\n");
    }
}
