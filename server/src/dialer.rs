//! # Reverse Dialer
//!
//! Opens new virtual streams to a device through its registered connection.
//!
//! ## Handshake
//! 1. Look up the device; fail fast with `NotConnected` if it is not active
//! 2. Record a pending dial under a fresh dial id
//! 3. Write `conn-ready` over the device connection, pointing the device at
//!    `<dialer path>?revdial.dialer=<dial id>`
//! 4. The device opens that connection; the bridge hands it to
//!    [`ReverseDialer::pickup`], which completes the waiting dial
//!
//! Steps 3 and 4 together race caller cancellation, the dial timeout and
//! the device connection closing; a handshake write that never completes
//! is bounded like a pickup that never arrives. The pending entry is owned
//! by a guard, so every exit path removes it. Dials never retry.

use crate::error::{BrokerError, BrokerResult};
use crate::registry::ConnectionRegistry;
use crate::stream::VirtualStream;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnel_protocol::{ControlMessage, WsConnAdapter, DIAL_QUERY_PARAM};
use uuid::Uuid;

struct PendingDial {
    device_uid: String,
    sender: oneshot::Sender<WsConnAdapter>,
}

/// Removes a pending dial when the dial future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingDial>,
    dial_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.dial_id);
    }
}

pub struct ReverseDialer {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<String, PendingDial>,
    dialer_path: String,
    timeout: Duration,
}

impl ReverseDialer {
    pub fn new(registry: Arc<ConnectionRegistry>, dialer_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            dialer_path: dialer_path.into(),
            timeout,
        }
    }

    /// Dials `device_uid`, bounded by the configured timeout.
    pub async fn dial(&self, device_uid: &str) -> BrokerResult<VirtualStream> {
        self.dial_with_cancel(device_uid, &CancellationToken::new())
            .await
    }

    /// Like [`dial`](Self::dial), but also gives up with
    /// [`BrokerError::Cancelled`] when `cancel` fires.
    pub async fn dial_with_cancel(
        &self,
        device_uid: &str,
        cancel: &CancellationToken,
    ) -> BrokerResult<VirtualStream> {
        let parent = self
            .registry
            .lookup(device_uid)
            .filter(|conn| conn.is_active())
            .ok_or_else(|| BrokerError::NotConnected(device_uid.to_owned()))?;

        let dial_id = Uuid::new_v4().simple().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            dial_id.clone(),
            PendingDial {
                device_uid: device_uid.to_owned(),
                sender,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            dial_id: &dial_id,
        };

        let conn_path = format!("{}?{}={}", self.dialer_path, DIAL_QUERY_PARAM, dial_id);
        let handshake = async {
            if let Err(e) = parent
                .send_control(&ControlMessage::ConnReady { conn_path })
                .await
            {
                warn!(device = %device_uid, dial = %dial_id, error = %e, "dial handshake write failed");
                parent.abort();
                return Err(BrokerError::from(e));
            }
            debug!(device = %device_uid, dial = %dial_id, "dial handshake sent");
            receiver.await.map_err(|_| BrokerError::ParentClosed)
        };

        // The deadline covers the handshake write as well as the wait.
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            _ = parent.closed() => Err(BrokerError::ParentClosed),
            _ = tokio::time::sleep(self.timeout) => {
                warn!(device = %device_uid, dial = %dial_id, "dial handshake timed out");
                Err(BrokerError::DialTimeout(self.timeout))
            }
            picked = handshake => picked,
        }?;

        debug!(device = %device_uid, dial = %dial_id, "dial picked up");
        Ok(VirtualStream::new(
            dial_id.clone(),
            device_uid.to_owned(),
            transport,
            parent.shutdown_token(),
        ))
    }

    /// Whether `dial_id` names a dial still waiting for its pickup.
    pub fn is_pending(&self, dial_id: &str) -> bool {
        self.pending.contains_key(dial_id)
    }

    /// Whether `dial_id` is waiting for a pickup from `device_uid`.
    pub fn is_pending_for(&self, dial_id: &str, device_uid: &str) -> bool {
        self.pending
            .get(dial_id)
            .is_some_and(|dial| dial.device_uid == device_uid)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Completes the dial waiting on `dial_id` with `transport`.
    ///
    /// Hands the transport back when no such dial is waiting anymore, so
    /// the caller can shut it down.
    pub fn pickup(&self, dial_id: &str, transport: WsConnAdapter) -> Result<(), WsConnAdapter> {
        let Some((_, pending)) = self.pending.remove(dial_id) else {
            return Err(transport);
        };
        debug!(device = %pending.device_uid, dial = %dial_id, "pickup arrived");
        pending.sender.send(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DeviceConnection;
    use bytes::Bytes;
    use futures::{Sink, StreamExt};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio_util::codec::{FramedRead, LinesCodec};
    use tunnel_protocol::control_lines;
    use tunnel_protocol::memory::{pipe, MemoryEnd};

    struct Device {
        control: FramedRead<WsConnAdapter, LinesCodec>,
    }

    impl Device {
        /// Reads control lines until the next `conn-ready` and returns its
        /// dial id.
        async fn next_dial(&mut self) -> String {
            loop {
                let line = self
                    .control
                    .next()
                    .await
                    .expect("control connection closed")
                    .unwrap();
                if let ControlMessage::ConnReady { conn_path } = ControlMessage::decode(line.as_bytes()).unwrap() {
                    let query = format!("{DIAL_QUERY_PARAM}=");
                    return conn_path.split_once(&query).unwrap().1.to_owned();
                }
            }
        }
    }

    /// A device transport whose writes never complete.
    struct StalledWriter;

    impl Sink<Bytes> for StalledWriter {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _payload: Bytes) -> io::Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn stalled_setup(timeout: Duration) -> (ReverseDialer, Arc<DeviceConnection>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let transport = WsConnAdapter::new(futures::stream::pending::<io::Result<Bytes>>(), StalledWriter);
        let conn = DeviceConnection::new("dev-1", transport);
        registry.register(conn.clone());
        assert!(conn.activate());
        (ReverseDialer::new(registry, "/ssh/revdial", timeout), conn)
    }

    fn setup(timeout: Duration) -> (Arc<ConnectionRegistry>, ReverseDialer, Arc<DeviceConnection>, Device) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (server, device) = pipe();
        let conn = DeviceConnection::new("dev-1", server.into_adapter());
        registry.register(conn.clone());
        assert!(conn.activate());

        let dialer = ReverseDialer::new(registry.clone(), "/ssh/revdial", timeout);
        let device = Device {
            control: control_lines(device.into_adapter()),
        };
        (registry, dialer, conn, device)
    }

    /// Opens the pickup pair: the server end goes to the dialer, the device
    /// end is returned.
    fn pickup(dialer: &ReverseDialer, dial_id: &str) -> WsConnAdapter {
        let (server, device): (MemoryEnd, MemoryEnd) = pipe();
        assert!(dialer.pickup(dial_id, server.into_adapter()).is_ok());
        device.into_adapter()
    }

    #[tokio::test]
    async fn unknown_device_fails_fast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dialer = ReverseDialer::new(registry, "/ssh/revdial", Duration::from_secs(30));

        let result = tokio::time::timeout(Duration::from_millis(100), dialer.dial("unknown"))
            .await
            .expect("dial against an absent device must not block");
        assert!(matches!(result, Err(BrokerError::NotConnected(uid)) if uid == "unknown"));
    }

    #[tokio::test]
    async fn inactive_connection_is_not_dialable() {
        let (_registry, dialer, conn, _device) = setup(Duration::from_secs(30));
        conn.abort();

        assert!(matches!(dialer.dial("dev-1").await, Err(BrokerError::NotConnected(_))));
        assert_eq!(dialer.pending_count(), 0);
    }

    #[tokio::test]
    async fn dial_returns_a_stream_after_pickup() {
        let (_registry, dialer, _conn, mut device) = setup(Duration::from_secs(5));

        let (stream, device_side) = tokio::join!(dialer.dial("dev-1"), async {
            let dial_id = device.next_dial().await;
            pickup(&dialer, &dial_id)
        });
        let stream = stream.unwrap();
        assert_eq!(dialer.pending_count(), 0);

        stream.write(b"SSH-2.0-test\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = device_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SSH-2.0-test\r\n");

        device_side.write(b"SSH-2.0-device\r\n").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SSH-2.0-device\r\n");
    }

    #[tokio::test]
    async fn cancellation_releases_the_pending_dial() {
        let (registry, dialer, conn, mut device) = setup(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let (result, dial_id) = tokio::join!(dialer.dial_with_cancel("dev-1", &cancel), async {
            let dial_id = device.next_dial().await;
            assert!(dialer.is_pending(&dial_id));
            cancel.cancel();
            dial_id
        });

        assert!(matches!(result, Err(BrokerError::Cancelled)));
        assert!(!dialer.is_pending(&dial_id));
        assert_eq!(dialer.pending_count(), 0);

        // A late pickup is refused and handed back.
        let (late, _device_end) = pipe();
        assert!(dialer.pickup(&dial_id, late.into_adapter()).is_err());

        // The device connection is untouched and dialable again.
        assert!(conn.is_active());
        assert!(Arc::ptr_eq(&registry.lookup("dev-1").unwrap(), &conn));
        let (stream, _device_side) = tokio::join!(dialer.dial("dev-1"), async {
            let dial_id = device.next_dial().await;
            pickup(&dialer, &dial_id)
        });
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_dial_future_releases_the_pending_dial() {
        let (_registry, dialer, _conn, mut device) = setup(Duration::from_secs(30));

        let outcome = tokio::time::timeout(Duration::from_millis(50), dialer.dial("dev-1")).await;
        assert!(outcome.is_err());
        let dial_id = device.next_dial().await;
        assert!(!dialer.is_pending(&dial_id));
    }

    #[tokio::test]
    async fn unanswered_dial_times_out() {
        let (_registry, dialer, conn, _device) = setup(Duration::from_millis(30));

        let result = dialer.dial("dev-1").await;
        assert!(matches!(result, Err(BrokerError::DialTimeout(_))));
        assert_eq!(dialer.pending_count(), 0);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn parent_close_fails_waiting_dials_and_open_streams() {
        let (_registry, dialer, conn, mut device) = setup(Duration::from_secs(30));

        let (stream, device_side) = tokio::join!(dialer.dial("dev-1"), async {
            let dial_id = device.next_dial().await;
            pickup(&dialer, &dial_id)
        });
        let stream = stream.unwrap();

        let (waiting, _) = tokio::join!(dialer.dial("dev-1"), async {
            device.next_dial().await;
            conn.abort();
        });
        assert!(matches!(waiting, Err(BrokerError::ParentClosed)));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        let err = stream.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        drop(device_side);
    }

    #[tokio::test]
    async fn handshake_write_failure_is_a_transport_error() {
        let (_registry, dialer, conn, device) = setup(Duration::from_secs(30));
        drop(device);

        let result = dialer.dial("dev-1").await;
        assert!(matches!(result, Err(BrokerError::Transport(_))));
        assert!(!conn.is_active());
        assert_eq!(dialer.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_dials_complete_independently() {
        let (_registry, dialer, _conn, mut device) = setup(Duration::from_secs(5));

        let (first, second, _) = tokio::join!(dialer.dial("dev-1"), dialer.dial("dev-1"), async {
            let a = device.next_dial().await;
            let b = device.next_dial().await;
            // Answer in reverse order; neither dial waits on the other.
            let b_side = pickup(&dialer, &b);
            let a_side = pickup(&dialer, &a);
            (a_side, b_side)
        });

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.session_id(), second.session_id());
    }

    #[tokio::test]
    async fn stalled_handshake_write_still_times_out() {
        let (dialer, conn) = stalled_setup(Duration::from_millis(50));

        let result = tokio::time::timeout(Duration::from_secs(2), dialer.dial("dev-1"))
            .await
            .expect("dial must end at its own timeout");
        assert!(matches!(result, Err(BrokerError::DialTimeout(_))));
        assert_eq!(dialer.pending_count(), 0);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn stalled_handshake_write_honours_cancellation() {
        let (dialer, _conn) = stalled_setup(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), dialer.dial_with_cancel("dev-1", &cancel))
            .await
            .expect("a cancelled dial must not wait on the handshake write");
        assert!(matches!(result, Err(BrokerError::Cancelled)));
        assert_eq!(dialer.pending_count(), 0);
    }

    #[tokio::test]
    async fn pending_dials_belong_to_their_device() {
        let (_registry, dialer, _conn, mut device) = setup(Duration::from_secs(5));

        let (stream, _device_side) = tokio::join!(dialer.dial("dev-1"), async {
            let dial_id = device.next_dial().await;
            assert!(dialer.is_pending_for(&dial_id, "dev-1"));
            assert!(!dialer.is_pending_for(&dial_id, "dev-2"));
            pickup(&dialer, &dial_id)
        });
        assert!(stream.is_ok());
    }
}
