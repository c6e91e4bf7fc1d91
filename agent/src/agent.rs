//! # Agent Connection Loop
//!
//! Keeps the device's persistent connection to the broker and turns the
//! broker's dials into accepted streams:
//! - Connects to the connection path with the device UID header
//! - Reads control lines; `keep-alive` is ignored, `conn-ready` opens a
//!   pickup connection on the path the broker named
//! - Hands every pickup connection to [`Listener::accept`]
//! - [`Agent::run`] reconnects forever after a fixed delay

use crate::error::AgentError;
use crate::transport;
use futures::StreamExt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, error, info, warn};
use tunnel_protocol::{control_lines, ControlMessage, WsConnAdapter, CONNECTION_PATH};

/// How long to wait before attempting to reconnect after a disconnect.
const RECONNECT_DELAY_SECS: u64 = 3;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base WebSocket URL of the broker, e.g. `ws://broker:8080`.
    pub server_url: String,
    pub device_uid: String,
}

pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn device_uid(&self) -> &str {
        &self.config.device_uid
    }

    /// Opens the persistent connection and starts answering dials.
    pub async fn connect(&self) -> Result<Listener, AgentError> {
        let base = self.config.server_url.trim_end_matches('/').to_owned();
        let control = transport::connect(&format!("{base}{CONNECTION_PATH}"), &self.config.device_uid).await?;
        info!(device = %self.config.device_uid, "connected to broker");

        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let task = tokio::spawn(control_loop(
            control,
            base,
            self.config.device_uid.clone(),
            incoming_tx,
        ));
        Ok(Listener { incoming, task })
    }

    /// Accepts streams forever, spawning `handler` for each one and
    /// reconnecting whenever the persistent connection drops.
    pub async fn run<F, Fut>(&self, handler: F)
    where
        F: Fn(WsConnAdapter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.connect().await {
                Ok(mut listener) => {
                    while let Some(stream) = listener.accept().await {
                        tokio::spawn(handler(stream));
                    }
                    warn!(device = %self.config.device_uid, "disconnected from broker");
                }
                Err(e) => error!(device = %self.config.device_uid, error = %e, "connection failed"),
            }

            info!("Reconnecting in {}s...", RECONNECT_DELAY_SECS);
            tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    }
}

/// Streams the broker dialed, in pickup order.
pub struct Listener {
    incoming: mpsc::UnboundedReceiver<WsConnAdapter>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Next dialed stream; `None` once the persistent connection is gone.
    pub async fn accept(&mut self) -> Option<WsConnAdapter> {
        self.incoming.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─── Control Loop ───────────────────────────────────────────────

async fn control_loop(
    control: WsConnAdapter,
    base: String,
    device_uid: String,
    incoming: mpsc::UnboundedSender<WsConnAdapter>,
) {
    let mut lines = control_lines(control);

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            // The codec skips ahead to the next newline.
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(device = %device_uid, "dropping oversized control line");
                continue;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(device = %device_uid, error = %e, "control read failed");
                break;
            }
        };

        match ControlMessage::decode(line.as_bytes()) {
            Ok(ControlMessage::KeepAlive) => debug!(device = %device_uid, "keep-alive"),
            Ok(ControlMessage::ConnReady { conn_path }) => {
                let url = format!("{base}{conn_path}");
                let device_uid = device_uid.clone();
                let incoming = incoming.clone();
                tokio::spawn(async move {
                    match transport::connect(&url, &device_uid).await {
                        Ok(stream) => {
                            let _ = incoming.send(stream);
                        }
                        Err(e) => warn!(device = %device_uid, error = %e, "pickup failed"),
                    }
                });
            }
            Ok(ControlMessage::Unknown) => {}
            Err(e) => warn!(device = %device_uid, error = %e, "malformed control line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::SinkExt;
    use std::time::Duration;
    use tunnel_protocol::memory::pipe;
    use tunnel_protocol::MAX_CONTROL_LINE;

    fn listener_over(control: WsConnAdapter) -> Listener {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let task = tokio::spawn(control_loop(
            control,
            "ws://127.0.0.1:1".into(),
            "dev-1".into(),
            incoming_tx,
        ));
        Listener { incoming, task }
    }

    #[tokio::test]
    async fn listener_ends_with_the_control_connection() {
        let (agent_end, mut broker_end) = pipe();
        let mut listener = listener_over(agent_end.into_adapter());

        for line in [
            ControlMessage::KeepAlive.encode().unwrap(),
            br#"{"command":"reboot"}"#.to_vec(),
            vec![b'x'; MAX_CONTROL_LINE + 1],
            b"\n".to_vec(),
        ] {
            broker_end.writer.send(Bytes::from(line)).await.unwrap();
        }
        broker_end.writer.close().await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .expect("listener should end");
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn failed_pickups_are_not_accepted() {
        let (agent_end, mut broker_end) = pipe();
        let mut listener = listener_over(agent_end.into_adapter());

        let ready = ControlMessage::ConnReady {
            conn_path: "/ssh/revdial?revdial.dialer=abc".into(),
        };
        broker_end
            .writer
            .send(Bytes::from(ready.encode().unwrap()))
            .await
            .unwrap();
        broker_end.writer.close().await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("listener should end");
        assert!(accepted.is_none());
    }
}
