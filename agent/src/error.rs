use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The device UID cannot be sent as a header value.
    #[error("invalid device uid: {0:?}")]
    InvalidDeviceUid(String),
}
