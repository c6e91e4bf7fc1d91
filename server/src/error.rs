//! # Broker Errors
//!
//! A single error type for every broker operation. Dial and bridge errors
//! are returned synchronously to whoever invoked them; lifecycle errors stay
//! inside the coordinator, which logs them.
//!
//! [`BrokerError`] doubles as an axum response, so HTTP handlers can use `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No active connection exists for the device.
    #[error("device unavailable: {0} is not connected")]
    NotConnected(String),

    /// The caller cancelled the dial before the device picked up.
    #[error("dial cancelled")]
    Cancelled,

    /// The device did not pick up within the dial timeout.
    #[error("dial handshake timed out after {0:?}")]
    DialTimeout(Duration),

    /// The device connection closed underneath a dial or stream.
    #[error("device connection closed")]
    ParentClosed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// An inbound connection could not be mapped to a device.
    #[error("identification failed: {0}")]
    Identification(String),

    #[error("public URL unavailable for {0}")]
    PublicUrlDisabled(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The platform's internal API rejected or failed a call.
    #[error("internal api error: {0}")]
    Api(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::NotConnected(_) | BrokerError::ParentClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BrokerError::DialTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            BrokerError::Transport(_) | BrokerError::Api(_) => StatusCode::BAD_GATEWAY,
            BrokerError::Identification(_) | BrokerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::PublicUrlDisabled(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Api(err.to_string())
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string()
            }
        }));

        (self.status(), body).into_response()
    }
}
