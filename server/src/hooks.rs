//! # Capabilities
//!
//! The broker reaches the rest of the platform only through these traits:
//! - [`Identifier`]: maps an inbound connection to a device UID
//! - [`CloseNotifier`]: told once when a device connection is torn down
//! - [`KeepAliveNotifier`]: told periodically while a device is connected
//! - [`PublicUrlResolver`]: maps a public URL address to a device
//!
//! [`crate::internal_client::InternalClient`] implements the last three
//! against the internal API; tests plug in their own.

use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;
use tunnel_protocol::DEVICE_UID_HEADER;

#[async_trait]
pub trait Identifier: Send + Sync {
    async fn identify(&self, headers: &HeaderMap) -> BrokerResult<String>;
}

#[async_trait]
pub trait CloseNotifier: Send + Sync {
    async fn device_offline(&self, device_uid: &str);
}

#[async_trait]
pub trait KeepAliveNotifier: Send + Sync {
    async fn device_heartbeat(&self, device_uid: &str) -> BrokerResult<()>;
}

/// A device as seen through its public URL address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublicDevice {
    pub uid: String,
    #[serde(default)]
    pub public_url: bool,
}

#[async_trait]
pub trait PublicUrlResolver: Send + Sync {
    async fn resolve(&self, address: &str) -> BrokerResult<PublicDevice>;
}

/// The lifecycle callbacks of one broker.
#[derive(Clone)]
pub struct Hooks {
    pub identifier: Arc<dyn Identifier>,
    pub on_close: Arc<dyn CloseNotifier>,
    pub on_keepalive: Arc<dyn KeepAliveNotifier>,
}

impl Hooks {
    pub fn new(
        identifier: Arc<dyn Identifier>,
        on_close: Arc<dyn CloseNotifier>,
        on_keepalive: Arc<dyn KeepAliveNotifier>,
    ) -> Self {
        Self {
            identifier,
            on_close,
            on_keepalive,
        }
    }
}

/// Reads the device UID from the `X-Device-UID` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderIdentifier;

#[async_trait]
impl Identifier for HeaderIdentifier {
    async fn identify(&self, headers: &HeaderMap) -> BrokerResult<String> {
        let value = headers
            .get(DEVICE_UID_HEADER)
            .ok_or_else(|| BrokerError::Identification(format!("missing {DEVICE_UID_HEADER} header")))?;
        let uid = value
            .to_str()
            .map_err(|_| BrokerError::Identification(format!("{DEVICE_UID_HEADER} is not valid text")))?
            .trim();

        if uid.is_empty() {
            return Err(BrokerError::Identification(format!("empty {DEVICE_UID_HEADER} header")));
        }
        Ok(uid.to_owned())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn header_identifier_reads_the_device_uid() {
        let mut headers = HeaderMap::new();
        headers.insert(DEVICE_UID_HEADER, HeaderValue::from_static(" 3f2a9c "));

        assert_eq!(HeaderIdentifier.identify(&headers).await.unwrap(), "3f2a9c");
    }

    #[tokio::test]
    async fn missing_or_empty_header_is_rejected() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            HeaderIdentifier.identify(&headers).await,
            Err(BrokerError::Identification(_))
        ));

        headers.insert(DEVICE_UID_HEADER, HeaderValue::from_static(""));
        assert!(matches!(
            HeaderIdentifier.identify(&headers).await,
            Err(BrokerError::Identification(_))
        ));
    }
}
