//! # Internal API Client
//!
//! Reports device lifecycle events to the platform's internal API and
//! resolves public URL addresses:
//! - `POST /internal/devices/{uid}/offline` when a connection is torn down
//! - `POST /internal/devices/{uid}/heartbeat` on every keep-alive tick
//! - `GET /internal/devices/public/{address}` for HTTP bridging

use crate::error::{BrokerError, BrokerResult};
use crate::hooks::{CloseNotifier, HeaderIdentifier, Hooks, KeepAliveNotifier, PublicDevice, PublicUrlResolver};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct InternalClient {
    http: reqwest::Client,
    base: Url,
}

impl InternalClient {
    pub fn new(base_url: &str) -> BrokerResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| BrokerError::BadRequest(format!("invalid api url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(BrokerError::BadRequest(format!("invalid api url {base_url}")));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    /// Lifecycle hooks backed by this client, identifying devices by header.
    pub fn hooks(self: &Arc<Self>) -> Hooks {
        Hooks::new(Arc::new(HeaderIdentifier), self.clone(), self.clone())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post_device_event(&self, device_uid: &str, event: &str) -> BrokerResult<()> {
        self.http
            .post(self.endpoint(&["internal", "devices", device_uid, event]))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl CloseNotifier for InternalClient {
    async fn device_offline(&self, device_uid: &str) {
        if let Err(e) = self.post_device_event(device_uid, "offline").await {
            error!(device = %device_uid, error = %e, "failed to mark device offline");
        }
    }
}

#[async_trait]
impl KeepAliveNotifier for InternalClient {
    async fn device_heartbeat(&self, device_uid: &str) -> BrokerResult<()> {
        self.post_device_event(device_uid, "heartbeat").await
    }
}

#[async_trait]
impl PublicUrlResolver for InternalClient {
    async fn resolve(&self, address: &str) -> BrokerResult<PublicDevice> {
        let response = self
            .http
            .get(self.endpoint(&["internal", "devices", "public", address]))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BrokerError::PublicUrlDisabled(address.to_owned()));
        }
        Ok(response.error_for_status()?.json().await?)
    }
}
