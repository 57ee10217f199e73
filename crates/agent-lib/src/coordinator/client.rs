//! HTTP client for the coordinator, usable as both bus and store

use super::{ClaimRequest, ClaimResponse, DeleteResponse, KeyList, SubscribeResponse, MAX_POLL_MS};
use crate::bus::{BusError, EventBus, Subscription};
use crate::events::{Channel, Envelope};
use crate::store::{CoordinationStore, StoreError, StoredEntry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Default timeout for non-polling requests
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct WireError(String);

impl From<reqwest::Error> for WireError {
    fn from(e: reqwest::Error) -> Self {
        WireError(e.to_string())
    }
}

impl From<WireError> for BusError {
    fn from(e: WireError) -> Self {
        BusError::Transport(e.0)
    }
}

impl From<WireError> for StoreError {
    fn from(e: WireError) -> Self {
        StoreError::Transport(e.0)
    }
}

async fn expect_success(response: Response) -> Result<Response, WireError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(WireError(format!("coordinator error ({}): {}", status, body)))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, WireError> {
    Ok(expect_success(response).await?.json().await?)
}

/// Client for a remote coordinator
#[derive(Clone)]
pub struct RemoteCoordinator {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl RemoteCoordinator {
    /// Create a client for the coordinator at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        let base_url = Url::parse(base_url).context("Invalid coordinator URL")?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Invalid coordinator URL: {}", base_url);
        }

        Ok(Self {
            client,
            base_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, WireError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| WireError(format!("invalid base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Check the coordinator answers its health probe
    pub async fn health(&self) -> Result<()> {
        self.probe()
            .await
            .map_err(|e| anyhow::anyhow!("Coordinator unreachable: {}", e.0))
    }

    async fn probe(&self) -> Result<(), WireError> {
        let response = self
            .client
            .get(self.endpoint(&["healthz"])?)
            .timeout(self.request_timeout)
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for RemoteCoordinator {
    async fn publish(&self, channel: Channel, envelope: Envelope) -> Result<(), BusError> {
        let url = self.endpoint(&["v1", "channels", channel.as_str(), "events"])?;
        let response = self
            .client
            .post(url)
            .json(&envelope)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;
        expect_success(response).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<Box<dyn Subscription>, BusError> {
        let url = self.endpoint(&["v1", "channels", channel.as_str(), "subscriptions"])?;
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;
        let subscribed: SubscribeResponse = read_json(response).await?;
        info!(
            subscription_id = %subscribed.subscription_id,
            channel = %channel,
            "Subscribed through coordinator"
        );

        Ok(Box::new(RemoteSubscription {
            coordinator: self.clone(),
            id: subscribed.subscription_id,
            channel,
        }))
    }
}

#[async_trait]
impl CoordinationStore for RemoteCoordinator {
    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl);
        }
        let request = ClaimRequest {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        };
        let response = self
            .client
            .post(self.endpoint(&["v1", "store", "claim"])?)
            .json(&request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;
        let claimed: ClaimResponse = read_json(response).await?;
        Ok(claimed.claimed)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let response = self
            .client
            .get(self.endpoint(&["v1", "store", "keys", key])?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(read_json(response).await?))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let response = self
            .client
            .get(self.endpoint(&["v1", "store", "keys"])?)
            .query(&[("prefix", prefix)])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;
        let list: KeyList = read_json(response).await?;
        Ok(list.keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let response = self
            .client
            .delete(self.endpoint(&["v1", "store", "keys", key])?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;
        let deleted: DeleteResponse = read_json(response).await?;
        Ok(deleted.deleted)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(self.probe().await?)
    }
}

/// Long-polling subscription held by the coordinator
pub struct RemoteSubscription {
    coordinator: RemoteCoordinator,
    id: String,
    channel: Channel,
}

#[async_trait]
impl Subscription for RemoteSubscription {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>, BusError> {
        let timeout_ms = (timeout.as_millis() as u64).clamp(1, MAX_POLL_MS);
        let url = self
            .coordinator
            .endpoint(&["v1", "subscriptions", self.id.as_str()])?;
        let response = self
            .coordinator
            .client
            .get(url)
            .query(&[("timeout_ms", timeout_ms)])
            .timeout(Duration::from_millis(timeout_ms) + self.coordinator.request_timeout)
            .send()
            .await
            .map_err(WireError::from)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(BusError::Closed(self.channel)),
            _ => Ok(Some(read_json(response).await?)),
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Ok(url) = self
            .coordinator
            .endpoint(&["v1", "subscriptions", self.id.as_str()])
        else {
            return;
        };
        let client = self.coordinator.client.clone();
        let id = self.id.clone();
        handle.spawn(async move {
            if let Err(e) = client.delete(url).send().await {
                debug!(subscription_id = %id, error = %e, "Failed to close remote subscription");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejects_invalid_url() {
        assert!(RemoteCoordinator::new("not a url").is_err());
        assert!(RemoteCoordinator::new("mailto:ops@example.com").is_err());
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let remote = RemoteCoordinator::new("http://coordinator:7400/").unwrap();
        let url = remote
            .endpoint(&["v1", "store", "keys", "cooldown:team/api"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://coordinator:7400/v1/store/keys/cooldown:team%2Fapi"
        );
    }

    #[tokio::test]
    async fn test_claim_over_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/store/claim")
            .match_body(mockito::Matcher::PartialJson(
                json!({"key": "cooldown:db-1", "ttl_ms": 60000}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"claimed":true}"#)
            .create_async()
            .await;

        let remote = RemoteCoordinator::new(&server.url()).unwrap();
        let claimed = remote
            .claim("cooldown:db-1", "{}", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(claimed);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/store/keys/cooldown:none")
            .with_status(404)
            .with_body(r#"{"error":"no such key"}"#)
            .create_async()
            .await;

        let remote = RemoteCoordinator::new(&server.url()).unwrap();
        assert!(remote.get("cooldown:none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex("^/v1/store/keys".to_string()))
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let remote = RemoteCoordinator::new(&server.url()).unwrap();
        assert!(matches!(
            remote.keys("dedup:").await,
            Err(StoreError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_gone_maps_to_closed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/channels/health_alert/subscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"subscription_id":"health_alert-1","channel":"health_alert"}"#)
            .create_async()
            .await;
        server
            .mock(
                "GET",
                mockito::Matcher::Regex("^/v1/subscriptions/health_alert-1".to_string()),
            )
            .with_status(410)
            .create_async()
            .await;

        let remote = RemoteCoordinator::new(&server.url()).unwrap();
        let mut sub = remote.subscribe(Channel::HealthAlert).await.unwrap();
        assert!(matches!(
            sub.recv(Duration::from_millis(10)).await,
            Err(BusError::Closed(Channel::HealthAlert))
        ));
    }
}
