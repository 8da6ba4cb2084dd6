//! Typed HTTP client for the Manager and Instance REST endpoints.

use std::time::Duration;

use adit_types::{
    definitions::RawRule, ChannelDescriptor, InstanceDescriptor, InstanceStatus, RuleDescriptor,
    VariableDescriptor,
};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure or request timeout.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    /// The endpoint answered with a non-200 status.
    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),
    /// The body did not decode as the expected shape.
    #[error("malformed response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// Client for the Manager REST API.
#[derive(Clone, Debug)]
pub struct ManagerClient {
    client: Client,
    base: String,
    timeout: Duration,
}

impl ManagerClient {
    /// `endpoint` is the Manager's `host:port`.
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base: format!("http://{endpoint}"),
            timeout,
        }
    }

    pub async fn channels(&self) -> Result<Vec<ChannelDescriptor>, ApiError> {
        self.get_json(&format!("{}/channels", self.base)).await
    }

    /// Manual messaging rules for a channel. Non-manual rules and rules
    /// whose embedded JSON does not decode are silently excluded.
    pub async fn rules(&self, channel_id: &str) -> Result<Vec<RuleDescriptor>, ApiError> {
        let raw: Vec<RawRule> = self
            .get_json(&format!("{}/channels/{channel_id}/messaging-rules", self.base))
            .await?;
        Ok(raw.iter().filter_map(RawRule::as_manual).collect())
    }

    pub async fn variables(&self, channel_id: &str) -> Result<Vec<VariableDescriptor>, ApiError> {
        self.get_json(&format!("{}/channels/{channel_id}/variables", self.base))
            .await
    }

    pub async fn instances(&self, channel_id: &str) -> Result<Vec<InstanceDescriptor>, ApiError> {
        self.get_json(&format!("{}/channels/{channel_id}/instances", self.base))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        let rsp = self.client.get(url).timeout(self.timeout).send().await?;
        if rsp.status() != StatusCode::OK {
            return Err(ApiError::Status(rsp.status()));
        }
        Ok(rsp.json().await?)
    }
}

/// One-shot status fetch against an Instance's API port.
pub async fn fetch_instance_status(
    client: &Client,
    host: &str,
    api_port: u16,
    timeout: Duration,
) -> Result<InstanceStatus, ApiError> {
    let rsp = client
        .get(format!("http://{host}:{api_port}/status"))
        .header(header::ACCEPT, "application/json")
        .timeout(timeout)
        .send()
        .await?;
    if rsp.status() != StatusCode::OK {
        return Err(ApiError::Status(rsp.status()));
    }
    Ok(rsp.json().await?)
}
