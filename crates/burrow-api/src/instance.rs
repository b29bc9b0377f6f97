//! Instance provisioning service client.
//!
//! Talks to the small HTTP control plane that starts and stops the
//! remote compute instance acting as the tunnel exit. Authenticates
//! with a static API key.

use crate::client::{ApiClient, ApiError, AuthScheme};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;
use url::Url;

/// Remote instance lifecycle state, lowercase-normalized. Values the
/// service invents map to `Unknown`, never to a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

impl InstanceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => InstanceStatus::Pending,
            "running" => InstanceStatus::Running,
            "stopping" => InstanceStatus::Stopping,
            "stopped" => InstanceStatus::Stopped,
            "terminated" => InstanceStatus::Terminated,
            _ => InstanceStatus::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for InstanceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(InstanceStatus::parse(&raw))
    }
}

/// `POST /instance/start` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStartResponse {
    pub instance_id: String,
    pub public_ip: Option<String>,
    pub status: InstanceStatus,
}

/// `POST /instance/stop` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStopResponse {
    pub instance_id: String,
    pub status: InstanceStatus,
}

/// `GET /instance/status` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    instance_type: &'a str,
}

/// Client for the instance provisioning service.
#[derive(Debug, Clone)]
pub struct InstanceClient {
    api: ApiClient,
}

impl InstanceClient {
    pub fn new(endpoint: Url, api_key: String) -> Self {
        Self {
            api: ApiClient::new(endpoint, AuthScheme::ApiKey(api_key)),
        }
    }

    /// Start the remote instance, optionally requesting a specific
    /// instance type.
    pub async fn start(
        &self,
        instance_type: Option<&str>,
    ) -> Result<InstanceStartResponse, ApiError> {
        info!("Starting remote instance...");
        let response: InstanceStartResponse = match instance_type {
            Some(ty) => {
                self.api
                    .post_json("instance/start", Some(&StartRequest { instance_type: ty }))
                    .await?
            }
            None => self.api.post_json::<(), _>("instance/start", None).await?,
        };
        info!(
            "Instance started: {} ({:?})",
            response.instance_id,
            response.public_ip.as_deref().unwrap_or("no public IP")
        );
        Ok(response)
    }

    /// Stop the remote instance.
    pub async fn stop(&self) -> Result<InstanceStopResponse, ApiError> {
        info!("Stopping remote instance...");
        let response: InstanceStopResponse =
            self.api.post_json::<(), _>("instance/stop", None).await?;
        info!("Instance stopping: {}", response.instance_id);
        Ok(response)
    }

    /// Fetch the current instance state.
    pub async fn status(&self) -> Result<InstanceInfo, ApiError> {
        self.api.get_json("instance/status").await
    }
}
