//! Mesh coordinator client.
//!
//! The coordinator tracks participating nodes (their public keys and
//! mesh addresses) and hands out pre-auth credentials so a new node can
//! register without interactive login. Bearer-token auth throughout;
//! the unauthenticated `/health` endpoint doubles as the readiness
//! probe the orchestrator polls after instance start.

use crate::client::{ApiClient, ApiError, AuthScheme};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Health probes run on a short leash; the orchestrator polls them.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// A node known to the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub node_key: Option<String>,
    pub ip_addresses: Option<Vec<String>>,
}

/// An advertised route.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub machine_id: Option<String>,
    pub prefix: String,
    pub enabled: bool,
}

/// A registration credential issued by the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAuthKey {
    pub id: String,
    pub key: String,
    pub reusable: bool,
    pub ephemeral: bool,
    pub used: bool,
    pub expiration: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
struct MachinesResponse {
    machines: Vec<Machine>,
}

#[derive(Debug, Deserialize)]
struct RoutesResponse {
    routes: Vec<Route>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeyRequest<'a> {
    user: &'a str,
    reusable: bool,
    ephemeral: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeyResponse {
    pre_auth_key: PreAuthKey,
}

/// Client for the mesh coordinator service.
#[derive(Debug, Clone)]
pub struct MeshClient {
    api: ApiClient,
}

impl MeshClient {
    pub fn new(server_url: Url, api_key: String) -> Self {
        Self {
            api: ApiClient::new(server_url, AuthScheme::Bearer(api_key)),
        }
    }

    /// One readiness probe: 200 means the coordinator is up. Any failure
    /// reads as "not yet" so the caller's poll loop keeps going.
    pub async fn check_health(&self) -> bool {
        match self.api.get_status("health", HEALTH_TIMEOUT).await {
            Ok(status) => status == StatusCode::OK,
            Err(e) => {
                debug!("Coordinator health probe failed: {e}");
                false
            }
        }
    }

    /// List nodes registered with the coordinator.
    pub async fn list_machines(&self) -> Result<Vec<Machine>, ApiError> {
        let response: MachinesResponse = self.api.get_json("api/v1/machine").await?;
        debug!("Coordinator knows {} machines", response.machines.len());
        Ok(response.machines)
    }

    /// List advertised routes.
    pub async fn list_routes(&self) -> Result<Vec<Route>, ApiError> {
        let response: RoutesResponse = self.api.get_json("api/v1/routes").await?;
        Ok(response.routes)
    }

    /// Issue a registration credential for `user`.
    pub async fn create_pre_auth_key(
        &self,
        user: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<String>,
    ) -> Result<PreAuthKey, ApiError> {
        info!("Creating pre-auth key for user {user}");
        let request = PreAuthKeyRequest {
            user,
            reusable,
            ephemeral,
            expiration,
        };
        let response: PreAuthKeyResponse = self
            .api
            .post_json("api/v1/preauthkey", Some(&request))
            .await?;
        info!("Created pre-auth key {}", response.pre_auth_key.id);
        Ok(response.pre_auth_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machines_response_decodes() {
        let json = r#"{"machines":[
            {"id":"1","name":"exit-node","nodeKey":"nodekey:abc","ipAddresses":["100.64.0.2"]},
            {"id":"2","name":"laptop","nodeKey":null}
        ]}"#;
        let response: MachinesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.machines.len(), 2);
        assert_eq!(response.machines[0].node_key.as_deref(), Some("nodekey:abc"));
        assert!(response.machines[1].node_key.is_none());
        assert!(response.machines[1].ip_addresses.is_none());
    }

    #[test]
    fn test_pre_auth_key_response_decodes() {
        let json = r#"{"preAuthKey":{
            "id":"7","key":"secretvalue","reusable":false,"ephemeral":false,
            "used":false,"expiration":"2026-09-01T00:00:00Z","createdAt":"2026-08-30T00:00:00Z"
        }}"#;
        let response: PreAuthKeyResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.pre_auth_key.key, "secretvalue");
        assert!(!response.pre_auth_key.reusable);
    }

    #[test]
    fn test_pre_auth_request_omits_null_expiration() {
        let request = PreAuthKeyRequest {
            user: "burrow",
            reusable: false,
            ephemeral: false,
            expiration: None,
        };
        let encoded = serde_json::to_string(&request).unwrap();
        assert_eq!(
            encoded,
            r#"{"user":"burrow","reusable":false,"ephemeral":false}"#
        );
    }

    #[test]
    fn test_routes_response_decodes() {
        let json = r#"{"routes":[{"id":"1","machineId":"1","prefix":"0.0.0.0/0","enabled":true}]}"#;
        let response: RoutesResponse = serde_json::from_str(json).unwrap();
        assert!(response.routes[0].enabled);
        assert_eq!(response.routes[0].prefix, "0.0.0.0/0");
    }
}
