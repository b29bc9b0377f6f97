//! Connection settings.
//!
//! One flat, serializable bag of knobs resolved at connect time. The
//! orchestrator fails fast on missing or unparseable endpoints before
//! touching any remote service.

use crate::error::ConnectError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Stealth relay knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StealthSettings {
    /// Wrap tunnel UDP in TLS/TCP toward the remote relay.
    pub enabled: bool,
    /// Local UDP port the tunnel engine is pointed at instead of the
    /// real endpoint.
    pub local_port: u16,
    /// Remote relay TCP port; 443 so the stream passes as ordinary TLS.
    pub remote_port: u16,
    /// Accept the relay's certificate without chain validation. The
    /// relay is a private server the user controls, and restrictive
    /// networks are exactly where a public CA chain is unavailable.
    pub accept_invalid_certs: bool,
}

impl Default for StealthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            local_port: 51821,
            remote_port: 443,
            accept_invalid_certs: true,
        }
    }
}

/// Split-tunnel routing for a home subnet behind a second peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeNetworkSettings {
    pub enabled: bool,
    /// Public key of the home peer; split routing is off while empty.
    pub peer_public_key: String,
    /// Optional `host:port` of the home peer.
    pub peer_endpoint: Option<String>,
    pub subnet: String,
    pub dns: String,
}

impl Default for HomeNetworkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            peer_public_key: String::new(),
            peer_endpoint: None,
            subnet: "192.168.0.0/20".to_string(),
            dns: "192.168.1.1".to_string(),
        }
    }
}

/// Everything a connection attempt needs, besides secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the instance provisioning service.
    pub provisioner_endpoint: String,
    /// Base URL of the mesh coordinator.
    pub coordinator_url: String,
    /// Coordinator user (namespace) pre-auth keys are issued under.
    pub coordinator_user: String,
    /// Instance type to request, if any.
    pub instance_type: Option<String>,

    /// UDP port the exit peer listens on.
    pub wireguard_port: u16,
    /// Keepalive written into every peer section.
    pub keepalive_secs: u16,
    /// Local tunnel interface address.
    pub tunnel_address: String,
    /// DNS inside the tunnel (home DNS takes over under split routing).
    pub dns: String,
    /// Exit-peer allowed IPs when no exclusions are configured.
    pub allowed_ips: String,
    /// Exclusion list, one CIDR or address per line; `#` comments.
    pub excluded_routes: String,

    pub stealth: StealthSettings,
    pub home: HomeNetworkSettings,

    /// Connect automatically when an untrusted WiFi network is joined.
    pub auto_connect_untrusted_wifi: bool,
    /// Comma-separated SSIDs exempt from auto-connect (case-insensitive).
    pub trusted_wifi_networks: String,
    /// Idle cutoff in minutes; 0 disables the timer.
    pub auto_disconnect_minutes: u64,

    /// Best-effort post-connect reachability probe; `None` skips it.
    pub reachability_check_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provisioner_endpoint: String::new(),
            coordinator_url: String::new(),
            coordinator_user: "burrow".to_string(),
            instance_type: None,
            wireguard_port: 51820,
            keepalive_secs: 25,
            tunnel_address: "100.64.0.1/32".to_string(),
            dns: "1.1.1.1".to_string(),
            allowed_ips: "0.0.0.0/0".to_string(),
            excluded_routes: String::new(),
            stealth: StealthSettings::default(),
            home: HomeNetworkSettings::default(),
            auto_connect_untrusted_wifi: false,
            trusted_wifi_networks: String::new(),
            auto_disconnect_minutes: 0,
            reachability_check_url: Some("https://api.ipify.org?format=json".to_string()),
        }
    }
}

impl Settings {
    /// Fail fast on anything a connect attempt cannot proceed without.
    pub fn validate(&self) -> Result<(), ConnectError> {
        self.provisioner_url()?;
        self.coordinator_endpoint()?;
        if self.coordinator_user.trim().is_empty() {
            return Err(ConnectError::ConfigurationMissing(
                "coordinator user".into(),
            ));
        }
        if self.tunnel_address.trim().is_empty() {
            return Err(ConnectError::ConfigurationMissing("tunnel address".into()));
        }
        Ok(())
    }

    pub fn provisioner_url(&self) -> Result<Url, ConnectError> {
        parse_endpoint(&self.provisioner_endpoint, "provisioner endpoint")
    }

    pub fn coordinator_endpoint(&self) -> Result<Url, ConnectError> {
        parse_endpoint(&self.coordinator_url, "coordinator URL")
    }

    /// Usable exclusion entries: trimmed, comments and blanks dropped,
    /// bare addresses widened to `/32`. Lines that are not addresses or
    /// CIDRs are skipped (name resolution is not this layer's job).
    pub fn excluded_route_list(&self) -> Vec<String> {
        self.excluded_routes
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                if line.contains('/') {
                    Some(line.to_string())
                } else if line.parse::<std::net::Ipv4Addr>().is_ok() {
                    Some(format!("{line}/32"))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Trusted SSIDs, lowercased for case-insensitive matching.
    pub fn trusted_network_list(&self) -> Vec<String> {
        self.trusted_wifi_networks
            .split(',')
            .map(|ssid| ssid.trim().to_lowercase())
            .filter(|ssid| !ssid.is_empty())
            .collect()
    }

    pub fn auto_disconnect_duration(&self) -> Option<Duration> {
        (self.auto_disconnect_minutes > 0)
            .then(|| Duration::from_secs(self.auto_disconnect_minutes * 60))
    }
}

fn parse_endpoint(raw: &str, field: &str) -> Result<Url, ConnectError> {
    if raw.trim().is_empty() {
        return Err(ConnectError::ConfigurationMissing(field.to_string()));
    }
    Url::parse(raw).map_err(|_| ConnectError::ConfigurationMissing(format!("{field} (invalid)")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings {
            provisioner_endpoint: "https://api.example.com/prod".into(),
            coordinator_url: "https://mesh.example.com".into(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_validate_accepts_complete_settings() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_endpoints() {
        let mut s = valid();
        s.provisioner_endpoint.clear();
        assert!(matches!(
            s.validate(),
            Err(ConnectError::ConfigurationMissing(ref f)) if f == "provisioner endpoint"
        ));

        let mut s = valid();
        s.coordinator_url = "not a url".into();
        assert!(matches!(
            s.validate(),
            Err(ConnectError::ConfigurationMissing(_))
        ));
    }

    #[test]
    fn test_excluded_route_list_parsing() {
        let mut s = valid();
        s.excluded_routes = "\n  10.0.0.0/8\n# corp ranges\n192.168.1.7\nprinter.local\n\n".into();
        assert_eq!(s.excluded_route_list(), vec!["10.0.0.0/8", "192.168.1.7/32"]);
    }

    #[test]
    fn test_trusted_network_list_is_lowercased() {
        let mut s = valid();
        s.trusted_wifi_networks = "HomeNet, Cafe WiFi ,".into();
        assert_eq!(s.trusted_network_list(), vec!["homenet", "cafe wifi"]);
    }

    #[test]
    fn test_auto_disconnect_duration() {
        let mut s = valid();
        assert!(s.auto_disconnect_duration().is_none());
        s.auto_disconnect_minutes = 30;
        assert_eq!(
            s.auto_disconnect_duration(),
            Some(Duration::from_secs(1800))
        );
    }
}
