//! Connection state and status snapshots.
//!
//! [`ConnectionState`] is owned exclusively by the orchestrator and
//! mutated only through its transition API; everyone else sees
//! read-only snapshots. [`ConnectionStatus`] is a derived value
//! recomputed on every monitoring tick and discarded on disconnect.

use crate::error::ConnectError;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Where the connection state machine currently is.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// Remote compute instance is being provisioned.
    StartingRemote,
    /// Instance is up; polling the mesh coordinator for readiness.
    WaitingForCoordinator,
    /// Coordinator is ready; bringing the tunnel up.
    ConnectingTunnel,
    Connected,
    Disconnecting,
    /// Terminal until the next explicit connect.
    Error(ConnectError),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True for the three mid-connect states.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::StartingRemote
                | ConnectionState::WaitingForCoordinator
                | ConnectionState::ConnectingTunnel
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::StartingRemote => write!(f, "Starting remote instance..."),
            ConnectionState::WaitingForCoordinator => write!(f, "Waiting for coordinator..."),
            ConnectionState::ConnectingTunnel => write!(f, "Connecting tunnel..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting..."),
            ConnectionState::Error(e) => write!(f, "Error: {e}"),
        }
    }
}

/// One monitoring tick's view of the live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    /// Endpoint the tunnel currently points at.
    pub connected_endpoint: String,
    /// One-shot probe result, when the endpoint host is known.
    pub latency: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime: Duration,
    pub last_handshake: Option<SystemTime>,
}

impl ConnectionStatus {
    /// A handshake older than `threshold` (or never seen at all) means
    /// the link is likely dead even though local state says connected.
    pub fn is_handshake_stale(&self, threshold: Duration) -> bool {
        match self.last_handshake {
            None => true,
            Some(at) => SystemTime::now()
                .duration_since(at)
                .map(|age| age > threshold)
                .unwrap_or(false),
        }
    }

    pub fn formatted_latency(&self) -> String {
        match self.latency {
            Some(latency) => format!("{} ms", latency.as_millis()),
            None => "N/A".to_string(),
        }
    }

    pub fn formatted_uptime(&self) -> String {
        let total = self.uptime.as_secs();
        let hours = total / 3600;
        let minutes = total / 60 % 60;
        let seconds = total % 60;

        if hours > 0 {
            format!("{hours}h {minutes}m {seconds}s")
        } else if minutes > 0 {
            format!("{minutes}m {seconds}s")
        } else {
            format!("{seconds}s")
        }
    }
}

/// Human-readable binary byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(last_handshake: Option<SystemTime>) -> ConnectionStatus {
        ConnectionStatus {
            connected_endpoint: "203.0.113.9:51820".into(),
            latency: None,
            bytes_sent: 0,
            bytes_received: 0,
            uptime: Duration::from_secs(0),
            last_handshake,
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::StartingRemote.is_connecting());
        assert!(ConnectionState::WaitingForCoordinator.is_connecting());
        assert!(ConnectionState::ConnectingTunnel.is_connecting());
        assert!(!ConnectionState::Connected.is_connecting());
        assert!(ConnectionState::Error(ConnectError::Timeout).is_error());
    }

    #[test]
    fn test_missing_handshake_is_stale() {
        assert!(status(None).is_handshake_stale(Duration::from_secs(180)));
    }

    #[test]
    fn test_fresh_handshake_is_not_stale() {
        let fresh = status(Some(SystemTime::now()));
        assert!(!fresh.is_handshake_stale(Duration::from_secs(180)));
    }

    #[test]
    fn test_old_handshake_is_stale() {
        let old = status(Some(SystemTime::now() - Duration::from_secs(600)));
        assert!(old.is_handshake_stale(Duration::from_secs(180)));
    }

    #[test]
    fn test_uptime_formatting() {
        let mut s = status(None);
        s.uptime = Duration::from_secs(45);
        assert_eq!(s.formatted_uptime(), "45s");
        s.uptime = Duration::from_secs(125);
        assert_eq!(s.formatted_uptime(), "2m 5s");
        s.uptime = Duration::from_secs(3725);
        assert_eq!(s.formatted_uptime(), "1h 2m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
