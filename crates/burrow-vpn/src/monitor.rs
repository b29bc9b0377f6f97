//! Network change events and latency probing.
//!
//! Platform integrations observe connectivity and WiFi transitions and
//! feed them to the orchestrator's event loop through a channel. The
//! latency probe is a plain TCP connect timing, good enough for a
//! status readout.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

const LATENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A network transition the orchestrator may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Connectivity came back after an outage.
    ConnectivityRestored,
    /// Joined a WiFi network that is not in the trusted list.
    UntrustedWifiJoined(String),
}

/// Sending half handed to platform observers.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    events: mpsc::Sender<NetworkEvent>,
}

impl NetworkMonitor {
    /// A monitor plus the receiver the orchestrator's run loop consumes.
    pub fn channel() -> (Self, mpsc::Receiver<NetworkEvent>) {
        let (events, rx) = mpsc::channel(16);
        (Self { events }, rx)
    }

    pub async fn connectivity_restored(&self) {
        self.send(NetworkEvent::ConnectivityRestored).await;
    }

    pub async fn wifi_joined(&self, ssid: &str) {
        self.send(NetworkEvent::UntrustedWifiJoined(ssid.to_string()))
            .await;
    }

    async fn send(&self, event: NetworkEvent) {
        if self.events.send(event.clone()).await.is_err() {
            debug!("Dropping network event {event:?}, run loop is gone");
        }
    }
}

/// Time a TCP connect to `host` on port 80. `None` when the host is
/// unreachable or the probe times out.
pub async fn measure_latency(host: &str) -> Option<Duration> {
    let started = std::time::Instant::now();
    let connect = TcpStream::connect((host, 80));
    match tokio::time::timeout(LATENCY_PROBE_TIMEOUT, connect).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (monitor, mut rx) = NetworkMonitor::channel();
        monitor.connectivity_restored().await;
        monitor.wifi_joined("CoffeeShop").await;

        assert_eq!(rx.recv().await, Some(NetworkEvent::ConnectivityRestored));
        assert_eq!(
            rx.recv().await,
            Some(NetworkEvent::UntrustedWifiJoined("CoffeeShop".into()))
        );
    }

    #[tokio::test]
    async fn test_send_survives_dropped_receiver() {
        let (monitor, rx) = NetworkMonitor::channel();
        drop(rx);
        monitor.connectivity_restored().await;
    }

    #[tokio::test]
    async fn test_latency_probe_fails_cleanly() {
        // Reserved TEST-NET-1 address, nothing listens there.
        assert_eq!(measure_latency("192.0.2.1").await, None);
    }
}
