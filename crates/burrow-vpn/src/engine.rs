//! Tunnel engine seam.
//!
//! The orchestrator drives whatever actually moves packets (a kernel
//! module, a userspace implementation, a system extension) through this
//! trait. Engines report transfer counters and the peer handshake time,
//! which the monitor uses for liveness.

use crate::wg_config::TunnelConfig;
use std::future::Future;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

/// Live counters read from the running tunnel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Most recent peer handshake; `None` until the first completes.
    pub last_handshake: Option<SystemTime>,
    /// Endpoint the tunnel is currently talking to.
    pub endpoint: Option<String>,
}

impl TunnelStats {
    pub fn is_handshake_stale(&self, threshold: std::time::Duration) -> bool {
        match self.last_handshake {
            None => true,
            Some(at) => SystemTime::now()
                .duration_since(at)
                .map(|age| age > threshold)
                .unwrap_or(false),
        }
    }
}

/// Futures are `Send` so teardown can run from spawned tasks.
pub trait TunnelEngine: Send {
    fn start(
        &mut self,
        config: &TunnelConfig,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<TunnelStats, EngineError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_stats_are_stale() {
        assert!(TunnelStats::default().is_handshake_stale(Duration::from_secs(180)));
    }

    #[test]
    fn test_recent_handshake_is_fresh() {
        let stats = TunnelStats {
            last_handshake: Some(SystemTime::now()),
            ..TunnelStats::default()
        };
        assert!(!stats.is_handshake_stale(Duration::from_secs(180)));
    }
}
