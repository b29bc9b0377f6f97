//! On-demand obfuscatable VPN orchestration.
//!
//! The connection life cycle in one picture:
//!
//! ```text
//!                 +--------------+   start    +-----------------+
//!  Disconnected ->| provisioner  |----------->| mesh coordinator|
//!                 | (instance)   |            | (poll /health)  |
//!                 +--------------+            +-----------------+
//!                                                      |
//!                        register device, fetch exit peer key
//!                                                      v
//!            +----------------+  frames   +---------------------+
//!  engine -->| stealth bridge |---------->| relay on :443 (TLS) |
//!   (UDP)    |  (optional)    |           +---------------------+
//!            +----------------+
//! ```
//!
//! [`Orchestrator`] owns the state machine and every transition.
//! Remote services ([`InstanceApi`], [`MeshApi`]), the packet mover
//! ([`TunnelEngine`]) and credential storage ([`SecretStore`]) are
//! trait seams, so the full machine is testable without a network.

mod bridge;
mod engine;
mod error;
mod keys;
mod monitor;
mod orchestrator;
mod routes;
mod secrets;
mod settings;
mod state;
mod wg_config;

pub use bridge::{BridgeError, MAX_FRAME_LEN, StealthBridge};
pub use engine::{EngineError, TunnelEngine, TunnelStats};
pub use error::ConnectError;
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use monitor::{NetworkEvent, NetworkMonitor, measure_latency};
pub use orchestrator::{
    CONNECT_TIMEOUT, HANDSHAKE_STALE_THRESHOLD, InstanceApi, MAX_RECONNECT_ATTEMPTS, MeshApi,
    MONITOR_INTERVAL, Orchestrator,
};
pub use routes::{allowed_ips_excluding, parse_cidr, range_to_cidrs};
pub use secrets::{MemorySecretStore, SecretStore, names as secret_names};
pub use settings::{HomeNetworkSettings, Settings, StealthSettings};
pub use state::{ConnectionState, ConnectionStatus, format_bytes};
pub use wg_config::{DEFAULT_KEEPALIVE, TunnelConfig, TunnelPeer};
