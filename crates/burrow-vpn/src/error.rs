//! Connection error taxonomy.
//!
//! Everything the orchestrator can surface through
//! [`ConnectionState::Error`](crate::state::ConnectionState). Transient
//! remote-call failures never appear here individually; the call layer
//! retries them and only exhaustion bubbles up.

/// Terminal failure reasons for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),

    #[error("failed to start remote instance: {0}")]
    RemoteStartFailed(String),

    #[error("failed to stop remote instance: {0}")]
    RemoteStopFailed(String),

    #[error("coordinator health check timed out")]
    CoordinatorTimeout,

    #[error("coordinator unreachable: {0}")]
    CoordinatorUnreachable(String),

    #[error("tunnel failed: {0}")]
    TunnelFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("operation timed out")]
    Timeout,

    #[error("unknown error: {0}")]
    Unknown(String),
}
