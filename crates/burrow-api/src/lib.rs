//! Burrow API - Remote Service Clients
//!
//! Typed clients for the two external services Burrow depends on:
//!
//! - **Instance provisioner**: starts and stops the remote compute
//!   instance that terminates the tunnel (`instance/*` endpoints,
//!   static API-key auth).
//! - **Mesh coordinator**: tracks node public keys and issues
//!   registration credentials (`/health`, `/api/v1/*` endpoints,
//!   bearer-token auth).
//!
//! Both ride on [`ApiClient`], a small hyper-over-rustls client that
//! applies a uniform retry/backoff and status-code mapping policy to
//! every outbound call, so callers only ever see exhausted errors.

mod client;
mod instance;
mod mesh;

pub use client::{ApiClient, ApiError, AuthScheme, with_retry};
pub use instance::{
    InstanceClient, InstanceInfo, InstanceStartResponse, InstanceStatus, InstanceStopResponse,
};
pub use mesh::{Machine, MeshClient, PreAuthKey, Route};
