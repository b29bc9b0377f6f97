//! Connection orchestrator.
//!
//! Owns the connection state machine and drives every piece of the
//! system in order: provision the remote instance, wait for the mesh
//! coordinator, register this device, optionally raise the stealth
//! bridge, assemble the tunnel configuration, start the engine, and
//! then keep watch over the live tunnel.
//!
//! The remote services and the tunnel engine sit behind traits so the
//! whole machine runs against in-memory fakes in tests. State is owned
//! exclusively here; callers observe it through snapshots.

use crate::bridge::StealthBridge;
use crate::engine::TunnelEngine;
use crate::error::ConnectError;
use crate::keys::PrivateKey;
use crate::monitor::{NetworkEvent, measure_latency};
use crate::routes;
use crate::secrets::{SecretStore, names};
use crate::settings::Settings;
use crate::state::{ConnectionState, ConnectionStatus};
use crate::wg_config::{TunnelConfig, TunnelPeer};
use burrow_api::{
    ApiClient, ApiError, AuthScheme, InstanceClient, InstanceStartResponse, InstanceStopResponse,
    Machine, MeshClient, PreAuthKey,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Ceiling on one whole connect attempt, all steps included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Coordinator readiness poll cadence and budget.
pub const COORDINATOR_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const COORDINATOR_WAIT_MAX: Duration = Duration::from_secs(30);

/// Cadence of the live-connection monitor.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// A handshake older than this means the tunnel is dead.
pub const HANDSHAKE_STALE_THRESHOLD: Duration = Duration::from_secs(180);

/// Consecutive stale observations tolerated before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Pause between teardown and reconnect after connectivity returns.
const RECOVERY_GRACE: Duration = Duration::from_secs(1);

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Instance provisioning operations the orchestrator needs.
pub trait InstanceApi: Clone + Send + Sync + 'static {
    fn start(
        &self,
        instance_type: Option<&str>,
    ) -> impl Future<Output = Result<InstanceStartResponse, ApiError>> + Send;

    fn stop(&self) -> impl Future<Output = Result<InstanceStopResponse, ApiError>> + Send;
}

impl InstanceApi for InstanceClient {
    async fn start(
        &self,
        instance_type: Option<&str>,
    ) -> Result<InstanceStartResponse, ApiError> {
        InstanceClient::start(self, instance_type).await
    }

    async fn stop(&self) -> Result<InstanceStopResponse, ApiError> {
        InstanceClient::stop(self).await
    }
}

/// Mesh coordinator operations the orchestrator needs.
pub trait MeshApi: Clone + Send + Sync + 'static {
    fn check_health(&self) -> impl Future<Output = bool> + Send;

    fn list_machines(&self) -> impl Future<Output = Result<Vec<Machine>, ApiError>> + Send;

    fn create_pre_auth_key(
        &self,
        user: &str,
    ) -> impl Future<Output = Result<PreAuthKey, ApiError>> + Send;
}

impl MeshApi for MeshClient {
    async fn check_health(&self) -> bool {
        MeshClient::check_health(self).await
    }

    async fn list_machines(&self) -> Result<Vec<Machine>, ApiError> {
        MeshClient::list_machines(self).await
    }

    async fn create_pre_auth_key(&self, user: &str) -> Result<PreAuthKey, ApiError> {
        MeshClient::create_pre_auth_key(self, user, false, false, None).await
    }
}

fn map_provisioner_error(err: ApiError) -> ConnectError {
    match err {
        ApiError::AuthenticationFailed => ConnectError::AuthenticationFailed,
        ApiError::Timeout => ConnectError::Timeout,
        other => ConnectError::RemoteStartFailed(other.to_string()),
    }
}

fn map_coordinator_error(err: ApiError) -> ConnectError {
    match err {
        ApiError::AuthenticationFailed => ConnectError::AuthenticationFailed,
        ApiError::Timeout => ConnectError::Timeout,
        other => ConnectError::CoordinatorUnreachable(other.to_string()),
    }
}

/// The connection state machine.
pub struct Orchestrator<P, M, E, S> {
    settings: Settings,
    instances: P,
    mesh: M,
    engine: E,
    secrets: S,

    state: ConnectionState,
    status: Option<ConnectionStatus>,
    bridge: Option<StealthBridge>,
    endpoint: Option<String>,
    connected_at: Option<Instant>,
    auto_disconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl<P, M, E, S> Orchestrator<P, M, E, S>
where
    P: InstanceApi,
    M: MeshApi,
    E: TunnelEngine,
    S: SecretStore,
{
    pub fn new(settings: Settings, instances: P, mesh: M, engine: E, secrets: S) -> Self {
        Self {
            settings,
            instances,
            mesh,
            engine,
            secrets,
            state: ConnectionState::Disconnected,
            status: None,
            bridge: None,
            endpoint: None,
            connected_at: None,
            auto_disconnect_at: None,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Last monitoring snapshot; `None` until the first tick completes.
    pub fn status(&self) -> Option<&ConnectionStatus> {
        self.status.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run the full connect sequence. A no-op while already connected
    /// or mid-connect; any failure (including the overall timeout)
    /// rolls partial work back and parks the machine in an error state.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.state.is_connected() || self.state.is_connecting() {
            warn!("Connect requested while {}", self.state);
            return Ok(());
        }

        info!("Connecting...");
        match tokio::time::timeout(CONNECT_TIMEOUT, self.perform_connect()).await {
            Ok(Ok(())) => {
                self.connected_at = Some(Instant::now());
                self.auto_disconnect_at = self
                    .settings
                    .auto_disconnect_duration()
                    .map(|cutoff| Instant::now() + cutoff);
                self.reconnect_attempts = 0;
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Connect failed: {e}");
                self.rollback().await;
                self.set_state(ConnectionState::Error(e.clone()));
                Err(e)
            }
            Err(_) => {
                error!("Connect timed out after {CONNECT_TIMEOUT:?}");
                self.rollback().await;
                self.set_state(ConnectionState::Error(ConnectError::Timeout));
                Err(ConnectError::Timeout)
            }
        }
    }

    /// Tear everything down. Safe from any state.
    pub async fn disconnect(&mut self) {
        if matches!(self.state, ConnectionState::Disconnecting) {
            return;
        }
        info!("Disconnecting...");
        self.set_state(ConnectionState::Disconnecting);

        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
        }
        if let Err(e) = self.engine.stop().await {
            warn!("Engine stop failed: {e}");
        }
        self.spawn_instance_stop();

        self.clear_session();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Event loop: monitoring ticks, the auto-disconnect timer, and
    /// network change events, until the event channel closes.
    pub async fn run(&mut self, mut events: mpsc::Receiver<NetworkEvent>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            let auto_off = self.auto_disconnect_at;
            tokio::select! {
                _ = ticker.tick() => {
                    self.monitor_tick().await;
                }
                _ = tokio::time::sleep_until(auto_off.unwrap_or_else(Instant::now)),
                        if auto_off.is_some() => {
                    info!("Auto-disconnect timer elapsed");
                    self.disconnect().await;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_network_event(event).await,
                        None => break,
                    }
                }
            }
        }
        debug!("Orchestrator run loop exiting");
    }

    /// One monitoring pass: refresh the status snapshot and check
    /// tunnel liveness. Does nothing unless connected.
    pub async fn monitor_tick(&mut self) {
        if !self.state.is_connected() {
            return;
        }

        let stats = match self.engine.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to read tunnel stats: {e}");
                return;
            }
        };

        let latency = match stats.endpoint.as_deref().and_then(|ep| ep.split(':').next()) {
            Some(host) => measure_latency(host).await,
            None => None,
        };
        self.status = Some(ConnectionStatus {
            connected_endpoint: stats
                .endpoint
                .clone()
                .or_else(|| self.endpoint.clone())
                .unwrap_or_default(),
            latency,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            uptime: self.connected_at.map(|at| at.elapsed()).unwrap_or_default(),
            last_handshake: stats.last_handshake,
        });

        if stats.is_handshake_stale(HANDSHAKE_STALE_THRESHOLD) {
            self.handle_stale_handshake().await;
        } else if self.reconnect_attempts != 0 {
            debug!("Handshake recovered, resetting stale counter");
            self.reconnect_attempts = 0;
        }
    }

    /// React to a network transition reported by a platform observer.
    pub async fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::ConnectivityRestored => {
                if !self.state.is_connected() {
                    return;
                }
                let dead = match self.engine.stats().await {
                    Ok(stats) => stats.is_handshake_stale(HANDSHAKE_STALE_THRESHOLD),
                    Err(_) => true,
                };
                if dead {
                    info!("Connectivity restored with a dead tunnel, reconnecting");
                    self.disconnect().await;
                    tokio::time::sleep(RECOVERY_GRACE).await;
                    if let Err(e) = self.connect().await {
                        warn!("Reconnect failed: {e}");
                    }
                }
            }
            NetworkEvent::UntrustedWifiJoined(ssid) => {
                if !self.settings.auto_connect_untrusted_wifi {
                    return;
                }
                if self.state.is_connected() || self.state.is_connecting() {
                    return;
                }
                if self
                    .settings
                    .trusted_network_list()
                    .contains(&ssid.to_lowercase())
                {
                    debug!("Joined trusted network {ssid:?}");
                    return;
                }
                info!("Joined untrusted network {ssid:?}, auto-connecting");
                if let Err(e) = self.connect().await {
                    warn!("Auto-connect failed: {e}");
                }
            }
        }
    }

    async fn perform_connect(&mut self) -> Result<(), ConnectError> {
        self.settings.validate()?;

        self.set_state(ConnectionState::StartingRemote);
        let started = self
            .instances
            .start(self.settings.instance_type.as_deref())
            .await
            .map_err(map_provisioner_error)?;
        let public_ip = started
            .public_ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                ConnectError::RemoteStartFailed("no public address in response".into())
            })?;

        self.set_state(ConnectionState::WaitingForCoordinator);
        self.wait_for_coordinator().await?;

        let private_key = self.ensure_registered().await?;
        let our_public = private_key.public_key().to_base64();

        let endpoint = if self.settings.stealth.enabled {
            let stealth = &self.settings.stealth;
            let mut bridge = StealthBridge::new(
                stealth.local_port,
                public_ip.clone(),
                stealth.remote_port,
                stealth.accept_invalid_certs,
            );
            bridge
                .start()
                .await
                .map_err(|e| ConnectError::TunnelFailed(e.to_string()))?;
            let endpoint = bridge.local_endpoint();
            self.bridge = Some(bridge);
            endpoint
        } else {
            format!("{public_ip}:{}", self.settings.wireguard_port)
        };

        let exit_key = self.fetch_exit_peer_key(&our_public).await?;
        let config = self.build_tunnel_config(&private_key, &exit_key, endpoint.clone());

        self.set_state(ConnectionState::ConnectingTunnel);
        self.engine
            .start(&config)
            .await
            .map_err(|e| ConnectError::TunnelFailed(e.to_string()))?;
        self.endpoint = Some(endpoint);

        self.verify_reachability().await;
        Ok(())
    }

    /// Poll the coordinator until it answers healthy or the budget runs
    /// out.
    async fn wait_for_coordinator(&self) -> Result<(), ConnectError> {
        let deadline = Instant::now() + COORDINATOR_WAIT_MAX;
        loop {
            if self.mesh.check_health().await {
                return Ok(());
            }
            if Instant::now() + COORDINATOR_POLL_INTERVAL > deadline {
                return Err(ConnectError::CoordinatorTimeout);
            }
            debug!("Coordinator not ready, polling again");
            tokio::time::sleep(COORDINATOR_POLL_INTERVAL).await;
        }
    }

    /// Load (or mint) this device's tunnel key and make sure the
    /// coordinator will accept it, issuing a fresh registration
    /// credential when the device is unknown.
    async fn ensure_registered(&mut self) -> Result<PrivateKey, ConnectError> {
        let private_key = match self.secrets.get(names::TUNNEL_PRIVATE_KEY) {
            Some(encoded) => PrivateKey::from_base64(&encoded).map_err(|e| {
                ConnectError::ConfigurationMissing(format!("tunnel private key ({e})"))
            })?,
            None => {
                info!("Generating a new tunnel key pair");
                let key = PrivateKey::generate();
                self.secrets.set(names::TUNNEL_PRIVATE_KEY, &key.to_base64());
                key
            }
        };
        let public = private_key.public_key().to_base64();

        let machines = self
            .mesh
            .list_machines()
            .await
            .map_err(map_coordinator_error)?;
        let registered = machines.iter().any(|machine| {
            machine
                .node_key
                .as_deref()
                .is_some_and(|key| key.trim_start_matches("nodekey:") == public)
        });

        if !registered {
            let key = self
                .mesh
                .create_pre_auth_key(&self.settings.coordinator_user)
                .await
                .map_err(map_coordinator_error)?;
            // Replace rather than overwrite so a half-written credential
            // never survives.
            self.secrets.delete(names::PRE_AUTH_KEY);
            self.secrets.set(names::PRE_AUTH_KEY, &key.key);
            info!("Issued registration credential for this device");
        }

        Ok(private_key)
    }

    /// Public key of the exit peer: the first registered machine whose
    /// key is present and is not our own.
    async fn fetch_exit_peer_key(&self, our_public: &str) -> Result<String, ConnectError> {
        let machines = self
            .mesh
            .list_machines()
            .await
            .map_err(map_coordinator_error)?;
        machines
            .into_iter()
            .filter_map(|machine| machine.node_key)
            .map(|key| key.trim_start_matches("nodekey:").to_string())
            .find(|key| !key.is_empty() && key != our_public)
            .ok_or_else(|| {
                ConnectError::TunnelFailed("no exit peer registered with coordinator".into())
            })
    }

    fn build_tunnel_config(
        &self,
        private_key: &PrivateKey,
        exit_public_key: &str,
        endpoint: String,
    ) -> TunnelConfig {
        let keepalive = self.settings.keepalive_secs;
        let home = &self.settings.home;
        let split_home = home.enabled && !home.peer_public_key.is_empty();

        let (exit_allowed, dns) = if split_home {
            // Two halves instead of 0.0.0.0/0 so the more specific home
            // subnet route wins over the default.
            ("0.0.0.0/1, 128.0.0.0/1".to_string(), home.dns.clone())
        } else {
            let exclusions = self.settings.excluded_route_list();
            let allowed = if exclusions.is_empty() {
                self.settings.allowed_ips.clone()
            } else {
                routes::allowed_ips_excluding(&exclusions)
            };
            (allowed, self.settings.dns.clone())
        };

        let mut peers = vec![TunnelPeer {
            public_key: exit_public_key.to_string(),
            endpoint: Some(endpoint),
            allowed_ips: exit_allowed,
            persistent_keepalive: keepalive,
        }];
        if split_home {
            peers.push(TunnelPeer {
                public_key: home.peer_public_key.clone(),
                endpoint: home.peer_endpoint.clone(),
                allowed_ips: home.subnet.clone(),
                persistent_keepalive: keepalive,
            });
        }

        TunnelConfig {
            private_key: private_key.to_base64(),
            address: self.settings.tunnel_address.clone(),
            dns: Some(dns),
            peers,
        }
    }

    /// Best-effort confirmation that traffic flows through the tunnel.
    /// Failures are logged and never fail the connect.
    async fn verify_reachability(&self) {
        let Some(raw) = &self.settings.reachability_check_url else {
            return;
        };
        let Ok(url) = Url::parse(raw) else {
            warn!("Invalid reachability check URL {raw:?}");
            return;
        };
        let client = ApiClient::new(url, AuthScheme::None);
        match client.get_status("", REACHABILITY_TIMEOUT).await {
            Ok(status) if status.is_success() => info!("Reachability check passed"),
            Ok(status) => warn!("Reachability check returned {status}"),
            Err(e) => warn!("Reachability check failed: {e}"),
        }
    }

    async fn handle_stale_handshake(&mut self) {
        self.reconnect_attempts += 1;
        warn!(
            "Stale tunnel handshake ({}/{MAX_RECONNECT_ATTEMPTS})",
            self.reconnect_attempts
        );
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            self.disconnect().await;
            self.set_state(ConnectionState::Error(ConnectError::TunnelFailed(
                "Connection lost".into(),
            )));
            self.reconnect_attempts = 0;
        }
    }

    /// Undo partial connect work. The error state set by the caller
    /// survives; only resources are released.
    async fn rollback(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
        }
        if let Err(e) = self.engine.stop().await {
            debug!("Engine stop during rollback: {e}");
        }
        self.spawn_instance_stop();
        self.clear_session();
    }

    /// The instance bills while it runs, so the stop call must not be
    /// lost to a slow response; it retries in the background while the
    /// local teardown completes.
    fn spawn_instance_stop(&self) {
        let instances = self.instances.clone();
        tokio::spawn(async move {
            if let Err(e) = instances.stop().await {
                warn!("Remote instance stop failed: {e}");
            }
        });
    }

    fn clear_session(&mut self) {
        self.status = None;
        self.endpoint = None;
        self.connected_at = None;
        self.auto_disconnect_at = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state: {state}");
            self.state = state;
        }
    }
}
