//! Tunnel configuration in standard INI form.
//!
//! Any engine that understands `wg-quick` style files can consume the
//! output of [`TunnelConfig::to_conf_string`], and the parser accepts
//! the same shape back for tests and config import.

pub const DEFAULT_KEEPALIVE: u16 = 25;

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelPeer {
    /// Base64 public key of the peer.
    pub public_key: String,
    /// `host:port`, absent for peers that only receive.
    pub endpoint: Option<String>,
    /// Comma-separated CIDR list routed through this peer.
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    /// Base64 private key of the local interface.
    pub private_key: String,
    /// Interface address, e.g. `100.64.0.1/32`.
    pub address: String,
    pub dns: Option<String>,
    pub peers: Vec<TunnelPeer>,
}

impl TunnelConfig {
    /// Render as a `wg-quick` configuration file.
    pub fn to_conf_string(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.private_key));
        out.push_str(&format!("Address = {}\n", self.address));
        if let Some(dns) = &self.dns {
            out.push_str(&format!("DNS = {dns}\n"));
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {endpoint}\n"));
            }
            out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips));
            out.push_str(&format!(
                "PersistentKeepalive = {}\n",
                peer.persistent_keepalive
            ));
        }

        out
    }

    /// Parse a `wg-quick` style file. Unknown keys and `#` comments are
    /// ignored; sections other than `[Interface]` and `[Peer]` are an
    /// error.
    pub fn from_conf_str(conf: &str) -> Result<Self, String> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut section = Section::None;
        let mut private_key = None;
        let mut address = None;
        let mut dns = None;
        let mut peers: Vec<TunnelPeer> = Vec::new();

        for line in conf.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                section = match line {
                    "[Interface]" => Section::Interface,
                    "[Peer]" => {
                        peers.push(TunnelPeer {
                            public_key: String::new(),
                            endpoint: None,
                            allowed_ips: String::new(),
                            persistent_keepalive: 0,
                        });
                        Section::Peer
                    }
                    other => return Err(format!("unknown section {other}")),
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("malformed line {line:?}"));
            };
            let (key, value) = (key.trim(), value.trim());

            match section {
                Section::Interface => match key {
                    "PrivateKey" => private_key = Some(value.to_string()),
                    "Address" => address = Some(value.to_string()),
                    "DNS" => dns = Some(value.to_string()),
                    _ => {}
                },
                Section::Peer => {
                    // Safe: a [Peer] header always pushes first.
                    let peer = peers.last_mut().ok_or("peer key outside [Peer]")?;
                    match key {
                        "PublicKey" => peer.public_key = value.to_string(),
                        "Endpoint" => peer.endpoint = Some(value.to_string()),
                        "AllowedIPs" => peer.allowed_ips = value.to_string(),
                        "PersistentKeepalive" => {
                            peer.persistent_keepalive =
                                value.parse().map_err(|_| "invalid keepalive")?;
                        }
                        _ => {}
                    }
                }
                Section::None => return Err(format!("key {key:?} before any section")),
            }
        }

        Ok(Self {
            private_key: private_key.ok_or("missing PrivateKey")?,
            address: address.ok_or("missing Address")?,
            dns,
            peers,
        })
    }

    /// Endpoint of the first peer that has one (the exit peer).
    pub fn server_endpoint(&self) -> Option<&str> {
        self.peers
            .iter()
            .find_map(|peer| peer.endpoint.as_deref())
    }
}
