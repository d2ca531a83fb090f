//! Configuration for the tunnel node.
//!
//! Values come from the `tunnel` section of a YAML file, then `TUNNEL_*`
//! environment variables override them. Transport tunables are kept as the
//! named parameters `TransportConfig::from_provider` understands.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};
use tunnel_session::TransportConfig;

/// Transport the node speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw sockets
    Tcp,
    /// HTTP requests and long polls
    Http,
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "http" => Ok(TransportKind::Http),
            other => bail!("unknown transport {other:?}"),
        }
    }
}

/// Tunnel node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// URI announced to peers
    pub local_uri: Option<String>,
    /// Address to accept connections on
    pub listen: Option<SocketAddr>,
    /// Peer URI to send to
    pub connect: Option<String>,
    /// Transport to use
    pub transport: TransportKind,
    /// Pre-shared key, 64 hex digits
    pub psk: Option<String>,
    /// Named transport parameters (`ConnectTimeout: "5s"`, ...)
    pub parameters: HashMap<String, String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_uri: None,
            listen: None,
            connect: None,
            transport: TransportKind::Tcp,
            psk: None,
            parameters: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RootConfig {
    tunnel: Option<TunnelConfig>,
}

impl TunnelConfig {
    /// Load the file if it exists, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                info!("Loaded configuration from {}", path.display());
                root.tunnel.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_environment_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(uri) = var("TUNNEL_LOCAL_URI") {
            info!("Local URI overridden by environment: {}", uri);
            self.local_uri = Some(uri);
        }
        if let Some(listen) = var("TUNNEL_LISTEN") {
            self.listen = Some(listen.parse().with_context(|| format!("TUNNEL_LISTEN={listen}"))?);
        }
        if let Some(connect) = var("TUNNEL_CONNECT") {
            self.connect = Some(connect);
        }
        if let Some(transport) = var("TUNNEL_TRANSPORT") {
            self.transport = transport.parse()?;
        }
        if let Some(psk) = var("TUNNEL_PSK") {
            self.psk = Some(psk);
        }
        Ok(())
    }

    /// Transport tunables from the named parameters
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::from_provider(&self.parameters)?;
        if self.psk.is_some() && config.security_session.is_none() {
            config.security_session = Some("psk".to_string());
        }
        Ok(config)
    }

    /// URI announced to peers; derived from the listen address when unset
    pub fn local_uri(&self) -> String {
        let scheme = match self.transport {
            TransportKind::Tcp => "tcp",
            TransportKind::Http => "http",
        };
        match (&self.local_uri, self.listen) {
            (Some(uri), _) => uri.clone(),
            (None, Some(addr)) => format!("{scheme}://{addr}"),
            (None, None) => format!("{scheme}://{}:0", hostname()),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
