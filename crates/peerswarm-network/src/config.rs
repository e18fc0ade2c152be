//! Configuration loading from TOML and environment variables.
//!
//! A node reads its configuration from:
//! 1. A TOML config file
//! 2. Environment variables (override TOML values)
//!
//! Environment variable prefix: PEERSWARM_

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use peerswarm_protocol::PeerId;
use peerswarm_signal::SignalOptions;
use peerswarm_topology::{FullyConnectedTopology, MmstConfig, MmstTopology, StarTopology, Topology};

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Rendezvous servers and RPC tuning.
    #[serde(default)]
    pub signal: SignalConfig,
    /// Topology applied to swarms joined without an explicit one.
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Rendezvous server addresses.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Upper bound on a single RPC call in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
    /// Delay before failed join/leave reconciliation is retried.
    #[serde(default = "default_reconnect_retry")]
    pub reconnect_retry_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    #[default]
    FullyConnected,
    Star,
    Mmst,
}

/// Topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub kind: TopologyKind,
    /// Hub of the star, as a hex peer id. Required for `star`.
    #[serde(default)]
    pub central_peer: Option<String>,
    #[serde(default = "default_originate_connections")]
    pub originate_connections: usize,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "peerswarm_network=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output JSON-formatted logs.
    #[serde(default)]
    pub json_format: bool,
}

// -- Defaults --

fn default_rpc_timeout() -> u64 {
    peerswarm_protocol::RPC_TIMEOUT_MS
}
fn default_reconnect_retry() -> u64 {
    peerswarm_protocol::RECONCILE_RETRY_MS
}
fn default_originate_connections() -> usize {
    peerswarm_protocol::MMST_ORIGINATE_CONNECTIONS
}
fn default_max_peers() -> usize {
    peerswarm_protocol::MMST_MAX_PEERS
}
fn default_sample_size() -> usize {
    peerswarm_protocol::MMST_SAMPLE_SIZE
}
fn default_lookup_timeout() -> u64 {
    peerswarm_protocol::MMST_LOOKUP_TIMEOUT_MS
}
fn default_log_level() -> String {
    "info".to_string()
}

// -- Trait impls --

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            rpc_timeout_ms: default_rpc_timeout(),
            reconnect_retry_ms: default_reconnect_retry(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            kind: TopologyKind::default(),
            central_peer: None,
            originate_connections: default_originate_connections(),
            max_peers: default_max_peers(),
            sample_size: default_sample_size(),
            lookup_timeout_ms: default_lookup_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl From<&SignalConfig> for SignalOptions {
    fn from(config: &SignalConfig) -> Self {
        SignalOptions {
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
            retry_delay: Duration::from_millis(config.reconnect_retry_ms),
        }
    }
}

impl TopologyConfig {
    pub fn mmst(&self) -> MmstConfig {
        MmstConfig {
            originate_connections: self.originate_connections,
            max_peers: self.max_peers,
            sample_size: self.sample_size,
            lookup_timeout: Duration::from_millis(self.lookup_timeout_ms),
        }
    }

    /// Create a fresh topology instance. Each swarm needs its own.
    pub fn build(&self) -> Result<Box<dyn Topology>, anyhow::Error> {
        Ok(match self.kind {
            TopologyKind::FullyConnected => Box::new(FullyConnectedTopology::new()),
            TopologyKind::Mmst => Box::new(MmstTopology::new(self.mmst())),
            TopologyKind::Star => {
                let hub = self
                    .central_peer
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("star topology requires topology.central_peer"))?;
                let hub: PeerId = hub.parse()?;
                Box::new(StarTopology::new(hub))
            }
        })
    }
}

impl NetworkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: NetworkConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with environment variable overrides.
    ///
    /// For example: `PEERSWARM_SIGNAL_SERVERS=10.0.0.1:4000,10.0.0.2:4000`
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut config = if let Some(path) = path {
            if path.exists() {
                Self::from_file(path)?
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not found, using defaults"
                );
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());

        Ok(config)
    }

    /// Apply overrides looked up through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("PEERSWARM_SIGNAL_SERVERS") {
            self.signal.servers = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(val) = var("PEERSWARM_RPC_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.signal.rpc_timeout_ms = ms;
            }
        }
        if let Some(val) = var("PEERSWARM_RECONNECT_RETRY_MS") {
            if let Ok(ms) = val.parse() {
                self.signal.reconnect_retry_ms = ms;
            }
        }
        if let Some(val) = var("PEERSWARM_TOPOLOGY") {
            match val.as_str() {
                "fully-connected" => self.topology.kind = TopologyKind::FullyConnected,
                "star" => self.topology.kind = TopologyKind::Star,
                "mmst" => self.topology.kind = TopologyKind::Mmst,
                other => tracing::warn!(value = other, "Unknown PEERSWARM_TOPOLOGY, ignoring"),
            }
        }
        if let Some(val) = var("PEERSWARM_CENTRAL_PEER") {
            self.topology.central_peer = Some(val);
        }
        if let Some(val) = var("PEERSWARM_MAX_PEERS") {
            if let Ok(n) = val.parse() {
                self.topology.max_peers = n;
            }
        }
        if let Some(val) = var("PEERSWARM_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("PEERSWARM_LOG_JSON") {
            self.logging.json_format = val == "true" || val == "1";
        }
    }

    pub fn signal_options(&self) -> SignalOptions {
        SignalOptions::from(&self.signal)
    }
}
