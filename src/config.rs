//! WolfKV Configuration
//!
//! File configuration for the node daemon, and the runtime cluster
//! configuration a node is created with.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::PeerIdentity;

/// Main WolfKV configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfKvConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterSection,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name peers use to reach this node
    pub host: String,

    /// Port for cluster communication
    pub port: u16,

    /// Address to bind for cluster communication (defaults to all interfaces)
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Data directory for the local store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// How far a write must propagate before it completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Replicate to peers that announced readiness; others catch up later
    #[default]
    Semisync,
    /// Replicate to every configured peer; unreachable peers fail the write
    Sync,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Semisync => write!(f, "semisync"),
            ReplicationMode::Sync => write!(f, "sync"),
        }
    }
}

/// Cluster configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Peer node addresses (host:port)
    #[serde(default)]
    pub peers: Vec<String>,

    /// Replication mode
    #[serde(default)]
    pub mode: ReplicationMode,

    /// Expiry applied to commits without one, in seconds (0 = none)
    #[serde(default)]
    pub default_ttl_secs: u64,

    /// Connection polls before a write gives up on a peer
    #[serde(default = "default_fail_after")]
    pub fail_after: u32,

    /// Interval between connection polls during a write
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Interval between connection polls while serving a full sync
    #[serde(default = "default_sync_poll_interval_ms")]
    pub sync_poll_interval_ms: u64,

    /// Delay before re-dialing a lost peer
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Dial timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_fail_after() -> u32 {
    100
}

fn default_retry_interval_ms() -> u64 {
    10
}

fn default_sync_poll_interval_ms() -> u64 {
    500
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfkv")
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            mode: ReplicationMode::default(),
            default_ttl_secs: 0,
            fail_after: default_fail_after(),
            retry_interval_ms: default_retry_interval_ms(),
            sync_poll_interval_ms: default_sync_poll_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfKvConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfKvConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.identity().validate()?;

        if self.cluster.fail_after == 0 {
            return Err(crate::Error::Config("cluster.fail_after must be at least 1".into()));
        }

        for peer in &self.cluster.peers {
            peer.parse::<PeerIdentity>()?;
        }

        Ok(())
    }

    /// This node's identity
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.node.host.clone(), self.node.port)
    }

    /// Address the cluster listener binds to
    pub fn bind_address(&self) -> String {
        self.node
            .bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.node.port))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the local store database
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("store.db")
    }

    /// Build the runtime cluster configuration
    pub fn cluster_config(&self) -> crate::Result<ClusterConfig> {
        let identity = self.identity();
        let mut peers: Vec<PeerIdentity> = Vec::with_capacity(self.cluster.peers.len());

        for entry in &self.cluster.peers {
            let peer: PeerIdentity = entry.parse()?;
            if peer == identity {
                tracing::warn!("Ignoring own address {} in peer list", peer);
                continue;
            }
            if peers.contains(&peer) {
                tracing::warn!("Ignoring duplicate peer {}", peer);
                continue;
            }
            peers.push(peer);
        }

        let cluster = &self.cluster;
        Ok(ClusterConfig {
            identity,
            peers,
            mode: cluster.mode,
            default_ttl: (cluster.default_ttl_secs > 0)
                .then(|| Duration::from_secs(cluster.default_ttl_secs)),
            fail_after: cluster.fail_after,
            retry_interval: Duration::from_millis(cluster.retry_interval_ms),
            sync_poll_interval: Duration::from_millis(cluster.sync_poll_interval_ms),
            reconnect_interval: Duration::from_millis(cluster.reconnect_interval_ms),
            connect_timeout: Duration::from_millis(cluster.connect_timeout_ms),
        })
    }
}

/// Runtime configuration of one node
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's identity
    pub identity: PeerIdentity,
    /// Statically configured peers
    pub peers: Vec<PeerIdentity>,
    pub mode: ReplicationMode,
    /// Expiry applied to commits without one
    pub default_ttl: Option<Duration>,
    /// Connection polls before a write gives up on a peer
    pub fail_after: u32,
    pub retry_interval: Duration,
    pub sync_poll_interval: Duration,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
}

impl ClusterConfig {
    /// Defaults for a node at `host:port` with no peers
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            identity: PeerIdentity::new(host, port),
            peers: Vec::new(),
            mode: ReplicationMode::default(),
            default_ttl: None,
            fail_after: default_fail_after(),
            retry_interval: Duration::from_millis(default_retry_interval_ms()),
            sync_poll_interval: Duration::from_millis(default_sync_poll_interval_ms()),
            reconnect_interval: Duration::from_millis(default_reconnect_interval_ms()),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
        }
    }

    /// Add a configured peer
    pub fn with_peer(mut self, peer: PeerIdentity) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn with_mode(mut self, mode: ReplicationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fail_after(mut self, fail_after: u32) -> Self {
        self.fail_after = fail_after;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Validate identities and bounds
    pub fn validate(&self) -> crate::Result<()> {
        self.identity.validate()?;
        for peer in &self.peers {
            peer.validate()?;
        }
        if self.fail_after == 0 {
            return Err(crate::Error::Config("fail_after must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
host = "node-1"
port = 7654
data_dir = "/var/lib/wolfkv"

[cluster]
peers = ["node-2:7654", "node-3:7654"]
mode = "sync"
default_ttl_secs = 60
"#;

        let config = WolfKvConfig::from_str(toml).unwrap();
        assert_eq!(config.node.host, "node-1");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.mode, ReplicationMode::Sync);
        assert_eq!(config.bind_address(), "0.0.0.0:7654");
        assert!(config.api.enabled);

        let cluster = config.cluster_config().unwrap();
        assert_eq!(cluster.peers[1], PeerIdentity::new("node-3", 7654));
        assert_eq!(cluster.default_ttl, Some(Duration::from_secs(60)));
        assert_eq!(cluster.fail_after, 100);
        assert_eq!(cluster.retry_interval, Duration::from_millis(10));
        assert_eq!(cluster.sync_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_peers_deduplicated() {
        let toml = r#"
[node]
host = "node-1"
port = 7654

[cluster]
peers = ["node-2:7654", "node-1:7654", "node-2:7654"]
"#;

        let cluster = WolfKvConfig::from_str(toml).unwrap().cluster_config().unwrap();
        assert_eq!(cluster.peers, vec![PeerIdentity::new("node-2", 7654)]);
        assert_eq!(cluster.default_ttl, None);
        assert_eq!(cluster.mode, ReplicationMode::Semisync);
    }

    #[test]
    fn test_invalid_config() {
        let bad_peer = "[node]\nhost = \"a\"\nport = 1\n[cluster]\npeers = [\"nope\"]\n";
        assert!(WolfKvConfig::from_str(bad_peer).is_err());

        let bad_fail_after = "[node]\nhost = \"a\"\nport = 1\n[cluster]\nfail_after = 0\n";
        assert!(WolfKvConfig::from_str(bad_fail_after).is_err());

        let bad_port = "[node]\nhost = \"a\"\nport = 0\n";
        assert!(WolfKvConfig::from_str(bad_port).is_err());
    }
}
