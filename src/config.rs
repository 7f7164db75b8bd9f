//! Node configuration.
//!
//! Loaded from TOML with every field optional; missing fields take the
//! defaults below. Key and database paths are templates where `{port}` is
//! replaced by the node's listening port, so several nodes can share one
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::network::NetworkConfig;
use crate::peers::DEFAULT_MAX_PEERS;
use crate::replication::ReplicationConfig;

/// Result type for config operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Everything needed to start a [`Node`](crate::node::Node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host to bind the peer listener on.
    pub listen_addr: String,
    /// Peer port; `0` picks an ephemeral port.
    ///
    /// The port is substituted into `{port}` key and database templates
    /// after binding, so a persistent node on an ephemeral port gets a new
    /// identity and an empty store on every start. Set a fixed port, or
    /// templates without `{port}`, to keep them.
    pub port: u16,
    /// `host:port` addresses to join through.
    pub seeds: Vec<String>,
    /// Declared storage capacity in bytes, advertised to peers.
    pub disk_allocated: u64,
    pub key_file: String,
    pub database_file: String,
    /// Base directory for relative key/database templates.
    pub data_dir: Option<PathBuf>,
    /// Keep triples in memory only and use a throwaway identity.
    pub in_memory: bool,

    pub fanout: usize,
    pub max_hops: u8,
    pub liveness_timeout_secs: u64,
    /// Known-peer count past which peers learned second-hand are ignored.
    pub max_peers: usize,
    pub dial_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub seen_ttl_secs: u64,
    pub seen_capacity: usize,
    pub maintenance_interval_ms: u64,
    pub peer_sample_size: usize,
    pub outbound_queue: usize,
    pub send_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub reconcile_on_connect: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 0,
            seeds: Vec::new(),
            disk_allocated: 1 << 30,
            key_file: "degdb-{port}.key".into(),
            database_file: "degdb-{port}.db".into(),
            data_dir: None,
            in_memory: false,
            fanout: 4,
            max_hops: 6,
            liveness_timeout_secs: 60,
            max_peers: DEFAULT_MAX_PEERS,
            dial_timeout_ms: 3_000,
            handshake_timeout_ms: 3_000,
            seen_ttl_secs: 120,
            seen_capacity: 10_000,
            maintenance_interval_ms: 5_000,
            peer_sample_size: 8,
            outbound_queue: 256,
            send_timeout_ms: 5_000,
            max_frame_bytes: 16 * 1024 * 1024,
            reconcile_on_connect: true,
        }
    }
}

impl NodeConfig {
    /// Loopback node on an ephemeral port with no files on disk.
    pub fn memory_only() -> Self {
        Self {
            listen_addr: "127.0.0.1".into(),
            in_memory: true,
            ..Default::default()
        }
    }

    /// A node keeping its key and database under `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Check every seed is a `host:port` pair.
    pub fn validate(&self) -> ConfigResult<()> {
        for seed in &self.seeds {
            let valid = seed
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::InvalidSeed { addr: seed.clone() });
            }
        }
        Ok(())
    }

    /// The key file for a node bound to `port`.
    pub fn key_path(&self, port: u16) -> PathBuf {
        self.resolve(&self.key_file, port)
    }

    /// The database file for a node bound to `port`.
    pub fn database_path(&self, port: u16) -> PathBuf {
        self.resolve(&self.database_file, port)
    }

    /// Whether on-disk paths depend on a port that changes every start.
    pub fn paths_follow_ephemeral_port(&self) -> bool {
        self.port == 0
            && !self.in_memory
            && (self.key_file.contains("{port}") || self.database_file.contains("{port}"))
    }

    fn resolve(&self, template: &str, port: u16) -> PathBuf {
        let path = PathBuf::from(template.replace("{port}", &port.to_string()));
        match &self.data_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            outbound_queue: self.outbound_queue.max(1),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
            peer_sample_size: self.peer_sample_size,
        }
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            fanout: self.fanout,
            max_hops: self.max_hops,
            seen_ttl: Duration::from_secs(self.seen_ttl_secs),
            seen_capacity: self.seen_capacity,
            maintenance_interval: Duration::from_millis(self.maintenance_interval_ms.max(1)),
            peer_sample_size: self.peer_sample_size,
            reconcile_on_connect: self.reconcile_on_connect,
            max_frame_bytes: self.max_frame_bytes,
            seeds: self.seeds.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.fanout, 4);
        assert_eq!(config.disk_allocated, 1 << 30);
    }

    #[test]
    fn partial_toml_overrides_only_given_fields() {
        let config: NodeConfig = toml::from_str(
            r#"
            port = 7400
            seeds = ["10.0.0.1:7400"]
            max_hops = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 7400);
        assert_eq!(config.max_hops, 3);
        assert_eq!(config.liveness_timeout_secs, 60);
    }

    #[test]
    fn templates_substitute_port_under_data_dir() {
        let config = NodeConfig::in_dir("/var/lib/degdb");
        assert_eq!(
            config.key_path(7400),
            PathBuf::from("/var/lib/degdb/degdb-7400.key")
        );
        assert_eq!(
            config.database_path(7401),
            PathBuf::from("/var/lib/degdb/degdb-7401.db")
        );
    }

    #[test]
    fn absolute_template_ignores_data_dir() {
        let config = NodeConfig {
            database_file: "/tmp/node-{port}.db".into(),
            ..NodeConfig::in_dir("/elsewhere")
        };
        assert_eq!(config.database_path(1), PathBuf::from("/tmp/node-1.db"));
    }

    #[test]
    fn ephemeral_port_with_port_templates_is_flagged() {
        assert!(NodeConfig::default().paths_follow_ephemeral_port());
        assert!(!NodeConfig::memory_only().paths_follow_ephemeral_port());

        let fixed_port = NodeConfig {
            port: 7400,
            ..Default::default()
        };
        assert!(!fixed_port.paths_follow_ephemeral_port());

        let fixed_names = NodeConfig {
            key_file: "node.key".into(),
            database_file: "node.db".into(),
            ..Default::default()
        };
        assert!(!fixed_names.paths_follow_ephemeral_port());
    }

    #[test]
    fn bad_seed_is_rejected() {
        let config = NodeConfig {
            seeds: vec!["localhost".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSeed { .. })
        ));
        let ok = NodeConfig {
            seeds: vec!["[::1]:7400".into(), "node.example:80".into()],
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conf").join("node.toml");
        let config = NodeConfig {
            port: 9000,
            seeds: vec!["127.0.0.1:9001".into()],
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = NodeConfig::load(Path::new("/nonexistent/degdb.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
