//! Configuration for DriftKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DriftError, Result};

/// Main configuration for a DriftKV store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Table Geometry
    // -------------------------------------------------------------------------
    /// Number of independently locked segments
    pub segments: usize,

    /// Expected number of entries across all segments
    pub entries: u64,

    /// Average encoded key size (bytes), used to size arenas
    pub average_key_size: usize,

    /// Average encoded value size (bytes), used to size arenas
    pub average_value_size: usize,

    // -------------------------------------------------------------------------
    // Locking / Reclamation
    // -------------------------------------------------------------------------
    /// Segment lock acquisition timeout. `None` blocks indefinitely.
    pub lock_timeout: Option<Duration>,

    /// How long a tombstone is kept before its slot is reused.
    /// Only applies when replication is enabled.
    pub removed_entry_cleanup_timeout: Duration,

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------
    /// Back the arenas with this file instead of anonymous memory
    pub persist_path: Option<PathBuf>,

    // -------------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------------
    pub replication: Option<ReplicationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segments: 16,
            entries: 1 << 16,
            average_key_size: 16,
            average_value_size: 64,
            lock_timeout: None,
            removed_entry_cleanup_timeout: Duration::from_secs(60),
            persist_path: None,
            replication: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Origin id stamped on local mutations (0 without replication)
    pub fn node_id(&self) -> u8 {
        self.replication.as_ref().map(|r| r.node_id).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            return Err(DriftError::Config("segments must be at least 1".to_string()));
        }
        if self.segments > u32::MAX as usize {
            return Err(DriftError::Config(format!(
                "too many segments: {}",
                self.segments
            )));
        }
        if self.entries == 0 {
            return Err(DriftError::Config("entries must be at least 1".to_string()));
        }
        if let Some(replication) = &self.replication {
            replication.validate()?;
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn segments(mut self, count: usize) -> Self {
        self.config.segments = count;
        self
    }

    pub fn entries(mut self, count: u64) -> Self {
        self.config.entries = count;
        self
    }

    pub fn average_key_size(mut self, bytes: usize) -> Self {
        self.config.average_key_size = bytes;
        self
    }

    pub fn average_value_size(mut self, bytes: usize) -> Self {
        self.config.average_value_size = bytes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    pub fn removed_entry_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.config.removed_entry_cleanup_timeout = timeout;
        self
    }

    /// Persist arenas to a memory mapped file
    pub fn persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.persist_path = Some(path.into());
        self
    }

    pub fn replication(mut self, replication: ReplicationConfig) -> Self {
        self.config.replication = Some(replication);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Replication identity and TCP transport parameters
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// This node's id, unique among peers (1..=255)
    pub node_id: u8,

    /// Accept peer connections on this address
    pub listen_addr: Option<String>,

    /// Peers to connect to
    pub endpoints: Vec<String>,

    /// Send a heartbeat after this long without outbound traffic
    pub heartbeat_interval: Duration,

    /// Treat the connection as dead after this long without inbound traffic
    pub heartbeat_timeout: Duration,

    pub connect_timeout: Duration,

    /// Reconnect dropped outbound connections
    pub auto_reconnect: bool,

    pub reconnect_backoff_initial: Duration,

    pub reconnect_backoff_max: Duration,

    /// Socket buffer capacity for reader and writer
    pub tcp_buffer_size: usize,

    /// Pending mutations per peer before the link is dropped
    pub outbound_queue_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: None,
            endpoints: Vec::new(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            auto_reconnect: true,
            reconnect_backoff_initial: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_secs(5),
            tcp_buffer_size: 64 * 1024,
            outbound_queue_capacity: 64 * 1024,
        }
    }
}

impl ReplicationConfig {
    pub fn builder(node_id: u8) -> ReplicationConfigBuilder {
        ReplicationConfigBuilder {
            config: ReplicationConfig {
                node_id,
                ..ReplicationConfig::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(DriftError::Config(
                "replication node id 0 is reserved for unreplicated stores".to_string(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(DriftError::Config(format!(
                "heartbeat timeout {:?} must exceed heartbeat interval {:?}",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(DriftError::Config(
                "outbound queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ReplicationConfig
pub struct ReplicationConfigBuilder {
    config: ReplicationConfig,
}

impl ReplicationConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = Some(addr.into());
        self
    }

    /// Add a peer to connect to
    pub fn endpoint(mut self, addr: impl Into<String>) -> Self {
        self.config.endpoints.push(addr.into());
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff_initial = initial;
        self.config.reconnect_backoff_max = max;
        self
    }

    pub fn tcp_buffer_size(mut self, bytes: usize) -> Self {
        self.config.tcp_buffer_size = bytes;
        self
    }

    pub fn outbound_queue_capacity(mut self, count: usize) -> Self {
        self.config.outbound_queue_capacity = count;
        self
    }

    pub fn build(self) -> ReplicationConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert_eq!(Config::default().node_id(), 0);
    }

    #[test]
    fn test_zero_segments_rejected() {
        let config = Config::builder().segments(0).build();
        assert!(matches!(config.validate(), Err(DriftError::Config(_))));
    }

    #[test]
    fn test_replication_node_zero_rejected() {
        let config = Config::builder()
            .replication(ReplicationConfig::builder(0).build())
            .build();
        assert!(matches!(config.validate(), Err(DriftError::Config(_))));
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let replication = ReplicationConfig::builder(1)
            .heartbeat_interval(Duration::from_secs(2))
            .heartbeat_timeout(Duration::from_secs(1))
            .build();
        assert!(replication.validate().is_err());
    }

    #[test]
    fn test_builder_sets_node_id() {
        let config = Config::builder()
            .replication(ReplicationConfig::builder(7).endpoint("127.0.0.1:9000").build())
            .build();
        assert_eq!(config.node_id(), 7);
        assert_eq!(config.replication.unwrap().endpoints, vec!["127.0.0.1:9000"]);
    }
}
