//! Runtime configuration.
//!
//! Every component has its own config struct with production defaults and a
//! `for_testing()` constructor with short timers. `NodeConfig` bundles them
//! and is what the server binary loads, from JSON plus environment
//! overrides:
//!
//! | Variable               | Field          | Example                                  |
//! |------------------------|----------------|------------------------------------------|
//! | `SCRIBBLE_NODE_ID`     | `node_id`      | `node-a`                                 |
//! | `SCRIBBLE_GOSSIP_BIND` | `gossip_bind`  | `0.0.0.0:7400`                           |
//! | `SCRIBBLE_STORAGE_PATH`| `storage_path` | `/var/lib/scribble`                      |
//! | `SCRIBBLE_PEERS`       | `peers`        | `node-b=ws://10.0.0.2:7400,node-c=ws://…` |
//!
//! Durations are written in milliseconds in JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use scribble_core::{NodeId, DEFAULT_SHARD_COUNT};

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Session entity timers and snapshot cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// No requests for this long → close and passivate. Default: 2 min.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Activity summary tick. Default: 5s.
    #[serde(with = "duration_ms")]
    pub activity_interval: Duration,
    /// Snapshot every N persisted events. 0 disables snapshots. Default: 100.
    pub snapshot_every: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            activity_interval: Duration::from_secs(5),
            snapshot_every: 100,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            idle_timeout: Duration::from_millis(500),
            activity_interval: Duration::from_millis(50),
            snapshot_every: 5,
        }
    }
}

/// Stroke continuity pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Flush a batch at this many inputs. Default: 10.
    pub batch_size: usize,
    /// ...or this long after its first input. Default: 75ms.
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,
    /// Max gap (px) bridged when splicing batches. Default: 250.
    pub splice_distance: f64,
    /// Max age of continuity state that may still be spliced. Default: 200ms.
    #[serde(with = "duration_ms")]
    pub splice_window: Duration,
    /// Continuity state older than this is evicted. Also the sweep interval. Default: 30s.
    #[serde(with = "duration_ms")]
    pub inactivity_timeout: Duration,
    /// Input queue capacity; the oldest inputs are dropped on overflow. Default: 1000.
    pub queue_capacity: usize,
    /// Commands awaiting a reply at once. Default: 10.
    pub max_in_flight: usize,
    /// Per-command reply deadline. Default: 2s.
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_window: Duration::from_millis(75),
            splice_distance: 250.0,
            splice_window: Duration::from_millis(200),
            inactivity_timeout: Duration::from_secs(30),
            queue_capacity: 1000,
            max_in_flight: 10,
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_window: Duration::from_millis(10),
            inactivity_timeout: Duration::from_secs(1),
            queue_capacity: 64,
            command_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

/// Local session proxy behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Subscribe retry period until acknowledged. Default: 500ms.
    #[serde(with = "duration_ms")]
    pub subscribe_retry: Duration,
    /// Shut down after this long idle with no output channels. Default: 15 min.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Events buffered per output channel before new ones are dropped. Default: 256.
    pub channel_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            subscribe_retry: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(15 * 60),
            channel_capacity: 256,
        }
    }
}

impl ProxyConfig {
    pub fn for_testing() -> Self {
        Self {
            subscribe_retry: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(2),
            channel_capacity: 64,
        }
    }
}

/// Distributed activity index timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Majority write acknowledgement deadline. Default: 3s.
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    /// Tombstone pruning period. Default: 30 min.
    #[serde(with = "duration_ms")]
    pub prune_interval: Duration,
    /// Tombstones younger than this survive a prune. Default: 30 min.
    #[serde(with = "duration_ms")]
    pub tombstone_ttl: Duration,
    /// Reader push period to index subscribers. Default: 5s.
    #[serde(with = "duration_ms")]
    pub publish_interval: Duration,
    /// Anti-entropy round period. Default: 1s.
    #[serde(with = "duration_ms")]
    pub gossip_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(3),
            prune_interval: Duration::from_secs(30 * 60),
            tombstone_ttl: Duration::from_secs(30 * 60),
            publish_interval: Duration::from_secs(5),
            gossip_interval: Duration::from_secs(1),
        }
    }
}

impl IndexConfig {
    pub fn for_testing() -> Self {
        Self {
            write_timeout: Duration::from_millis(500),
            prune_interval: Duration::from_secs(60),
            tombstone_ttl: Duration::from_secs(60),
            publish_interval: Duration::from_millis(50),
            gossip_interval: Duration::from_millis(50),
        }
    }
}

/// A gossip peer: its node id and WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub url: String,
}

/// Everything a node needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Gossip listen address. `None` = no inbound gossip.
    pub gossip_bind: Option<String>,
    pub peers: Vec<PeerConfig>,
    /// RocksDB journal directory. `None` = in-memory journal.
    pub storage_path: Option<PathBuf>,
    pub shard_count: u32,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub proxy: ProxyConfig,
    pub index: IndexConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node-1"),
            gossip_bind: None,
            peers: Vec::new(),
            storage_path: None,
            shard_count: DEFAULT_SHARD_COUNT,
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            proxy: ProxyConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl NodeConfig {
    /// In-memory node with short timers.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: NodeId::from(node_id),
            session: SessionConfig::for_testing(),
            pipeline: PipelineConfig::for_testing(),
            proxy: ProxyConfig::for_testing(),
            index: IndexConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Applies `SCRIBBLE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(node_id) = lookup("SCRIBBLE_NODE_ID") {
            self.node_id = NodeId::new(node_id);
        }
        if let Some(bind) = lookup("SCRIBBLE_GOSSIP_BIND") {
            self.gossip_bind = Some(bind);
        }
        if let Some(path) = lookup("SCRIBBLE_STORAGE_PATH") {
            self.storage_path = Some(PathBuf::from(path));
        }
        if let Some(peers) = lookup("SCRIBBLE_PEERS") {
            self.peers = parse_peers(&peers)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::Invalid("shard_count must be positive".into()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.batch_size must be positive".into()));
        }
        if self.pipeline.max_in_flight == 0 {
            return Err(ConfigError::Invalid("pipeline.max_in_flight must be positive".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid("pipeline.queue_capacity must be positive".into()));
        }
        if self.pipeline.splice_distance.is_nan() || self.pipeline.splice_distance <= 0.0 {
            return Err(ConfigError::Invalid("pipeline.splice_distance must be positive".into()));
        }
        if self.proxy.channel_capacity == 0 {
            return Err(ConfigError::Invalid("proxy.channel_capacity must be positive".into()));
        }
        if let Some((name, _)) = self.periods().into_iter().find(|(_, period)| period.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        Ok(())
    }
}

impl NodeConfig {
    /// Timer periods and deadlines. Zero is never valid for these.
    fn periods(&self) -> [(&'static str, Duration); 11] {
        [
            ("session.idle_timeout", self.session.idle_timeout),
            ("session.activity_interval", self.session.activity_interval),
            ("pipeline.batch_window", self.pipeline.batch_window),
            ("pipeline.inactivity_timeout", self.pipeline.inactivity_timeout),
            ("pipeline.command_timeout", self.pipeline.command_timeout),
            ("proxy.subscribe_retry", self.proxy.subscribe_retry),
            ("proxy.idle_timeout", self.proxy.idle_timeout),
            ("index.write_timeout", self.index.write_timeout),
            ("index.prune_interval", self.index.prune_interval),
            ("index.publish_interval", self.index.publish_interval),
            ("index.gossip_interval", self.index.gossip_interval),
        ]
    }
}

/// Parses `id=url,id=url`.
fn parse_peers(value: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (node_id, url) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::Invalid(format!("peer entry '{entry}' is not id=url")))?;
            Ok(PeerConfig {
                node_id: NodeId::from(node_id.trim()),
                url: url.trim().to_string(),
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.shard_count, 50);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.session.snapshot_every, 100);
        assert_eq!(config.pipeline.batch_size, 10);
        assert_eq!(config.pipeline.batch_window, Duration::from_millis(75));
        assert_eq!(config.pipeline.max_in_flight, 10);
        assert_eq!(config.proxy.subscribe_retry, Duration::from_millis(500));
        assert_eq!(config.index.write_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{
                "node_id": "node-b",
                "gossip_bind": "127.0.0.1:7401",
                "peers": [{ "node_id": "node-a", "url": "ws://127.0.0.1:7400" }],
                "session": { "idle_timeout": 1000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.node_id, NodeId::from("node-b"));
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(1));
        assert_eq!(config.session.activity_interval, Duration::from_secs(5));
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_json_roundtrip_keeps_millis() {
        let config = NodeConfig::for_testing("n");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(NodeConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SCRIBBLE_NODE_ID", "node-c"),
            ("SCRIBBLE_PEERS", "node-a=ws://a:1, node-b=ws://b:2"),
            ("SCRIBBLE_STORAGE_PATH", "/tmp/scribble"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node_id, NodeId::from("node-c"));
        assert_eq!(config.peers[1].url, "ws://b:2");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/scribble")));
        assert!(config.gossip_bind.is_none());
    }

    #[test]
    fn test_bad_peer_entry() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_overrides(|key| (key == "SCRIBBLE_PEERS").then(|| "garbage".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_self_peer() {
        let mut config = NodeConfig::for_testing("a");
        config.peers.push(PeerConfig {
            node_id: NodeId::from("a"),
            url: "ws://localhost:1".into(),
        });
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.shard_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let zeroed: [(&str, fn(&mut NodeConfig)); 11] = [
            ("session.idle_timeout", |c| c.session.idle_timeout = Duration::ZERO),
            ("session.activity_interval", |c| c.session.activity_interval = Duration::ZERO),
            ("pipeline.batch_window", |c| c.pipeline.batch_window = Duration::ZERO),
            ("pipeline.inactivity_timeout", |c| c.pipeline.inactivity_timeout = Duration::ZERO),
            ("pipeline.command_timeout", |c| c.pipeline.command_timeout = Duration::ZERO),
            ("proxy.subscribe_retry", |c| c.proxy.subscribe_retry = Duration::ZERO),
            ("proxy.idle_timeout", |c| c.proxy.idle_timeout = Duration::ZERO),
            ("index.write_timeout", |c| c.index.write_timeout = Duration::ZERO),
            ("index.prune_interval", |c| c.index.prune_interval = Duration::ZERO),
            ("index.publish_interval", |c| c.index.publish_interval = Duration::ZERO),
            ("index.gossip_interval", |c| c.index.gossip_interval = Duration::ZERO),
        ];
        for (name, zero) in zeroed {
            let mut config = NodeConfig::for_testing("a");
            zero(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid(message)) => assert!(message.contains(name), "{message}"),
                other => panic!("{name}: expected rejection, got {other:?}"),
            }
        }

        // Zero is fine where it only disables something
        let mut config = NodeConfig::for_testing("a");
        config.pipeline.splice_window = Duration::ZERO;
        config.session.snapshot_every = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_period_in_json_is_rejected() {
        let config = NodeConfig::from_json_str(r#"{ "session": { "activity_interval": 0 } }"#).unwrap();
        assert!(config.validate().is_err());
    }
}
