//! Configuration for the ledger engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Engine configuration
///
/// All durations are milliseconds. Defaults match a single-node engine with
/// one partition, Bloom deduplication and rendezvous routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for all partition data
    pub base_dir: PathBuf,

    /// Engine name; isolates multiple engines under `base_dir`
    pub engine_name: String,

    /// Number of partition workers
    pub partitions: usize,

    /// Async-writer FIFO capacity
    pub queue_size: usize,

    /// Max batch handed to the persister
    pub batch_size: usize,

    /// Count trigger: records since last snapshot
    pub snapshot_interval: u64,

    /// Toggle for the time-based snapshot trigger
    pub enable_time_snapshot: bool,

    /// Time trigger duration (milliseconds)
    pub snapshot_time_interval_ms: u64,

    /// Heartbeat period for the partition sentinel event (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Idempotency filter selection
    pub idempotency: IdempotencyKind,

    /// Routing strategy selection
    pub routing: RoutingKind,

    /// Prefix for emitted metric names
    pub metrics_prefix: String,

    /// Filter sizing
    pub filter: FilterConfig,

    /// WAL tuning
    pub wal: WalConfig,

    /// Cross-node routing self-check
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            engine_name: "ledger".to_string(),
            partitions: 1,
            queue_size: 65536,
            batch_size: 1000,
            snapshot_interval: 50_000,
            enable_time_snapshot: true,
            snapshot_time_interval_ms: 600_000,
            heartbeat_interval_ms: 10_000,
            idempotency: IdempotencyKind::Bloom,
            routing: RoutingKind::Rendezvous,
            metrics_prefix: "ledger".to_string(),
            filter: FilterConfig::default(),
            wal: WalConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

/// Idempotency filter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyKind {
    /// Probabilistic Bloom filter: tiny memory, rare false duplicates
    Bloom,
    /// Exact LRU set: precise, bounded capacity
    Lru,
}

/// Routing strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKind {
    /// `hash(key) % n`; fast but unstable under resize
    Modulo,
    /// Highest-random-weight; O(1/n) migration on resize
    Rendezvous,
}

/// Idempotency filter sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// LRU capacity (keys)
    pub lru_capacity: usize,

    /// Bloom expected insertions
    pub bloom_expected_items: usize,

    /// Bloom false positive rate
    pub bloom_false_positive_rate: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            lru_capacity: 500_000,
            bloom_expected_items: 10_000_000,
            bloom_false_positive_rate: 0.00001,
        }
    }
}

/// WAL store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Segment capacity in bytes
    pub segment_size: u64,

    /// Durability boundary per append
    pub sync_mode: WalSyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            sync_mode: WalSyncMode::Async,
        }
    }
}

/// Sync mode for WAL appends
///
/// Shutdown always forces a full flush regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncMode {
    /// No per-append flush; the OS writes pages back
    None,
    /// Schedule asynchronous write-back after each append
    #[default]
    Async,
    /// Synchronous flush after each append
    Sync,
}

/// Cluster routing self-check
///
/// With `total_nodes > 1` the engine verifies on submit that the command's
/// key routes to `node_id`; a mismatch is a routing error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Total nodes participating in key ownership
    pub total_nodes: usize,

    /// This node's id, `0 <= node_id < total_nodes`
    pub node_id: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            total_nodes: 1,
            node_id: 0,
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("LEDGER_BASE_DIR") {
            config.base_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("LEDGER_ENGINE_NAME") {
            config.engine_name = name;
        }
        if let Ok(n) = std::env::var("LEDGER_PARTITIONS") {
            config.partitions = n
                .parse()
                .map_err(|_| Error::Config(format!("Invalid LEDGER_PARTITIONS: {}", n)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Initialization(
                "Partition count must be greater than 0".to_string(),
            ));
        }
        if self.queue_size == 0 || self.batch_size == 0 {
            return Err(Error::Initialization(
                "queue_size and batch_size must be greater than 0".to_string(),
            ));
        }
        if self.engine_name.is_empty() {
            return Err(Error::Initialization("engine_name must not be empty".to_string()));
        }
        if self.cluster.total_nodes == 0 {
            return Err(Error::Initialization(
                "cluster.total_nodes must be at least 1".to_string(),
            ));
        }
        if self.cluster.node_id >= self.cluster.total_nodes {
            return Err(Error::Initialization(format!(
                "cluster.node_id must be between 0 and {}",
                self.cluster.total_nodes - 1
            )));
        }
        if !(0.0..1.0).contains(&self.filter.bloom_false_positive_rate)
            || self.filter.bloom_false_positive_rate <= 0.0
        {
            return Err(Error::Initialization(
                "bloom_false_positive_rate must be in (0, 1)".to_string(),
            ));
        }
        if self.wal.segment_size < 4096 {
            return Err(Error::Initialization(
                "wal.segment_size must be at least 4096 bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Data directory for one partition:
    /// `<base_dir>/<engine_name>/[node-<id>/]<engine_name>-p<k>`
    pub fn partition_dir(&self, partition: usize) -> PathBuf {
        let mut dir = self.base_dir.join(&self.engine_name);
        if self.cluster.total_nodes > 1 {
            dir = dir.join(format!("node-{}", self.cluster.node_id));
        }
        dir.join(format!("{}-p{}", self.engine_name, partition))
    }

    /// Partition display name: `<engine_name>-p<k>`
    pub fn partition_name(&self, partition: usize) -> String {
        format!("{}-p{}", self.engine_name, partition)
    }
}
