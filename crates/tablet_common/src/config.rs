use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TabletError, TabletResult};

/// Top-level executor configuration (one instance per tablet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Id of the owning tablet. Blobs labelled with another tablet id are borrowed.
    pub tablet_id: u64,
    /// Current tablet generation.
    #[serde(default = "default_generation")]
    pub generation: u32,
    /// Followers replay part switches from the leader and never write.
    #[serde(default)]
    pub follower: bool,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

fn default_generation() -> u32 {
    1
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tablet_id: 1,
            generation: 1,
            follower: false,
            scheduler: SchedulerConfig::default(),
            memory: MemoryConfig::default(),
            lease: LeaseConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> TabletResult<Self> {
        let config: ExecutorConfig =
            toml::from_str(text).map_err(|e| TabletError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> TabletResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> TabletResult<()> {
        if self.tablet_id == 0 {
            return Err(TabletError::Config("tablet_id must be non-zero".into()));
        }
        if self.scheduler.initial_tx_memory == 0 {
            return Err(TabletError::Config(
                "scheduler.initial_tx_memory must be non-zero".into(),
            ));
        }
        if self.scheduler.tx_memory_limit != 0
            && self.scheduler.tx_memory_limit < self.scheduler.initial_tx_memory
        {
            return Err(TabletError::Config(format!(
                "scheduler.tx_memory_limit ({}) is below initial_tx_memory ({})",
                self.scheduler.tx_memory_limit, self.scheduler.initial_tx_memory
            )));
        }
        if self.lease.initial_duration_ms == 0 {
            return Err(TabletError::Config(
                "lease.initial_duration_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Admission and activation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum transactions in flight before new seats go to the pending queue (0 = unlimited).
    pub max_tx_in_fly: u64,
    /// Static memory reserved for every new seat (bytes).
    pub initial_tx_memory: u64,
    /// Hard per-seat memory limit; a seat above it is terminated (0 = unlimited).
    pub tx_memory_limit: u64,
    /// Allow small redo entries to be batched into a later commit.
    pub allow_log_batching: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tx_in_fly: 0,
            initial_tx_memory: 256 * 1024,
            tx_memory_limit: 0,
            allow_log_batching: false,
        }
    }
}

/// Static memory pool shared by all seats of the tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes available without asking the resource broker.
    pub static_limit: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            static_limit: 64 * 1024 * 1024,
        }
    }
}

/// Read-only lease tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease duration before any adaptive doubling (milliseconds).
    pub initial_duration_ms: u64,
    /// Extensions without any lease use before extension stops.
    pub max_unused_extensions: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            initial_duration_ms: 250,
            max_unused_extensions: 5,
        }
    }
}

/// Part switch encoding for compaction results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Write slice deltas for reused bundles. When false, reused bundles are
    /// written as full legacy + opaque overlays.
    pub write_bundle_deltas: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            write_bundle_deltas: true,
        }
    }
}
