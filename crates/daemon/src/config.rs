// Daemon configuration at `~/.mcpd/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{RelationshipGraph, RetryPolicy};
use crate::events::EventBusSettings;
use crate::store::EntityKind;

/// Root directory for daemon state: `~/.mcpd/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mcpd"))
}

/// Path to the config file: `~/.mcpd/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: ExecutionConfig,
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
    pub bootstrap: BootstrapConfig,
}

impl EngineConfig {
    /// Load from `~/.mcpd/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

// ── Sections ───────────────────────────────────────────────────────

/// Worker pool and per-call limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Pool workers running synchronous units.
    pub workers: usize,
    /// Submission queue depth; `dispatch` waits when it is full.
    pub queue_capacity: usize,
    /// Async units allowed in flight at once.
    pub async_concurrency: usize,
    pub call_timeout_ms: u64,
    /// Results larger than this are moved to the blob store.
    pub externalize_threshold_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            async_concurrency: 64,
            call_timeout_ms: 30_000,
            externalize_threshold_bytes: 256 * 1024,
        }
    }
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// Where bundles are extracted. Defaults to `~/.mcpd/bundles`.
    pub bundle_root: Option<PathBuf>,
    /// Directory served by the local blob store in standalone mode.
    pub blob_root: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn bundle_root(&self) -> PathBuf {
        self.bundle_root
            .clone()
            .or_else(|| global_dir().map(|d| d.join("bundles")))
            .unwrap_or_else(|| std::env::temp_dir().join("mcpd-bundles"))
    }

    pub fn blob_root(&self) -> PathBuf {
        self.blob_root
            .clone()
            .or_else(|| global_dir().map(|d| d.join("blobs")))
            .unwrap_or_else(|| std::env::temp_dir().join("mcpd-blobs"))
    }
}

/// Toggles upward invalidation on one edge of the relationship graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipOverride {
    pub parent: String,
    pub child: String,
    pub upward: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_sec: u64,
    pub max_cascade_depth: usize,
    pub purge_retry_attempts: u32,
    pub purge_retry_base_ms: u64,
    pub relationships: Vec<RelationshipOverride>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_sec: 300,
            max_cascade_depth: 3,
            purge_retry_attempts: 3,
            purge_retry_base_ms: 50,
            relationships: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_sec)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { attempts: self.purge_retry_attempts, base_delay: Duration::from_millis(self.purge_retry_base_ms) }
    }

    /// Default graph with the configured overrides applied. Unknown entity
    /// names and missing edges are returned for the caller to report.
    pub fn relationship_graph(&self) -> (RelationshipGraph, Vec<RelationshipOverride>) {
        let mut graph = RelationshipGraph::default();
        let mut rejected = Vec::new();
        for rule in &self.relationships {
            let applied = match (EntityKind::parse(&rule.parent), EntityKind::parse(&rule.child)) {
                (Some(parent), Some(child)) => graph.set_upward(parent, child, rule.upward),
                _ => false,
            };
            if !applied {
                rejected.push(rule.clone());
            }
        }
        (graph, rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub replay_capacity: usize,
    pub subscriber_backlog: usize,
    pub heartbeat_interval_ms: u64,
    /// Partitions with no subscribers and no newer events are dropped.
    pub idle_partition_ttl_sec: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        let defaults = EventBusSettings::default();
        Self {
            replay_capacity: defaults.replay_capacity,
            subscriber_backlog: defaults.subscriber_backlog,
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            idle_partition_ttl_sec: 3600,
        }
    }
}

impl EventsConfig {
    pub fn idle_partition_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_partition_ttl_sec)
    }

    pub fn bus_settings(&self) -> EventBusSettings {
        EventBusSettings {
            replay_capacity: self.replay_capacity,
            subscriber_backlog: self.subscriber_backlog,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }
}

/// Configuration document imported at startup in standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootstrapConfig {
    pub partition: String,
    /// JSON configuration document (tools, resources, prompts, module links, modules).
    pub configuration_path: Option<PathBuf>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { partition: "default".to_string(), configuration_path: None }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[source] toml::ser::Error),
}
