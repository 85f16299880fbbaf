use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::warming::WarmingPattern;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis Cluster seed nodes (e.g., "redis://10.0.0.1:7000").
    /// Empty means a single-instance in-process backend.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// TTL applied when a write does not specify one. 0 disables expiry.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often cluster topology is re-read, in milliseconds
    #[serde(default = "default_topology_refresh_interval_ms")]
    pub topology_refresh_interval_ms: u64,

    #[serde(default)]
    pub local_cache: LocalCacheConfig,
    #[serde(default)]
    pub cache_warming: CacheWarmingConfig,
    #[serde(default)]
    pub event_invalidation: EventInvalidationConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_ttl_secs() -> u64 {
    3600 // 1 hour
}
fn default_pool_size() -> usize {
    16
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_topology_refresh_interval_ms() -> u64 {
    30_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            default_ttl_secs: default_ttl_secs(),
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
            topology_refresh_interval_ms: default_topology_refresh_interval_ms(),
            local_cache: LocalCacheConfig::default(),
            cache_warming: CacheWarmingConfig::default(),
            event_invalidation: EventInvalidationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Default TTL as a duration, `None` when expiry is disabled.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn topology_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.topology_refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        for node in &self.nodes {
            if !(node.starts_with("redis://") || node.starts_with("rediss://")) {
                return Err(format!(
                    "nodes: '{node}' must start with redis:// or rediss://"
                ));
            }
        }
        if self.pool_size == 0 {
            return Err("pool_size must be > 0".into());
        }
        if self.topology_refresh_interval_ms == 0 {
            return Err("topology_refresh_interval_ms must be > 0".into());
        }
        if self.local_cache.max_entries == 0 {
            return Err("local_cache.max_entries must be > 0".into());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be > 0".into());
        }
        if self.circuit_breaker.reset_timeout_ms == 0 {
            return Err("circuit_breaker.reset_timeout_ms must be > 0".into());
        }
        if self.cache_warming.enabled {
            if self.cache_warming.warming_interval_ms == 0 {
                return Err("cache_warming.warming_interval_ms must be > 0".into());
            }
            if self.cache_warming.max_keys_per_cycle == 0 {
                return Err("cache_warming.max_keys_per_cycle must be > 0".into());
            }
        }
        Ok(())
    }
}

/// In-process (L1) tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    #[serde(default = "default_local_cache_max_entries")]
    pub max_entries: usize,
}

fn default_local_cache_max_entries() -> usize {
    10_000
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_local_cache_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheWarmingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_warming_interval_ms")]
    pub warming_interval_ms: u64,

    #[serde(default = "default_max_keys_per_cycle")]
    pub max_keys_per_cycle: usize,

    /// Patterns carry generator closures, so they are registered in code
    /// (see `CacheClientBuilder::warming_pattern`) rather than read from files.
    #[serde(skip)]
    pub warming_patterns: Vec<WarmingPattern>,
}

fn default_warming_interval_ms() -> u64 {
    300_000 // 5 minutes
}
fn default_max_keys_per_cycle() -> usize {
    100
}

impl Default for CacheWarmingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            warming_interval_ms: default_warming_interval_ms(),
            max_keys_per_cycle: default_max_keys_per_cycle(),
            warming_patterns: Vec::new(),
        }
    }
}

impl CacheWarmingConfig {
    pub fn warming_interval(&self) -> Duration {
        Duration::from_millis(self.warming_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInvalidationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Event type -> key pattern templates with `{dotted.path}` placeholders
    #[serde(default)]
    pub invalidation_map: BTreeMap<String, Vec<String>>,

    /// Consumer group used when subscribing
    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default)]
    pub from_beginning: bool,

    /// Channel prefix for the Redis pub/sub event stream
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

fn default_group_id() -> String {
    "octofhir-cache".to_string()
}
fn default_channel_prefix() -> String {
    "octofhir:events:".to_string()
}

impl Default for EventInvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            invalidation_map: BTreeMap::new(),
            group_id: default_group_id(),
            from_beginning: false,
            channel_prefix: default_channel_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Disabled means bypass mode: backend errors reach the caller
    #[serde(default = "default_circuit_enabled")]
    pub enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_circuit_enabled() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_circuit_enabled(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "octofhir-cache.toml";

    pub fn load_config(path: Option<&str>) -> Result<CacheConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", pathbuf.display()));
        }
        // Environment variable overrides, e.g., OCTOFHIR_CACHE__CIRCUIT_BREAKER__FAILURE_THRESHOLD=3
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_CACHE")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("nodes"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = CacheConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.default_ttl(), Some(Duration::from_secs(3600)));
        assert!(cfg.circuit_breaker.enabled);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert!(!cfg.cache_warming.enabled);
        assert!(!cfg.event_invalidation.enabled);
        assert_eq!(cfg.topology_refresh_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_ttl_disables_expiry() {
        let cfg = CacheConfig {
            default_ttl_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.default_ttl(), None);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = CacheConfig::default();
        cfg.nodes = vec!["http://localhost:7000".into()];
        assert!(cfg.validate().unwrap_err().contains("redis://"));

        let mut cfg = CacheConfig::default();
        cfg.circuit_breaker.failure_threshold = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CacheConfig::default();
        cfg.topology_refresh_interval_ms = 0;
        assert!(cfg.validate().unwrap_err().contains("topology_refresh_interval_ms"));

        let mut cfg = CacheConfig::default();
        cfg.cache_warming.enabled = true;
        cfg.cache_warming.max_keys_per_cycle = 0;
        assert!(cfg.validate().is_err());

        // Warming limits are only checked when warming is on
        cfg.cache_warming.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_document() {
        let cfg: CacheConfig = from_json(
            r#"{
                "nodes": ["redis://a:7000", "redis://b:7001"],
                "circuit_breaker": { "failure_threshold": 2 },
                "event_invalidation": {
                    "enabled": true,
                    "invalidation_map": { "OrderShipped": ["order:{data.orderId}:*"] }
                }
            }"#,
        );
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 2);
        assert_eq!(cfg.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(
            cfg.event_invalidation.invalidation_map["OrderShipped"],
            vec!["order:{data.orderId}:*".to_string()]
        );
        assert_eq!(cfg.event_invalidation.group_id, "octofhir-cache");
    }

    fn from_json(json: &str) -> CacheConfig {
        serde_json::from_str(json).expect("valid config json")
    }
}
