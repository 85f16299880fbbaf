//! Key-value backends behind the cache facade.
//!
//! ## Backends
//!
//! - **Cluster** ([`RedisClusterBackend`]): Redis Cluster through a pooled
//!   cluster connection, shared across instances
//! - **Memory** ([`MemoryBackend`]): single-instance in-process map for
//!   deployments without Redis and for tests
//!
//! Every primitive fails independently; composing them (and deciding what a
//! failure means for the caller) is the job of [`crate::CacheClient`].
//!
//! Backends also publish [`TopologyEvent`]s. They exist for observability
//! only and never mutate cache state.

mod cluster;
mod memory;

pub use cluster::{ClusterNode, RedisClusterBackend, parse_cluster_nodes};
pub use memory::MemoryBackend;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::CacheResult;

/// Buffer size for topology event channels.
pub(crate) const TOPOLOGY_BUFFER_SIZE: usize = 64;

/// Cluster topology and connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A node answered and is serving requests
    NodeReady { node: String },
    /// A node reported itself (or was reported) as failing
    NodeError { node: String, error: String },
    /// Connections to a node were closed
    NodeDisconnected { node: String },
    /// A node joined the cluster
    NodeAdded { node: String },
    /// A node left the cluster
    NodeRemoved { node: String },
    /// A cluster-wide failure (pool exhaustion, CLUSTERDOWN, redirects, ...)
    ClusterError { error: String },
}

impl TopologyEvent {
    /// Metric/log label for the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TopologyEvent::NodeReady { .. } => "node_ready",
            TopologyEvent::NodeError { .. } => "node_error",
            TopologyEvent::NodeDisconnected { .. } => "node_disconnected",
            TopologyEvent::NodeAdded { .. } => "node_added",
            TopologyEvent::NodeRemoved { .. } => "node_removed",
            TopologyEvent::ClusterError { .. } => "cluster_error",
        }
    }
}

/// Primitive key-value operations.
///
/// TTLs of `None` (or zero) mean "no expiry".
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Name used in logs and circuit breaker errors.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> CacheResult<u64>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// All keys matching a glob-style pattern.
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Values aligned with `keys`; missing keys are `None`.
    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// Atomic increment; absent keys start from 0.
    async fn incr(&self, key: &str) -> CacheResult<i64>;

    /// Set only if absent, applying the TTL in the same atomic step.
    /// Returns `true` when the value was written.
    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Set a key's TTL. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Close all connections.
    async fn quit(&self) -> CacheResult<()>;

    /// Subscribe to topology notifications.
    fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent>;

    /// Re-read node state and publish what changed since the last call.
    /// The first call reports every node's current state.
    async fn refresh_topology(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// Convert a TTL into Redis milliseconds, `None` for "no expiry".
pub(crate) fn ttl_millis(ttl: Option<Duration>) -> Option<u64> {
    ttl.filter(|ttl| !ttl.is_zero())
        .map(|ttl| (ttl.as_millis() as u64).max(1))
}
