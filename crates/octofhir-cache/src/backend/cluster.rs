//! Redis Cluster backend over a deadpool cluster pool.

use async_trait::async_trait;
use deadpool_redis::cluster::{Config as ClusterConfig, Connection, Pool};
use deadpool_redis::{PoolConfig, Runtime, Timeouts};
use parking_lot::Mutex;
use redis::{AsyncCommands, RedisResult};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{CacheBackend, TOPOLOGY_BUFFER_SIZE, TopologyEvent, ttl_millis};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

const BACKEND_NAME: &str = "redis-cluster";

/// One line of `CLUSTER NODES` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    /// `ip:port` without the cluster bus port
    pub address: String,
    pub flags: Vec<String>,
    pub connected: bool,
}

impl ClusterNode {
    pub fn is_primary(&self) -> bool {
        self.flags.iter().any(|f| f == "master")
    }

    /// Flagged `fail` by the cluster (a `fail?` suspicion is not enough).
    pub fn is_failing(&self) -> bool {
        self.flags.iter().any(|f| f == "fail")
    }

    fn health(&self) -> NodeHealth {
        if self.is_failing() {
            NodeHealth::Failing
        } else if !self.connected {
            NodeHealth::Disconnected
        } else {
            NodeHealth::Ready
        }
    }
}

/// Parse the text reply of `CLUSTER NODES`, skipping malformed lines.
pub fn parse_cluster_nodes(reply: &str) -> Vec<ClusterNode> {
    reply
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            // ip:port@cport[,hostname]
            let address = fields[1].split('@').next()?.to_string();
            if address.is_empty() || address.starts_with(':') {
                // noaddr nodes
                return None;
            }
            Some(ClusterNode {
                id: fields[0].to_string(),
                address,
                flags: fields[2].split(',').map(str::to_string).collect(),
                connected: fields[7] == "connected",
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeHealth {
    Ready,
    Failing,
    Disconnected,
}

/// Compare a fresh node listing with the last known one.
fn diff_topology(
    known: &BTreeMap<String, NodeHealth>,
    nodes: &[ClusterNode],
) -> (BTreeMap<String, NodeHealth>, Vec<TopologyEvent>) {
    let first_refresh = known.is_empty();
    let mut current = BTreeMap::new();
    let mut events = Vec::new();

    for node in nodes {
        let health = node.health();
        let previous = known.get(&node.address).copied();
        if previous.is_none() && !first_refresh {
            events.push(TopologyEvent::NodeAdded {
                node: node.address.clone(),
            });
        }
        if previous != Some(health) {
            events.push(match health {
                NodeHealth::Ready => TopologyEvent::NodeReady {
                    node: node.address.clone(),
                },
                NodeHealth::Failing => TopologyEvent::NodeError {
                    node: node.address.clone(),
                    error: "node flagged as failing".to_string(),
                },
                NodeHealth::Disconnected => TopologyEvent::NodeDisconnected {
                    node: node.address.clone(),
                },
            });
        }
        current.insert(node.address.clone(), health);
    }

    for address in known.keys() {
        if !current.contains_key(address) {
            events.push(TopologyEvent::NodeRemoved {
                node: address.clone(),
            });
        }
    }

    (current, events)
}

/// Redis Cluster backend.
///
/// Keys of one multi-key call may live in different hash slots, so `del` and
/// `mget` are issued key by key on a single pooled connection.
pub struct RedisClusterBackend {
    pool: Pool,
    seeds: Vec<String>,
    known_nodes: Mutex<BTreeMap<String, NodeHealth>>,
    topology: broadcast::Sender<TopologyEvent>,
}

impl RedisClusterBackend {
    /// Build the cluster pool and probe the cluster.
    ///
    /// An unreachable cluster is not an error here: the pool reconnects
    /// lazily and the circuit breaker absorbs failures until it is back.
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        if config.nodes.is_empty() {
            return Err(CacheError::config("nodes must list at least one cluster node"));
        }

        tracing::info!(nodes = ?config.nodes, "Connecting to Redis Cluster");

        let mut cluster_config = ClusterConfig::from_urls(config.nodes.clone());
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts = Timeouts {
            wait: Some(config.timeout()),
            create: Some(config.timeout()),
            recycle: Some(config.timeout()),
        };
        cluster_config.pool = Some(pool_config);

        let pool = cluster_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::config(format!("failed to create Redis Cluster pool: {e}")))?;

        let (topology, _) = broadcast::channel(TOPOLOGY_BUFFER_SIZE);
        let backend = Self {
            pool,
            seeds: config.nodes.clone(),
            known_nodes: Mutex::new(BTreeMap::new()),
            topology,
        };

        // Node state is published by the first `refresh_topology`, once
        // someone is subscribed
        match backend.fetch_nodes().await {
            Ok(nodes) => {
                tracing::info!(nodes = nodes.len(), "Connected to Redis Cluster");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis Cluster unreachable at startup; operations degrade until it recovers"
                );
            }
        }

        Ok(backend)
    }

    /// Seed node URLs this backend was configured with.
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Current `CLUSTER NODES` listing.
    pub async fn fetch_nodes(&self) -> CacheResult<Vec<ClusterNode>> {
        let mut conn = self.conn().await?;
        let reply: String = self
            .observe(redis::cmd("CLUSTER").arg("NODES").query_async(&mut conn).await)?;
        Ok(parse_cluster_nodes(&reply))
    }

    fn publish_changes(&self, nodes: &[ClusterNode]) {
        let events = {
            let mut known = self.known_nodes.lock();
            let (current, events) = diff_topology(&known, nodes);
            *known = current;
            events
        };
        for event in events {
            tracing::debug!(event = ?event, "Cluster topology changed");
            let _ = self.topology.send(event);
        }
    }

    async fn conn(&self) -> CacheResult<Connection> {
        self.pool.get().await.map_err(|e| {
            let _ = self.topology.send(TopologyEvent::ClusterError {
                error: e.to_string(),
            });
            CacheError::pool(format!("failed to get Redis Cluster connection: {e}"))
        })
    }

    /// Publish connection-level and cluster-level failures as topology events.
    fn observe<T>(&self, result: RedisResult<T>) -> CacheResult<T> {
        result.map_err(|e| {
            if e.is_cluster_error() || e.is_connection_dropped() || e.is_io_error() {
                let _ = self.topology.send(TopologyEvent::ClusterError {
                    error: e.to_string(),
                });
            }
            CacheError::Backend(e)
        })
    }
}

#[async_trait]
impl CacheBackend for RedisClusterBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn().await?;
        self.observe(conn.get::<_, Option<String>>(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ms) = ttl_millis(ttl) {
            cmd.arg("PX").arg(ms);
        }
        let _: () = self.observe(cmd.query_async(&mut conn).await)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        let mut conn = self.conn().await?;
        let mut deleted = 0;
        for key in keys {
            deleted += self.observe(conn.del::<_, u64>(key).await)?;
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        self.observe(conn.exists::<_, bool>(key).await)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        // KEYS is fanned out to every primary by the cluster client
        let mut conn = self.conn().await?;
        self.observe(conn.keys::<_, Vec<String>>(pattern).await)
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        let mut conn = self.conn().await?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.observe(conn.get::<_, Option<String>>(key).await)?);
        }
        Ok(values)
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn().await?;
        self.observe(conn.incr::<_, _, i64>(key, 1).await)
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ms) = ttl_millis(ttl) {
            cmd.arg("PX").arg(ms);
        }
        // "OK" when written, nil when the key already existed
        let reply: Option<String> = self.observe(cmd.query_async(&mut conn).await)?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let ms = ttl_millis(Some(ttl)).unwrap_or(1);
        let updated: bool =
            self.observe(redis::cmd("PEXPIRE").arg(key).arg(ms).query_async(&mut conn).await)?;
        Ok(updated)
    }

    async fn quit(&self) -> CacheResult<()> {
        self.pool.close();
        let nodes: Vec<String> = self.known_nodes.lock().keys().cloned().collect();
        for node in nodes {
            let _ = self.topology.send(TopologyEvent::NodeDisconnected { node });
        }
        tracing::info!("Redis Cluster connections closed");
        Ok(())
    }

    fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }

    async fn refresh_topology(&self) -> CacheResult<()> {
        let nodes = self.fetch_nodes().await?;
        self.publish_changes(&nodes);
        Ok(())
    }
}
