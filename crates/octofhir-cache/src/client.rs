//! Resilient cache facade.
//!
//! ## Architecture
//!
//! ```text
//! caller ─► CacheClient ─► LocalCacheTier (opt-in per read)
//!                │
//!                └─► CircuitBreaker ─► CacheBackend (Redis Cluster | memory)
//! ```
//!
//! Backend failures become safe defaults (`None`, `0`, `false`, `[]`) while
//! the circuit breaker is enabled, so a cache outage degrades latency rather
//! than availability. With the breaker disabled, errors reach the caller.
//!
//! ## Background tasks
//!
//! Started by [`CacheClientBuilder::connect`] and stopped by
//! [`CacheClient::shutdown`], in this order:
//! 1. Cache warming (when enabled and patterns are registered)
//! 2. Event-driven invalidation (when enabled and an event stream is set)
//! 3. Topology monitoring, after the backend is closed so its disconnect
//!    notifications are still logged

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{CacheBackend, MemoryBackend, RedisClusterBackend, TopologyEvent};
use crate::circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::EventStream;
use crate::invalidation::InvalidationSubscriber;
use crate::local::LocalCacheTier;
use crate::metrics;
use crate::warming::{CacheWarmer, WarmingPattern, WarmingReport};

struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Builder wiring a [`CacheClient`] to its backend and event stream.
pub struct CacheClientBuilder {
    config: CacheConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    events: Option<Arc<dyn EventStream>>,
}

impl CacheClientBuilder {
    /// Use this backend instead of deriving one from `nodes`.
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Event stream consumed by the invalidation subscriber.
    pub fn event_stream(mut self, events: Arc<dyn EventStream>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a key to keep warm.
    pub fn warming_pattern(mut self, pattern: WarmingPattern) -> Self {
        self.config.cache_warming.warming_patterns.push(pattern);
        self
    }

    /// Validate the configuration, connect, and start background tasks.
    pub async fn connect(self) -> CacheResult<Arc<CacheClient>> {
        let CacheClientBuilder {
            config,
            backend,
            events,
        } = self;
        config.validate().map_err(CacheError::Config)?;

        let backend: Arc<dyn CacheBackend> = match backend {
            Some(backend) => backend,
            None if config.nodes.is_empty() => {
                info!("No cluster nodes configured, using in-process backend");
                Arc::new(MemoryBackend::new())
            }
            None => Arc::new(RedisClusterBackend::connect(&config).await?),
        };

        let breaker = if config.circuit_breaker.enabled {
            Some(CircuitBreaker::new(backend.name(), &config.circuit_breaker))
        } else {
            warn!("Circuit breaker disabled, backend errors propagate to callers");
            None
        };

        let warmer = if config.cache_warming.warming_patterns.is_empty() {
            if config.cache_warming.enabled {
                warn!("Cache warming enabled but no warming patterns registered");
            }
            None
        } else {
            Some(Arc::new(CacheWarmer::new(&config.cache_warming)))
        };

        // Subscribe before returning so events published right after connect
        // are not missed
        let invalidation = match (config.event_invalidation.enabled, events) {
            (false, _) => None,
            (true, None) => {
                warn!("Event invalidation enabled but no event stream configured");
                None
            }
            (true, Some(events)) => {
                let subscriber = Arc::new(InvalidationSubscriber::new(&config.event_invalidation, events));
                if subscriber.event_types().is_empty() {
                    warn!("Event invalidation enabled but invalidation_map has no patterns");
                    None
                } else {
                    let initial = match subscriber.subscribe().await {
                        Ok(subscription) => Some(subscription),
                        Err(e) => {
                            warn!(error = %e, "Initial event subscription failed, will retry");
                            None
                        }
                    };
                    Some((subscriber, initial))
                }
            }
        };

        let topology = backend.subscribe_topology();
        let local = LocalCacheTier::new(config.local_cache.max_entries);
        let warming_enabled = config.cache_warming.enabled;

        let client = Arc::new(CacheClient {
            config,
            backend,
            breaker,
            local,
            warmer,
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&client);
        let mut tasks = Vec::new();

        if let (true, Some(warmer)) = (warming_enabled, &client.warmer) {
            let token = CancellationToken::new();
            let handle = Arc::clone(warmer).spawn(weak.clone(), token.clone());
            tasks.push(TaskHandle {
                name: "warming",
                token,
                handle,
            });
        }

        if let Some((subscriber, initial)) = invalidation {
            let token = CancellationToken::new();
            let handle = subscriber.spawn(weak.clone(), initial, token.clone());
            tasks.push(TaskHandle {
                name: "invalidation",
                token,
                handle,
            });
        }

        let token = CancellationToken::new();
        let handle = spawn_topology_monitor(
            Arc::clone(&client.backend),
            topology,
            client.config.topology_refresh_interval(),
            token.clone(),
        );
        tasks.push(TaskHandle {
            name: "topology",
            token,
            handle,
        });

        *client.tasks.lock() = tasks;

        info!(
            backend = client.backend.name(),
            circuit_breaker = client.breaker.is_some(),
            "Cache client ready"
        );
        Ok(client)
    }
}

/// Process-wide cache facade.
///
/// Owns the circuit state and the local tier; safe to share across tasks
/// without external locking.
pub struct CacheClient {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    breaker: Option<CircuitBreaker>,
    local: LocalCacheTier,
    warmer: Option<Arc<CacheWarmer>>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl CacheClient {
    pub fn builder(config: CacheConfig) -> CacheClientBuilder {
        CacheClientBuilder {
            config,
            backend: None,
            events: None,
        }
    }

    /// Connect with the backend derived from `config.nodes` and no event stream.
    pub async fn connect(config: CacheConfig) -> CacheResult<Arc<Self>> {
        Self::builder(config).connect().await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn local_cache(&self) -> &LocalCacheTier {
        &self.local
    }

    /// `None` when the breaker is disabled.
    pub fn circuit_status(&self) -> Option<CircuitStatus> {
        self.breaker.as_ref().map(CircuitBreaker::status)
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(CircuitBreaker::snapshot)
    }

    /// Read a key. JSON payloads come back parsed, anything else as a string.
    pub async fn get(&self, key: &str, use_local_cache: bool) -> CacheResult<Option<Value>> {
        if use_local_cache {
            if let Some(raw) = self.local.get(key) {
                metrics::record_cache_hit("local");
                metrics::record_operation("get", true);
                return Ok(Some(decode(raw)));
            }
        }

        let raw = self
            .guarded("get", key, || self.backend.get(key), || None)
            .await?;
        match raw {
            Some(raw) => {
                metrics::record_cache_hit("remote");
                Ok(Some(decode(raw)))
            }
            None => {
                metrics::record_cache_miss();
                Ok(None)
            }
        }
    }

    /// Typed read. A payload that does not fit `T` is logged and treated as a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str, use_local_cache: bool) -> CacheResult<Option<T>> {
        let Some(value) = self.get(key, use_local_cache).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(typed) => Ok(Some(typed)),
            Err(e) => {
                warn!(operation = "get_as", key, error = %e, "Cached value has unexpected shape");
                metrics::record_error("get_as", "serialization");
                Ok(None)
            }
        }
    }

    /// Write a value. `None` TTL means the configured default.
    ///
    /// Returns `true` when stored, and also when the write was skipped
    /// because the backend is unavailable.
    pub async fn set<V>(&self, key: &str, value: &V, ttl: Option<Duration>) -> CacheResult<bool>
    where
        V: Serialize + ?Sized,
    {
        let payload = encode(value)?;
        let ttl = ttl.or_else(|| self.config.default_ttl());
        self.guarded(
            "set",
            key,
            || async {
                self.backend.set(key, &payload, ttl).await?;
                self.local.insert(key, payload.clone(), ttl);
                Ok(true)
            },
            || true,
        )
        .await
    }

    /// Delete keys, returning how many existed.
    pub async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        for key in keys {
            self.local.remove(key);
        }
        let label = keys.join(" ");
        self.guarded("del", &label, || self.backend.del(keys), || 0)
            .await
    }

    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        if self.local.contains_fresh(key) {
            return Ok(true);
        }
        self.guarded("exists", key, || self.backend.exists(key), || false)
            .await
    }

    /// Keys matching a glob-style pattern (`*`, `?`, `[...]`).
    pub async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.guarded("keys", pattern, || self.backend.keys(pattern), Vec::new)
            .await
    }

    /// Delete every key matching `pattern`, returning the number deleted.
    ///
    /// Not atomic: a key written between the scan and the delete survives.
    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let evicted = self.local.remove_matching(pattern);
        let keys = self.keys(pattern).await?;
        let deleted = self.del(&keys).await?;
        debug!(
            pattern,
            matched = keys.len(),
            deleted,
            evicted_local = evicted,
            "Invalidated key pattern"
        );
        Ok(deleted)
    }

    /// Values aligned with `keys`; missing keys are `None`.
    pub async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let label = keys.join(" ");
        let raw = self
            .guarded("mget", &label, || self.backend.mget(keys), || vec![None; keys.len()])
            .await?;
        Ok(raw.into_iter().map(|value| value.map(decode)).collect())
    }

    /// Atomic increment; an absent key counts from 0.
    pub async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.guarded(
            "incr",
            key,
            || async {
                let value = self.backend.incr(key).await?;
                self.local.apply_incr(key, value);
                Ok(value)
            },
            || 0,
        )
        .await
    }

    /// Write only if absent. `None` TTL means no expiry; the TTL is applied
    /// atomically with the write.
    pub async fn setnx<V>(&self, key: &str, value: &V, ttl: Option<Duration>) -> CacheResult<bool>
    where
        V: Serialize + ?Sized,
    {
        let payload = encode(value)?;
        self.guarded(
            "setnx",
            key,
            || async {
                let written = self.backend.setnx(key, &payload, ttl).await?;
                if written {
                    self.local.insert(key, payload.clone(), ttl);
                }
                Ok(written)
            },
            || false,
        )
        .await
    }

    /// Reset a key's TTL. `false` if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.guarded(
            "expire",
            key,
            || async {
                let updated = self.backend.expire(key, ttl).await?;
                if updated {
                    self.local.apply_expire(key, ttl);
                } else {
                    self.local.remove(key);
                }
                Ok(updated)
            },
            || false,
        )
        .await
    }

    pub fn clear_local_cache(&self) {
        self.local.clear();
        debug!("Local cache cleared");
    }

    /// Run one warming cycle now. `None` when no patterns are registered.
    pub async fn warm_now(&self) -> Option<WarmingReport> {
        match &self.warmer {
            Some(warmer) => Some(warmer.run_cycle(self).await),
            None => None,
        }
    }

    /// Stop background tasks and close backend connections.
    ///
    /// Warming and invalidation stop first. The topology monitor stops after
    /// the backend is closed. Teardown always runs to completion; a failure
    /// closing the backend is logged and returned.
    pub async fn shutdown(&self) -> CacheResult<()> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let monitor = tasks
            .iter()
            .position(|task| task.name == "topology")
            .map(|index| tasks.remove(index));

        for task in tasks {
            stop_task(task).await;
        }

        self.local.clear();

        let closed = self.backend.quit().await;
        if let Some(monitor) = monitor {
            stop_task(monitor).await;
        }

        match closed {
            Ok(()) => {
                info!("Cache client shut down");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to close backend connections");
                Err(e)
            }
        }
    }

    /// Run a backend call through the circuit breaker (when enabled), with
    /// logging and metrics.
    async fn guarded<T, F, Fut, FB>(
        &self,
        operation: &'static str,
        key: &str,
        call: F,
        fallback: FB,
    ) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
        FB: FnOnce() -> T,
    {
        let started = Instant::now();
        let succeeded = AtomicBool::new(false);
        let succeeded_ref = &succeeded;

        let instrumented = move || async move {
            let result = call().await;
            match &result {
                Ok(_) => succeeded_ref.store(true, Ordering::Relaxed),
                Err(e) => {
                    warn!(operation, key, error = %e, "Cache operation failed");
                    metrics::record_error(operation, e.kind());
                }
            }
            result
        };

        let result = match &self.breaker {
            Some(breaker) => breaker.call_with_fallback(instrumented, fallback).await,
            None => instrumented().await,
        };

        metrics::record_operation_duration(operation, started.elapsed());
        metrics::record_operation(operation, succeeded.load(Ordering::Relaxed));
        result
    }
}

impl Drop for CacheClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().iter() {
            task.token.cancel();
        }
    }
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("backend", &self.backend.name())
            .field("circuit", &self.circuit_status())
            .field("local_entries", &self.local.len())
            .finish_non_exhaustive()
    }
}

/// Strings are stored raw, everything else as JSON.
fn encode<V: Serialize + ?Sized>(value: &V) -> CacheResult<String> {
    Ok(match serde_json::to_value(value)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn decode(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

async fn stop_task(task: TaskHandle) {
    task.token.cancel();
    match task.handle.await {
        Ok(()) => debug!(task = task.name, "Background task stopped"),
        Err(e) => error!(task = task.name, error = %e, "Background task failed"),
    }
}

/// Periodically refresh backend topology and log every notification.
///
/// The first refresh runs immediately. On cancellation, notifications
/// already queued are still logged.
fn spawn_topology_monitor(
    backend: Arc<dyn CacheBackend>,
    mut events: broadcast::Receiver<TopologyEvent>,
    refresh_interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => log_topology_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Topology monitor lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        refreshed = backend.refresh_topology() => {
                            if let Err(e) = refreshed {
                                debug!(error = %e, "Topology refresh failed");
                            }
                        }
                    }
                }
            }
        }

        loop {
            match events.try_recv() {
                Ok(event) => log_topology_event(&event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    })
}

fn log_topology_event(event: &TopologyEvent) {
    metrics::record_topology_event(event.kind());
    match event {
        TopologyEvent::NodeReady { node } => info!(node = %node, "Cache node ready"),
        TopologyEvent::NodeAdded { node } => info!(node = %node, "Cache node added"),
        TopologyEvent::NodeError { node, error } => {
            warn!(node = %node, error = %error, "Cache node error")
        }
        TopologyEvent::NodeDisconnected { node } => {
            warn!(node = %node, "Cache node disconnected")
        }
        TopologyEvent::NodeRemoved { node } => warn!(node = %node, "Cache node removed"),
        TopologyEvent::ClusterError { error } => error!(error = %error, "Cache cluster error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_client() -> Arc<CacheClient> {
        CacheClient::connect(CacheConfig::default()).await.unwrap()
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode("plain text").unwrap(), "plain text");
        assert_eq!(encode(&json!({"a": 1})).unwrap(), r#"{"a":1}"#);
        assert_eq!(encode(&7).unwrap(), "7");

        assert_eq!(decode("plain text".into()), json!("plain text"));
        assert_eq!(decode(r#"{"a":1}"#.into()), json!({"a": 1}));
        assert_eq!(decode("[1,2]".into()), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_memory_backend_when_no_nodes() {
        let client = memory_client().await;
        assert_eq!(client.backend().name(), "memory");
        assert_eq!(client.circuit_status(), Some(CircuitStatus::Closed));
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = CacheConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        let err = CacheClient::connect(config).await.unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[tokio::test]
    async fn test_local_tier_serves_reads() {
        let client = memory_client().await;
        client.set("k", &json!({"v": 1}), None).await.unwrap();

        // Remove from the backend only; the local copy still answers opted-in reads
        client.backend().del(&["k".to_string()]).await.unwrap();
        assert_eq!(client.get("k", true).await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(client.get("k", false).await.unwrap(), None);

        client.clear_local_cache();
        assert_eq!(client.get("k", true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_as_mismatch_is_a_miss() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Report {
            total: u32,
        }

        let client = memory_client().await;
        client.set("report", &json!({"total": 42}), None).await.unwrap();
        client.set("text", "hello", None).await.unwrap();

        assert_eq!(
            client.get_as::<Report>("report", false).await.unwrap(),
            Some(Report { total: 42 })
        );
        assert_eq!(client.get_as::<Report>("text", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_warm_now_without_patterns() {
        let client = memory_client().await;
        assert_eq!(client.warm_now().await, None);
    }
}
