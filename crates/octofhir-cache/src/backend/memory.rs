//! Single-instance in-process backend.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CacheBackend, TOPOLOGY_BUFFER_SIZE, TopologyEvent};
use crate::error::{CacheError, CacheResult};
use crate::pattern::KeyPattern;

const NODE_NAME: &str = "memory";

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process backend with Redis semantics for TTLs, `KEYS`, `INCR` and `SETNX`.
///
/// Cloning shares the underlying map, so clones behave like connections to the
/// same server.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<DashMap<String, StoredValue>>,
    closed: Arc<AtomicBool>,
    announced: Arc<AtomicBool>,
    topology: broadcast::Sender<TopologyEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (topology, _) = broadcast::channel(TOPOLOGY_BUFFER_SIZE);
        Self {
            data: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            announced: Arc::new(AtomicBool::new(false)),
            topology,
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Unavailable("memory backend closed".into()));
        }
        Ok(())
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.data.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.data.remove_if(key, |_, v| v.is_expired());
            return None;
        }
        Some(entry.value.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.data.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        NODE_NAME
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.ensure_open()?;
        self.data
            .insert(key.to_string(), StoredValue::new(value.to_string(), ttl));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.ensure_open()?;
        let mut deleted = 0;
        for key in keys {
            if let Some((_, value)) = self.data.remove(key) {
                if !value.is_expired() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.ensure_open()?;
        Ok(self.live_value(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.ensure_open()?;
        let pattern = KeyPattern::new(pattern);
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired() && pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        self.ensure_open()?;
        Ok(keys.iter().map(|key| self.live_value(key)).collect())
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.ensure_open()?;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired() => {
                let current: i64 = occupied.get().value.parse().map_err(|_| {
                    redis::RedisError::from((
                        ErrorKind::TypeError,
                        "value is not an integer or out of range",
                    ))
                })?;
                let next = current.checked_add(1).ok_or_else(|| {
                    redis::RedisError::from((
                        ErrorKind::TypeError,
                        "increment or decrement would overflow",
                    ))
                })?;
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut expired) => {
                expired.insert(StoredValue::new("1".to_string(), None));
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new("1".to_string(), None));
                Ok(1)
            }
        }
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        self.ensure_open()?;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_expired() => {
                occupied.insert(StoredValue::new(value.to_string(), ttl));
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value.to_string(), ttl));
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.ensure_open()?;
        match self.data.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn quit(&self) -> CacheResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.topology.send(TopologyEvent::NodeDisconnected {
                node: NODE_NAME.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }

    async fn refresh_topology(&self) -> CacheResult<()> {
        self.ensure_open()?;
        if !self.announced.swap(true, Ordering::AcqRel) {
            let _ = self.topology.send(TopologyEvent::NodeReady {
                node: NODE_NAME.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_del() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("missing").await.unwrap(), None);

        backend.set("a", "1", None).await.unwrap();
        backend.set("b", "2", None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("1"));

        let deleted = backend
            .del(&["a".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!backend.exists("a").await.unwrap());
        assert!(backend.exists("b").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend
            .set("session", "x", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        backend.set("forever", "y", Some(Duration::ZERO)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(backend.get("session").await.unwrap(), None);
        assert_eq!(backend.get("forever").await.unwrap().as_deref(), Some("y"));
        assert_eq!(backend.keys("*").await.unwrap(), vec!["forever".to_string()]);
    }

    #[tokio::test]
    async fn test_keys_and_mget() {
        let backend = MemoryBackend::new();
        backend.set("order:O1:items", "[]", None).await.unwrap();
        backend.set("order:O1:total", "10", None).await.unwrap();
        backend.set("order:O2:items", "[]", None).await.unwrap();

        let keys = backend.keys("order:O1:*").await.unwrap();
        assert_eq!(keys, vec!["order:O1:items", "order:O1:total"]);

        let values = backend
            .mget(&[
                "order:O1:total".to_string(),
                "missing".to_string(),
                "order:O2:items".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("10".to_string()), None, Some("[]".to_string())]
        );
    }

    #[tokio::test]
    async fn test_incr_and_setnx() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.incr("counter").await.unwrap(), 1);
        assert_eq!(backend.incr("counter").await.unwrap(), 2);

        backend.set("text", "abc", None).await.unwrap();
        let err = backend.incr("text").await.unwrap_err();
        assert_eq!(err.kind(), "backend");

        assert!(backend.setnx("lock", "me", None).await.unwrap());
        assert!(!backend.setnx("lock", "you", None).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("me"));
    }

    #[tokio::test]
    async fn test_incr_overflow_is_an_error() {
        let backend = MemoryBackend::new();
        backend.set("n", &i64::MAX.to_string(), None).await.unwrap();

        let err = backend.incr("n").await.unwrap_err();
        assert_eq!(err.kind(), "backend");
        assert!(err.to_string().contains("overflow"));
        // The stored value is left untouched
        assert_eq!(
            backend.get("n").await.unwrap(),
            Some(i64::MAX.to_string())
        );
    }

    #[tokio::test]
    async fn test_first_refresh_announces_node() {
        let backend = MemoryBackend::new();
        let mut events = backend.subscribe_topology();

        backend.refresh_topology().await.unwrap();
        backend.refresh_topology().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TopologyEvent::NodeReady {
                node: "memory".into()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setnx_ttl_and_expire() {
        let backend = MemoryBackend::new();
        assert!(
            backend
                .setnx("lock", "me", Some(Duration::from_secs(5)))
                .await
                .unwrap()
        );
        tokio::time::advance(Duration::from_secs(6)).await;
        // Expired lock can be taken again
        assert!(backend.setnx("lock", "you", None).await.unwrap());

        assert!(!backend.expire("missing", Duration::from_secs(1)).await.unwrap());
        assert!(backend.expire("lock", Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!backend.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_quit_closes_backend() {
        let backend = MemoryBackend::new();
        let mut events = backend.subscribe_topology();

        backend.quit().await.unwrap();

        assert!(matches!(
            backend.get("a").await,
            Err(CacheError::Unavailable(_))
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            TopologyEvent::NodeDisconnected {
                node: "memory".into()
            }
        );
    }
}
