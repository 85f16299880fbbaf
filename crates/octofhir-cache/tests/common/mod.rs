//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use octofhir_cache::{CacheBackend, CacheError, CacheResult, MemoryBackend, TopologyEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Memory backend with a switchable outage and a call counter.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    down: AtomicBool,
    calls: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Backend calls attempted so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Topology refreshes requested so far.
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check(&self) -> CacheResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.check()?;
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check()?;
        self.inner.keys(pattern).await
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        self.check()?;
        self.inner.mget(keys).await
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        self.check()?;
        self.inner.setnx(key, value, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn quit(&self) -> CacheResult<()> {
        self.inner.quit().await
    }

    fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.subscribe_topology()
    }

    async fn refresh_topology(&self) -> CacheResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.inner.refresh_topology().await
    }
}
