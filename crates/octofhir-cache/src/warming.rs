//! Proactive cache warming.
//!
//! Hot keys are recomputed on a timer so readers find them already populated.
//! Each cycle walks the registered patterns highest priority first and stops
//! once `cache_warming.max_keys_per_cycle` keys have been warmed. A failing
//! pattern is logged and counted but does not use up the budget.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::CacheClient;
use crate::config::CacheWarmingConfig;
use crate::metrics;

/// Produces the value for a warmed key.
#[async_trait]
pub trait ValueGenerator: Send + Sync {
    async fn generate(&self) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ValueGenerator for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn generate(&self) -> anyhow::Result<Value> {
        (self)().await
    }
}

/// A key to keep warm.
#[derive(Clone)]
pub struct WarmingPattern {
    pub key: String,
    /// Higher runs first
    pub priority: i32,
    pub generator: Arc<dyn ValueGenerator>,
    /// Falls back to the client's default TTL
    pub ttl: Option<Duration>,
}

impl WarmingPattern {
    pub fn new(key: impl Into<String>, priority: i32, generator: impl ValueGenerator + 'static) -> Self {
        Self {
            key: key.into(),
            priority,
            generator: Arc::new(generator),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl std::fmt::Debug for WarmingPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmingPattern")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Outcome of one warming cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmingReport {
    pub warmed: usize,
    pub failed: usize,
}

/// Runs warming cycles over an immutable, priority-ordered pattern list.
#[derive(Debug)]
pub struct CacheWarmer {
    patterns: Vec<WarmingPattern>,
    max_keys_per_cycle: usize,
    interval: Duration,
}

impl CacheWarmer {
    pub fn new(config: &CacheWarmingConfig) -> Self {
        let mut patterns = config.warming_patterns.clone();
        // Stable: equal priorities keep registration order
        patterns.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            patterns,
            max_keys_per_cycle: config.max_keys_per_cycle.max(1),
            interval: config.warming_interval(),
        }
    }

    /// Patterns in the order a cycle visits them.
    pub fn patterns(&self) -> &[WarmingPattern] {
        &self.patterns
    }

    /// Run one cycle, stopping after `max_keys_per_cycle` successful warms.
    pub async fn run_cycle(&self, client: &CacheClient) -> WarmingReport {
        let started = Instant::now();
        let mut report = WarmingReport::default();

        for pattern in &self.patterns {
            if report.warmed >= self.max_keys_per_cycle {
                break;
            }
            let value = match pattern.generator.generate().await {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %pattern.key, error = %e, "Cache warming generator failed");
                    metrics::record_warming(false);
                    report.failed += 1;
                    continue;
                }
            };

            match client.set(&pattern.key, &value, pattern.ttl).await {
                Ok(_) => {
                    debug!(key = %pattern.key, priority = pattern.priority, "Warmed cache key");
                    metrics::record_warming(true);
                    report.warmed += 1;
                }
                Err(e) => {
                    warn!(key = %pattern.key, error = %e, "Failed to store warmed value");
                    metrics::record_warming(false);
                    report.failed += 1;
                }
            }
        }

        metrics::record_warming_cycle(started.elapsed());
        debug!(
            warmed = report.warmed,
            failed = report.failed,
            "Cache warming cycle complete"
        );
        report
    }

    /// Start the periodic warming task.
    ///
    /// The first cycle runs one interval after start. The task ends when the
    /// token is cancelled or the client is dropped.
    pub fn spawn(self: Arc<Self>, client: Weak<CacheClient>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.interval.as_millis() as u64,
                patterns = self.patterns.len(),
                "Cache warming started"
            );

            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(client) = client.upgrade() else {
                    break;
                };

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = self.run_cycle(&client) => {}
                }
            }

            info!("Cache warming stopped");
        })
    }
}
