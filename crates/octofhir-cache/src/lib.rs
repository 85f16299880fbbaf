//! Resilient caching facade over Redis Cluster.
//!
//! ```ignore
//! let config = octofhir_cache::loader::load_config(None)?;
//! let cache = CacheClient::builder(config)
//!     .warming_pattern(WarmingPattern::new("daily-report", 10, || async {
//!         Ok(serde_json::json!({"total": 42}))
//!     }))
//!     .connect()
//!     .await?;
//!
//! cache.set("patient:123", &patient, None).await?;
//! let cached = cache.get("patient:123", true).await?;
//! cache.shutdown().await?;
//! ```

pub mod backend;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod local;
pub mod metrics;
pub mod observability;
pub mod pattern;
pub mod warming;

pub use backend::{CacheBackend, ClusterNode, MemoryBackend, RedisClusterBackend, TopologyEvent};
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
pub use client::{CacheClient, CacheClientBuilder};
pub use config::{
    CacheConfig, CacheWarmingConfig, CircuitBreakerConfig, EventInvalidationConfig,
    LocalCacheConfig, LoggingConfig, loader,
};
pub use error::{CacheError, CacheResult};
pub use events::{
    BroadcastEventStream, DomainEvent, EventStream, EventSubscription, RedisEventStream,
    SubscribeOptions,
};
pub use invalidation::{InvalidationSubscriber, resolve_template};
pub use local::{CacheEntry, LocalCacheTier};
pub use observability::{init_tracing, init_tracing_with_level};
pub use warming::{CacheWarmer, ValueGenerator, WarmingPattern, WarmingReport};
