//! Error types for the cache facade

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// The circuit breaker rejected the call; callers should treat this as a miss
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Redis returned an error or the connection failed
    #[error("Redis error: {0}")]
    Backend(#[from] redis::RedisError),

    /// No connection could be checked out of the pool
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// The backend is not reachable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event stream subscription or delivery failed
    #[error("Event stream error: {0}")]
    EventStream(String),

    /// A cache warming generator failed
    #[error("Warming generator failed: {0}")]
    Generator(#[source] anyhow::Error),
}

impl CacheError {
    /// Create a pool error from a string.
    pub fn pool(msg: impl Into<String>) -> Self {
        CacheError::Pool(msg.into())
    }

    /// Create a configuration error from a string.
    pub fn config(msg: impl Into<String>) -> Self {
        CacheError::Config(msg.into())
    }

    /// Create an event stream error from a string.
    pub fn event_stream(msg: impl Into<String>) -> Self {
        CacheError::EventStream(msg.into())
    }

    /// Low-cardinality error label used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::CircuitOpen { .. } => "circuit_open",
            CacheError::Backend(e) if e.is_timeout() => "timeout",
            CacheError::Backend(e) if e.is_connection_dropped() || e.is_io_error() => "connection",
            CacheError::Backend(e) if e.is_cluster_error() => "cluster",
            CacheError::Backend(_) => "backend",
            CacheError::Pool(_) => "pool",
            CacheError::Unavailable(_) => "unavailable",
            CacheError::Serialization(_) => "serialization",
            CacheError::Config(_) => "config",
            CacheError::EventStream(_) => "event_stream",
            CacheError::Generator(_) => "generator",
        }
    }

    /// Whether this is a circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CacheError::CircuitOpen { .. })
    }
}
