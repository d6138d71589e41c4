use thiserror::Error;

/// Error types for cache operations.
///
/// Most of these never reach callers of the orchestrator: transport and codec
/// failures are absorbed at the tier boundary and downgraded to a miss or an
/// uncached write. Only configuration and key-template errors surface.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote cache operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Invalid key template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Key template '{template}' requires argument '{placeholder}'")]
    MissingKeyArgument {
        template: String,
        placeholder: String,
    },
}

impl CacheError {
    /// Create a new Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a new Transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the error came from the remote tier (absorbed, never fatal).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Transport(format!("failed to get Redis connection: {e}"))
    }
}

impl From<config::ConfigError> for CacheError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
