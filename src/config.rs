// Pool configuration

use serde::{Deserialize, Serialize};
use std::thread;

/// Hardware threads kept free for the coordinator and the host application
const RESERVED_PARALLELISM: usize = 2;

/// Configuration of a [`crate::pool::WorkerPool`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Fixed upper bound on concurrently-live workers
    pub pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: default_pool_size(),
        }
    }
}

impl PoolConfig {
    /// Configuration with an explicit pool size (floored at one worker)
    pub fn with_pool_size(pool_size: usize) -> Self {
        PoolConfig {
            pool_size: pool_size.max(1),
        }
    }
}

/// Available hardware concurrency minus the reserved margin, never below one
pub fn default_pool_size() -> usize {
    thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(RESERVED_PARALLELISM + 1)
        .saturating_sub(RESERVED_PARALLELISM)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_size_is_positive() {
        assert!(default_pool_size() >= 1);
        assert!(PoolConfig::default().pool_size >= 1);
    }

    #[test]
    fn test_explicit_pool_size_floored_at_one() {
        assert_eq!(PoolConfig::with_pool_size(0).pool_size, 1);
        assert_eq!(PoolConfig::with_pool_size(4).pool_size, 4);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: PoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pool_size, default_pool_size());
    }
}
