//! Coordination store backends for switchback.
//!
//! Provides the in-process [`MemoryStore`] used by tests and single-node
//! setups, and the Redis-backed [`RedisStore`] used in production.

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisTarget};

/// Connect to Redis, standalone or through Sentinel.
pub async fn connect(target: &RedisTarget) -> StoreResult<RedisStore> {
    RedisStore::connect_target(target).await
}
