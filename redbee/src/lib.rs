//! Redbee: run-once data migrations for applications backed by a shared key-value store.
//!
//! A [`Coordinator`] takes an ordered list of [`ChangeSet`]s and guarantees, across
//! every process pointed at the same changelog table, that each change executes at
//! most once and that no two processes run changes at the same time. Both guarantees
//! rest on a single store primitive: a put that fails when the key already exists.

pub mod change;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod errors;
pub mod keys;
pub mod lock;
pub mod store;

pub use change::{ChangeFuture, ChangeSet};
pub use config::{ConfigFile, CoordinatorConfig};
pub use coordinator::{Coordinator, RunReport};
pub use entry::{ChangeEntry, LOCK_ID, LockRecord};
pub use errors::*;
pub use lock::LockManager;
pub use store::{ChangelogStore, Item, MemoryStore, RedisStore, TableDescription};

// Re-export redis types so users don't need to depend on a specific redis version
pub use redis;
pub use redis::aio::ConnectionManager;

/// Connects to Redis using a loaded config file and binds a coordinator to it.
pub async fn connect_redis(file: &ConfigFile) -> Result<Coordinator<RedisStore>, MigrationError> {
    let config = file.coordinator()?;
    let store = RedisStore::connect(&file.redis_url()?, file.redis.key_prefix.clone()).await?;
    Coordinator::connect(store, config).await
}
