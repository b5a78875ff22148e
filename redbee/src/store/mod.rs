//! Gateway over the key-value store backing the changelog table.
//!
//! This module provides:
//! - `ChangelogStore` - the four operations the coordinator needs
//! - `RedisStore` - gateway over Redis hashes
//! - `MemoryStore` - in-process gateway for tests and embedded use

use std::{collections::BTreeMap, future::Future};

use crate::errors::StoreError;

pub mod memory;
pub mod redis_store;

pub use memory::{FailOn, MemoryStore};
pub use redis_store::RedisStore;

/// Store-native attribute map of a single item.
pub type Item = BTreeMap<String, String>;

/// Descriptor returned when a table is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub partition_key: String,
}

/// Minimal store contract used by the lock manager and the coordinator.
///
/// `put_item_if_absent` is the only synchronization primitive: it must be atomic
/// at the store and fail with [`StoreError::ConditionalCheckFailed`] when an item
/// carrying `partition_key` already exists under the same key.
#[allow(async_fn_in_trait)]
pub trait ChangelogStore {
    async fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError>;

    async fn get_item(&self, table: &str, key: &str, consistent: bool) -> Result<Option<Item>, StoreError>;

    async fn put_item_if_absent(&self, table: &str, partition_key: &str, item: Item) -> Result<(), StoreError>;

    /// Deleting an absent key is not an error.
    ///
    /// The future must be `Send`: an interrupted run releases the lock from a spawned task.
    fn delete_item(&self, table: &str, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub(crate) fn partition_value<'a>(item: &'a Item, partition_key: &str) -> Result<&'a str, StoreError> {
    item.get(partition_key)
        .map(String::as_str)
        .ok_or_else(|| StoreError::InvalidItem {
            message: format!("item is missing partition key '{partition_key}'").into(),
        })
}
