use std::{collections::HashMap, sync::LazyLock};

use chrono::Utc;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use super::{ChangelogStore, Item, TableDescription, partition_value};
use crate::{errors::StoreError, keys::ChangelogKeys};

pub const PUT_IF_ABSENT_SCRIPT_BODY: &str = include_str!("../../lua/put_if_absent.lua");

pub static PUT_IF_ABSENT_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(PUT_IF_ABSENT_SCRIPT_BODY));

/// Default key prefix for changelog tables.
pub const DEFAULT_KEY_PREFIX: &str = "redbee";

const META_PARTITION_KEY: &str = "partition_key";
const META_CREATED_AT: &str = "created_at";

/// Changelog store backed by Redis.
///
/// A table is a descriptor hash plus one hash per item. Reads always go to the
/// connected primary, so every read is strongly consistent.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Opens a connection manager for `url` and wraps it.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Writes the table descriptor if it does not exist yet.
    pub async fn provision_table(&self, table: &str, partition_key: &str) -> Result<(), StoreError> {
        let keys = ChangelogKeys::new(&self.prefix, table);
        let mut conn = self.conn.clone();
        let _: bool = conn.hset_nx(keys.table_meta(), META_PARTITION_KEY, partition_key).await?;
        let _: bool = conn
            .hset_nx(keys.table_meta(), META_CREATED_AT, Utc::now().timestamp_millis().to_string())
            .await?;
        Ok(())
    }

    /// Removes the descriptor and every item of the table. Returns the number of deleted keys.
    ///
    /// Matches keys with a single `KEYS` call, so it is meant for teardown of small tables.
    pub async fn drop_table(&self, table: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(ChangelogKeys::new(&self.prefix, table).pattern()).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = conn.del(keys).await?;
        Ok(deleted)
    }
}

impl ChangelogStore for RedisStore {
    async fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError> {
        let keys = ChangelogKeys::new(&self.prefix, table);
        let mut conn = self.conn.clone();
        let meta: HashMap<String, String> = conn.hgetall(keys.table_meta()).await?;
        match meta.get(META_PARTITION_KEY) {
            Some(partition_key) => Ok(TableDescription {
                name: table.to_string(),
                partition_key: partition_key.clone(),
            }),
            None => Err(StoreError::TableNotFound {
                table: table.to_string(),
            }),
        }
    }

    async fn get_item(&self, table: &str, key: &str, _consistent: bool) -> Result<Option<Item>, StoreError> {
        let keys = ChangelogKeys::new(&self.prefix, table);
        let mut conn = self.conn.clone();
        let item: Item = conn.hgetall(keys.item(key)).await?;
        Ok(if item.is_empty() { None } else { Some(item) })
    }

    async fn put_item_if_absent(&self, table: &str, partition_key: &str, item: Item) -> Result<(), StoreError> {
        let key = partition_value(&item, partition_key)?.to_string();
        let keys = ChangelogKeys::new(&self.prefix, table);
        let mut conn = self.conn.clone();

        let mut invocation = PUT_IF_ABSENT_SCRIPT.prepare_invoke();
        invocation.key(keys.item(&key));
        invocation.arg(partition_key);
        for (name, value) in &item {
            invocation.arg(name).arg(value);
        }
        let written: i64 = invocation.invoke_async(&mut conn).await?;

        if written == 1 {
            Ok(())
        } else {
            Err(StoreError::ConditionalCheckFailed { key })
        }
    }

    async fn delete_item(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let keys = ChangelogKeys::new(&self.prefix, table);
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(keys.item(key)).await?;
        Ok(())
    }
}
