use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{ChangelogStore, Item, TableDescription, partition_value};
use crate::errors::StoreError;

/// Store operation that an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    Describe,
    Get,
    Put,
    Delete,
}

#[derive(Debug, Default)]
struct MemoryTable {
    partition_key: String,
    items: HashMap<String, Item>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    failures: HashMap<FailOn, usize>,
}

/// In-process changelog store.
///
/// Clones share the same tables, so several coordinators built from clones of one
/// `MemoryStore` contend exactly like processes sharing a remote table. The internal
/// mutex stands in for the remote store's own atomicity.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or resets) a table keyed by `partition_key`.
    pub fn create_table(&self, table: &str, partition_key: &str) {
        self.state().tables.insert(
            table.to_string(),
            MemoryTable {
                partition_key: partition_key.to_string(),
                items: HashMap::new(),
            },
        );
    }

    pub fn drop_table(&self, table: &str) -> bool {
        self.state().tables.remove(table).is_some()
    }

    /// Makes the next `times` calls of `op` fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, op: FailOn, times: usize) {
        *self.state().failures.entry(op).or_default() += times;
    }

    /// Number of items in the table, including the lock record.
    pub fn item_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map(|t| t.items.len()).unwrap_or(0)
    }

    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.state()
            .tables
            .get(table)
            .is_some_and(|t| t.items.contains_key(key))
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryState {
    fn check_failure(&mut self, op: FailOn) -> Result<(), StoreError> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable {
                    message: format!("injected {op:?} failure").into(),
                })
            }
            _ => Ok(()),
        }
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut MemoryTable, StoreError> {
        self.tables.get_mut(table).ok_or_else(|| StoreError::TableNotFound {
            table: table.to_string(),
        })
    }
}

impl ChangelogStore for MemoryStore {
    async fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError> {
        let mut state = self.state();
        state.check_failure(FailOn::Describe)?;
        let found = state.table_mut(table)?;
        Ok(TableDescription {
            name: table.to_string(),
            partition_key: found.partition_key.clone(),
        })
    }

    async fn get_item(&self, table: &str, key: &str, _consistent: bool) -> Result<Option<Item>, StoreError> {
        let mut state = self.state();
        state.check_failure(FailOn::Get)?;
        Ok(state.table_mut(table)?.items.get(key).cloned())
    }

    async fn put_item_if_absent(&self, table: &str, partition_key: &str, item: Item) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_failure(FailOn::Put)?;
        let key = partition_value(&item, partition_key)?.to_string();
        let found = state.table_mut(table)?;
        if found.items.contains_key(&key) {
            return Err(StoreError::ConditionalCheckFailed { key });
        }
        found.items.insert(key, item);
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_failure(FailOn::Delete)?;
        state.table_mut(table)?.items.remove(key);
        Ok(())
    }
}
