//! Ledger entries and the lock record, plus their store-native item encoding.
//!
//! Every value is stored as a string attribute. Timestamps are encoded as
//! stringified epoch milliseconds.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::{errors::StoreError, store::Item};

pub const KEY_CHANGE_ID: &str = "changeId";
pub const KEY_AUTHOR: &str = "author";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_CHANGE_LOG_CLASS: &str = "changeLogClass";
pub const KEY_CHANGE_SET_METHOD: &str = "changeSetMethod";

/// Reserved partition key value of the process lock record.
pub const LOCK_ID: &str = "LOCK";

/// Record of one change that has been executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    change_id: String,
    author: String,
    timestamp: DateTime<Utc>,
    change_log_class: String,
    change_set_method: String,
}

impl ChangeEntry {
    /// Builds an entry. The timestamp is truncated to the millisecond precision it is stored with.
    pub fn new(
        change_id: impl Into<String>,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
        change_log_class: impl Into<String>,
        change_set_method: impl Into<String>,
    ) -> Self {
        Self {
            change_id: change_id.into(),
            author: author.into(),
            timestamp: truncate_to_millis(timestamp),
            change_log_class: change_log_class.into(),
            change_set_method: change_set_method.into(),
        }
    }

    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn change_log_class(&self) -> &str {
        &self.change_log_class
    }

    pub fn change_set_method(&self) -> &str {
        &self.change_set_method
    }

    /// Full attribute set written to the ledger, keyed by `partition_key` for the change id.
    pub fn to_item(&self, partition_key: &str) -> Item {
        let mut item = Item::new();
        item.insert(partition_key.to_string(), self.change_id.clone());
        item.insert(KEY_AUTHOR.to_string(), self.author.clone());
        item.insert(KEY_TIMESTAMP.to_string(), self.timestamp.timestamp_millis().to_string());
        item.insert(KEY_CHANGE_LOG_CLASS.to_string(), self.change_log_class.clone());
        item.insert(KEY_CHANGE_SET_METHOD.to_string(), self.change_set_method.clone());
        item
    }

    /// Decodes a stored ledger item. Provenance attributes default to empty when absent.
    pub fn from_item(item: &Item, partition_key: &str) -> Result<Self, StoreError> {
        let change_id = required(item, partition_key)?;
        let author = required(item, KEY_AUTHOR)?;
        let timestamp = parse_millis(required(item, KEY_TIMESTAMP)?)?;
        let optional = |name: &str| item.get(name).cloned().unwrap_or_default();

        Ok(Self {
            change_id: change_id.to_string(),
            author: author.to_string(),
            timestamp,
            change_log_class: optional(KEY_CHANGE_LOG_CLASS),
            change_set_method: optional(KEY_CHANGE_SET_METHOD),
        })
    }
}

impl fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ChangeSet: id={}, author={}, changeLogClass={}, changeSetMethod={}]",
            self.change_id, self.author, self.change_log_class, self.change_set_method
        )
    }
}

/// Contents of the sentinel lock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(holder: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: truncate_to_millis(acquired_at),
        }
    }

    pub fn to_item(&self, partition_key: &str) -> Item {
        let mut item = Item::new();
        item.insert(partition_key.to_string(), LOCK_ID.to_string());
        item.insert(KEY_AUTHOR.to_string(), self.holder.clone());
        item.insert(KEY_TIMESTAMP.to_string(), self.acquired_at.timestamp_millis().to_string());
        item
    }

    pub fn from_item(item: &Item) -> Result<Self, StoreError> {
        let holder = required(item, KEY_AUTHOR)?;
        let acquired_at = parse_millis(required(item, KEY_TIMESTAMP)?)?;
        Ok(Self {
            holder: holder.to_string(),
            acquired_at,
        })
    }
}

fn required<'a>(item: &'a Item, name: &str) -> Result<&'a str, StoreError> {
    item.get(name).map(String::as_str).ok_or_else(|| StoreError::InvalidItem {
        message: format!("missing attribute '{name}'").into(),
    })
}

fn parse_millis(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| StoreError::InvalidItem {
            message: format!("invalid timestamp '{raw}'").into(),
        })
}

fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp.timestamp_millis()).unwrap_or(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> ChangeEntry {
        let timestamp = DateTime::parse_from_rfc3339("2024-03-01T12:30:45.123456Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        ChangeEntry::new("001_init", "ops", timestamp, "InitialChangelog", "create_users")
    }

    #[test]
    fn item_uses_reserved_attribute_names() {
        let item = sample_entry().to_item(KEY_CHANGE_ID);
        assert_eq!(item.get("changeId").map(String::as_str), Some("001_init"));
        assert_eq!(item.get("author").map(String::as_str), Some("ops"));
        assert_eq!(item.get("timestamp").map(String::as_str), Some("1709296245123"));
        assert_eq!(item.get("changeLogClass").map(String::as_str), Some("InitialChangelog"));
        assert_eq!(item.get("changeSetMethod").map(String::as_str), Some("create_users"));
        assert_eq!(item.len(), 5);
    }

    #[test]
    fn custom_partition_key_replaces_change_id_attribute() {
        let item = sample_entry().to_item("pk");
        assert_eq!(item.get("pk").map(String::as_str), Some("001_init"));
        assert!(!item.contains_key(KEY_CHANGE_ID));

        let decoded = ChangeEntry::from_item(&item, "pk").expect("decode");
        assert_eq!(decoded, sample_entry());
    }

    #[test]
    fn timestamp_is_truncated_to_stored_precision() {
        let entry = sample_entry();
        assert_eq!(entry.timestamp().timestamp_subsec_micros(), 123_000);
    }

    #[test]
    fn decoding_rejects_missing_or_bad_attributes() {
        let mut item = sample_entry().to_item(KEY_CHANGE_ID);
        item.insert(KEY_TIMESTAMP.to_string(), "yesterday".to_string());
        assert!(matches!(
            ChangeEntry::from_item(&item, KEY_CHANGE_ID),
            Err(StoreError::InvalidItem { .. })
        ));

        item.remove(KEY_AUTHOR);
        assert!(matches!(
            ChangeEntry::from_item(&item, KEY_CHANGE_ID),
            Err(StoreError::InvalidItem { .. })
        ));
    }

    #[test]
    fn lock_record_has_no_provenance() {
        let record = LockRecord::new("build-host-1", Utc::now());
        let item = record.to_item(KEY_CHANGE_ID);
        assert_eq!(item.get(KEY_CHANGE_ID).map(String::as_str), Some(LOCK_ID));
        assert!(!item.contains_key(KEY_CHANGE_LOG_CLASS));
        assert!(!item.contains_key(KEY_CHANGE_SET_METHOD));
        assert_eq!(LockRecord::from_item(&item).expect("decode"), record);
    }

    #[test]
    fn display_matches_log_format() {
        assert_eq!(
            sample_entry().to_string(),
            "[ChangeSet: id=001_init, author=ops, changeLogClass=InitialChangelog, changeSetMethod=create_users]"
        );
    }
}
