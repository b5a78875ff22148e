//! Coordinator configuration and the TOML file it can be loaded from.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{entry::KEY_CHANGE_ID, errors::MigrationError};

pub const DEFAULT_CHANGELOG_TABLE_NAME: &str = "dbchangelog";
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Immutable settings of a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub table_name: String,
    pub partition_key: String,
    /// When false, `run` returns immediately without touching the lock or the ledger.
    pub enabled: bool,
    pub wait_for_lock: bool,
    pub lock_wait: Duration,
    pub lock_poll_interval: Duration,
    pub fail_if_lock_unavailable: bool,
    /// Identity written into the lock record; defaults to the host name.
    pub lock_holder: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_CHANGELOG_TABLE_NAME.to_string(),
            partition_key: KEY_CHANGE_ID.to_string(),
            enabled: true,
            wait_for_lock: false,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            fail_if_lock_unavailable: false,
            lock_holder: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enables waiting for the lock for at most `wait`, polling every `poll_interval`.
    pub fn with_lock_wait(mut self, wait: Duration, poll_interval: Duration) -> Self {
        self.wait_for_lock = true;
        self.lock_wait = wait;
        self.lock_poll_interval = poll_interval;
        self
    }

    pub fn with_wait_for_lock(mut self, wait_for_lock: bool) -> Self {
        self.wait_for_lock = wait_for_lock;
        self
    }

    pub fn with_fail_if_lock_unavailable(mut self, fail: bool) -> Self {
        self.fail_if_lock_unavailable = fail;
        self
    }

    pub fn with_lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.lock_holder = Some(holder.into());
        self
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.table_name.trim().is_empty() {
            return Err(MigrationError::configuration("changelog table name must not be empty"));
        }
        if self.partition_key.trim().is_empty() {
            return Err(MigrationError::configuration("partition key attribute must not be empty"));
        }
        if self.wait_for_lock && self.lock_poll_interval.is_zero() {
            return Err(MigrationError::configuration(
                "lock poll interval must be greater than zero when waiting for the lock",
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, MigrationError> {
        ConfigFile::from_toml_str(content)?.coordinator()
    }
}

/// On-disk configuration, e.g. `redbee.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub changelog: ChangelogSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogSettings {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_partition_key")]
    pub partition_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ChangelogSettings {
    fn default() -> Self {
        Self {
            table: default_table(),
            partition_key: default_partition_key(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_wait_minutes")]
    pub wait_minutes: f64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(default)]
    pub fail_if_unavailable: bool,
    #[serde(default)]
    pub holder: Option<String>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait: false,
            wait_minutes: default_wait_minutes(),
            poll_interval_secs: default_poll_interval_secs(),
            fail_if_unavailable: false,
            holder: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_table() -> String {
    DEFAULT_CHANGELOG_TABLE_NAME.to_string()
}

fn default_partition_key() -> String {
    KEY_CHANGE_ID.to_string()
}

fn default_true() -> bool {
    true
}

fn default_wait_minutes() -> f64 {
    DEFAULT_LOCK_WAIT.as_secs_f64() / 60.0
}

fn default_poll_interval_secs() -> f64 {
    DEFAULT_LOCK_POLL_INTERVAL.as_secs_f64()
}

fn default_redis_url() -> String {
    "${REDIS_URL}".to_string()
}

fn default_key_prefix() -> String {
    crate::store::redis_store::DEFAULT_KEY_PREFIX.to_string()
}

impl ConfigFile {
    pub fn from_toml_str(content: &str) -> Result<Self, MigrationError> {
        toml::from_str(content)
            .map_err(|err| MigrationError::configuration(format!("failed to parse configuration: {err}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            MigrationError::configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Converts the file settings into a validated coordinator configuration.
    pub fn coordinator(&self) -> Result<CoordinatorConfig, MigrationError> {
        let lock_wait = duration_from_secs("lock.wait_minutes", self.lock.wait_minutes * 60.0)?;
        let lock_poll_interval = duration_from_secs("lock.poll_interval_secs", self.lock.poll_interval_secs)?;

        let config = CoordinatorConfig {
            table_name: self.changelog.table.clone(),
            partition_key: self.changelog.partition_key.clone(),
            enabled: self.changelog.enabled,
            wait_for_lock: self.lock.wait,
            lock_wait,
            lock_poll_interval,
            fail_if_lock_unavailable: self.lock.fail_if_unavailable,
            lock_holder: self.lock.holder.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns the Redis URL, expanding a `${VAR}` placeholder from the environment.
    pub fn redis_url(&self) -> Result<String, MigrationError> {
        let url = self.redis.url.as_str();
        if url.starts_with("${") && url.ends_with('}') {
            let var_name = &url[2..url.len() - 1];
            std::env::var(var_name).map_err(|_| {
                MigrationError::configuration(format!("environment variable {var_name} not set"))
            })
        } else {
            Ok(url.to_string())
        }
    }
}

fn duration_from_secs(field: &str, secs: f64) -> Result<Duration, MigrationError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| MigrationError::configuration(format!("{field} must be a non-negative number")))
}
