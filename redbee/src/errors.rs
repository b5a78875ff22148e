use std::borrow::Cow;

use thiserror::Error;

/// Top-level error type returned by the changelog coordinator.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The changelog table is missing or does not match the configuration.
    #[error("configuration error: {message}")]
    Configuration { message: Cow<'static, str> },

    /// A store operation failed for a reason other than a condition check.
    #[error("store connection error: {0}")]
    Connection(#[source] StoreError),

    /// The process lock could not be obtained within the configured policy.
    #[error("lock error: {message}")]
    Lock { message: Cow<'static, str> },

    /// A ledger entry with this change id has already been recorded.
    #[error("change '{change_id}' has already been recorded")]
    DuplicateChange { change_id: String },

    /// The effect of a change returned an error; the run was aborted.
    #[error("change '{change_id}' failed: {source}")]
    ChangeFailed {
        change_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl MigrationError {
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn lock(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }
}

impl From<StoreError> for MigrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TableNotFound { table } => {
                Self::configuration(format!("could not find the changelog table '{table}'"))
            }
            other => Self::Connection(other),
        }
    }
}

/// Failures reported by a [`ChangelogStore`](crate::store::ChangelogStore) gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested table does not exist.
    #[error("table '{table}' not found")]
    TableNotFound { table: String },

    /// A conditional put found an item already stored under the key.
    #[error("conditional check failed for key '{key}'")]
    ConditionalCheckFailed { key: String },

    /// The item handed to the store is missing its partition key or is otherwise malformed.
    #[error("invalid item: {message}")]
    InvalidItem { message: Cow<'static, str> },

    /// Underlying Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store could not be reached.
    #[error("store unavailable: {message}")]
    Unavailable { message: Cow<'static, str> },
}
