//! Change descriptors handed to the coordinator.
//!
//! How descriptors are discovered (explicit lists, registration at build time,
//! plugin scans) is up to the caller. The coordinator only sees an ordered slice
//! of [`ChangeSet`]s and treats each effect as an opaque unit of work.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};

use crate::entry::ChangeEntry;

/// Boxed future returned by a change effect.
pub type ChangeFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type Effect = Arc<dyn Fn() -> ChangeFuture + Send + Sync>;

/// A named migration step.
#[derive(Clone)]
pub struct ChangeSet {
    change_id: String,
    author: String,
    change_log_class: String,
    change_set_method: String,
    timestamp: Option<DateTime<Utc>>,
    run_always: bool,
    effect: Effect,
}

impl ChangeSet {
    /// Creates a change whose effect is produced by `effect` each time it executes.
    ///
    /// # Example
    /// ```ignore
    /// let change = ChangeSet::new("001_seed_roles", "ops", || async {
    ///     seed_roles().await?;
    ///     Ok(())
    /// })
    /// .origin("AccountChangelog", "seed_roles");
    /// ```
    pub fn new<F, Fut>(change_id: impl Into<String>, author: impl Into<String>, effect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            change_id: change_id.into(),
            author: author.into(),
            change_log_class: String::new(),
            change_set_method: String::new(),
            timestamp: None,
            run_always: false,
            effect: Arc::new(move || Box::pin(effect()) as ChangeFuture),
        }
    }

    /// Records where the change was defined. Audit only; never used for identity.
    pub fn origin(mut self, change_log_class: impl Into<String>, change_set_method: impl Into<String>) -> Self {
        self.change_log_class = change_log_class.into();
        self.change_set_method = change_set_method.into();
        self
    }

    /// Fixes the ledger timestamp instead of using the execution time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Runs the change on every run; it is still recorded only once.
    pub fn run_always(mut self, run_always: bool) -> Self {
        self.run_always = run_always;
        self
    }

    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    pub fn is_run_always(&self) -> bool {
        self.run_always
    }

    /// Ledger entry for this change, stamped with `executed_at` unless a timestamp was fixed.
    pub fn to_entry(&self, executed_at: DateTime<Utc>) -> ChangeEntry {
        ChangeEntry::new(
            self.change_id.clone(),
            self.author.clone(),
            self.timestamp.unwrap_or(executed_at),
            self.change_log_class.clone(),
            self.change_set_method.clone(),
        )
    }

    pub async fn execute(&self) -> anyhow::Result<()> {
        (self.effect)().await
    }
}

impl fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSet")
            .field("change_id", &self.change_id)
            .field("author", &self.author)
            .field("change_log_class", &self.change_log_class)
            .field("change_set_method", &self.change_set_method)
            .field("run_always", &self.run_always)
            .finish_non_exhaustive()
    }
}
