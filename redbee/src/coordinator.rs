//! Migration coordinator: lock, check, execute, record, release.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::FutureExt;
use log::{error, info};
use tokio::sync::watch;

use crate::{
    change::ChangeSet,
    config::CoordinatorConfig,
    entry::{ChangeEntry, LOCK_ID},
    errors::{MigrationError, StoreError},
    lock::LockManager,
    store::{ChangelogStore, TableDescription},
};

/// Outcome of a [`Coordinator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// False when the run was skipped because the lock was busy or the coordinator is disabled.
    pub lock_acquired: bool,
    /// Changes executed and recorded during this run.
    pub applied: Vec<String>,
    /// Run-always changes executed again although already recorded.
    pub reexecuted: Vec<String>,
    /// Changes skipped because they were already recorded.
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn executed_count(&self) -> usize {
        self.applied.len() + self.reexecuted.len()
    }
}

/// Runs changes at most once across every process sharing the changelog table.
pub struct Coordinator<S> {
    store: S,
    config: CoordinatorConfig,
    table: TableDescription,
    lock: LockManager<S>,
}

impl<S> Coordinator<S>
where
    S: ChangelogStore + Clone + Send + Sync + 'static,
{
    /// Binds the store and resolves the changelog table.
    ///
    /// Fails with [`MigrationError::Configuration`] if the table is absent or keyed by a
    /// different attribute than configured.
    pub async fn connect(store: S, config: CoordinatorConfig) -> Result<Self, MigrationError> {
        config.validate()?;

        info!("Searching for the changelog table '{}'...", config.table_name);
        let table = store.describe_table(&config.table_name).await?;
        if table.partition_key != config.partition_key {
            return Err(MigrationError::configuration(format!(
                "changelog table '{}' is keyed by '{}', expected '{}'",
                table.name, table.partition_key, config.partition_key
            )));
        }
        info!("Changelog table '{}' found", table.name);

        let lock = LockManager::new(store.clone(), &config);
        Ok(Self {
            store,
            config,
            table,
            lock,
        })
    }

    /// Lets a shutdown signal abort a pending lock wait.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.lock = self.lock.with_shutdown(shutdown);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn table(&self) -> &TableDescription {
        &self.table
    }

    pub fn lock_manager(&self) -> &LockManager<S> {
        &self.lock
    }

    pub async fn acquire_process_lock(&self) -> Result<bool, MigrationError> {
        self.lock.acquire_process_lock().await
    }

    pub async fn release_process_lock(&self) -> Result<(), MigrationError> {
        self.lock.release_process_lock().await
    }

    pub async fn is_process_lock_held(&self) -> Result<bool, MigrationError> {
        self.lock.is_process_lock_held().await
    }

    /// True iff no ledger entry exists for the change.
    ///
    /// Advisory only: the conditional put in [`save`](Self::save) is the authoritative guard.
    pub async fn is_new_change(&self, entry: &ChangeEntry) -> Result<bool, MigrationError> {
        let found = self
            .store
            .get_item(&self.table.name, entry.change_id(), true)
            .await
            .map_err(MigrationError::Connection)?;
        Ok(found.is_none())
    }

    /// Records the entry. Fails with [`MigrationError::DuplicateChange`] if it was already recorded.
    pub async fn save(&self, entry: &ChangeEntry) -> Result<(), MigrationError> {
        let item = entry.to_item(&self.table.partition_key);
        match self
            .store
            .put_item_if_absent(&self.table.name, &self.table.partition_key, item)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionalCheckFailed { .. }) => Err(MigrationError::DuplicateChange {
                change_id: entry.change_id().to_string(),
            }),
            Err(err) => Err(MigrationError::Connection(err)),
        }
    }

    /// Reads back the ledger entry of a recorded change.
    pub async fn find_entry(&self, change_id: &str) -> Result<Option<ChangeEntry>, MigrationError> {
        let found = self
            .store
            .get_item(&self.table.name, change_id, true)
            .await
            .map_err(MigrationError::Connection)?;
        found
            .map(|item| ChangeEntry::from_item(&item, &self.table.partition_key))
            .transpose()
            .map_err(MigrationError::Connection)
    }

    /// Executes every new change in order while holding the process lock.
    ///
    /// The first failing change aborts the run; later changes are not attempted. A
    /// panicking effect counts as a failing change.
    ///
    /// Once acquired, the lock is released on every exit path. If the returned future
    /// is dropped while holding the lock, the release is spawned on the current Tokio
    /// runtime. A change whose effect ran but whose ledger write failed will execute
    /// again on the next run.
    pub async fn run(&self, changes: &[ChangeSet]) -> Result<RunReport, MigrationError> {
        let start = Instant::now();
        let mut report = RunReport::default();

        if !self.config.enabled {
            info!("Changelog coordinator is disabled; skipping {} change(s)", changes.len());
            return Ok(report);
        }

        if let Some(reserved) = changes.iter().find(|change| change.change_id() == LOCK_ID) {
            return Err(MigrationError::configuration(format!(
                "change id '{}' is reserved for the process lock",
                reserved.change_id()
            )));
        }

        if !self.lock.acquire_process_lock().await? {
            info!("Changelog lock is held by another process; skipping migrations");
            report.elapsed = start.elapsed();
            return Ok(report);
        }
        report.lock_acquired = true;
        let mut guard = self.lock.release_on_drop();

        let outcome = self.apply_changes(changes, &mut report).await;
        let released = self.lock.release_process_lock().await;
        guard.disarm();
        report.elapsed = start.elapsed();

        match (outcome, released) {
            (Ok(()), Ok(())) => Ok(report),
            (Ok(()), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                error!("Failed to release changelog lock after a failed run: {release_err}");
                Err(err)
            }
        }
    }

    async fn apply_changes(&self, changes: &[ChangeSet], report: &mut RunReport) -> Result<(), MigrationError> {
        for change in changes {
            let entry = change.to_entry(Utc::now());

            if self.is_new_change(&entry).await? {
                self.execute(change).await?;
                self.save(&entry).await?;
                info!("{entry} applied");
                report.applied.push(entry.change_id().to_string());
            } else if change.is_run_always() {
                self.execute(change).await?;
                info!("{entry} re-executed");
                report.reexecuted.push(entry.change_id().to_string());
            } else {
                info!("{entry} passed over");
                report.skipped.push(entry.change_id().to_string());
            }
        }
        Ok(())
    }

    async fn execute(&self, change: &ChangeSet) -> Result<(), MigrationError> {
        let outcome = match AssertUnwindSafe(change.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("change panicked: {}", panic_message(panic.as_ref()))),
        };
        outcome.map_err(|source| MigrationError::ChangeFailed {
            change_id: change.change_id().to_string(),
            source,
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
