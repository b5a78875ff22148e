//! Process lock over the sentinel record of the changelog table.
//!
//! Mutual exclusion comes solely from the store's conditional put: whoever
//! writes the `LOCK` item first holds the lock until it is deleted. No
//! in-process mutex is layered on top because the contenders are separate
//! processes, usually on separate hosts.

use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::{runtime::Handle, sync::watch, time::Instant};

use crate::{
    config::CoordinatorConfig,
    entry::{LOCK_ID, LockRecord},
    errors::{MigrationError, StoreError},
    store::ChangelogStore,
};

const UNKNOWN_HOST: &str = "UnknownHost";
const KERNEL_HOST_NAME: &str = "/proc/sys/kernel/hostname";

/// Stand-in deadline for waits the clock cannot represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Acquires and releases the changelog process lock.
#[derive(Clone)]
pub struct LockManager<S> {
    store: S,
    table: String,
    partition_key: String,
    holder: String,
    wait_for_lock: bool,
    lock_wait: Duration,
    poll_interval: Duration,
    fail_if_unavailable: bool,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S> LockManager<S>
where
    S: ChangelogStore,
{
    pub fn new(store: S, config: &CoordinatorConfig) -> Self {
        Self {
            store,
            table: config.table_name.clone(),
            partition_key: config.partition_key.clone(),
            holder: config.lock_holder.clone().unwrap_or_else(local_host_name),
            wait_for_lock: config.wait_for_lock,
            lock_wait: config.lock_wait,
            poll_interval: config.lock_poll_interval,
            fail_if_unavailable: config.fail_if_lock_unavailable,
            shutdown: None,
        }
    }

    /// Aborts a pending lock wait once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Makes a single attempt to write the lock record.
    ///
    /// Returns `false` when another holder already owns the lock. Any other store
    /// failure is surfaced as [`MigrationError::Connection`].
    pub async fn acquire_lock(&self) -> Result<bool, MigrationError> {
        let record = LockRecord::new(self.holder.clone(), Utc::now());
        match self
            .store
            .put_item_if_absent(&self.table, &self.partition_key, record.to_item(&self.partition_key))
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::ConditionalCheckFailed { .. }) => {
                warn!("The changelog lock has already been acquired.");
                Ok(false)
            }
            Err(err) => Err(MigrationError::Connection(err)),
        }
    }

    /// Acquires the lock according to the wait policy.
    ///
    /// With waiting enabled the lock is retried every poll interval until the wait
    /// deadline passes. If the lock is still not held and the policy says to fail,
    /// returns [`MigrationError::Lock`]; otherwise returns `false`.
    pub async fn acquire_process_lock(&self) -> Result<bool, MigrationError> {
        let mut acquired = self.acquire_lock().await?;

        if !acquired && self.wait_for_lock {
            let deadline = wait_deadline(Instant::now(), self.lock_wait);
            while !acquired && Instant::now() < deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                info!("Waiting for changelog lock....");
                if !self.pause(self.poll_interval.min(remaining)).await {
                    return Err(MigrationError::lock("lock wait cancelled by shutdown"));
                }
                acquired = self.acquire_lock().await?;
            }
        }

        if !acquired && self.fail_if_unavailable {
            info!("Did not acquire the changelog process lock. Failing the run.");
            return Err(MigrationError::lock("could not acquire process lock"));
        }

        if acquired {
            info!("Changelog process lock acquired by {}", self.holder);
        }
        Ok(acquired)
    }

    /// Deletes the lock record unconditionally. Releasing a lock that is not held is not an error.
    pub async fn release_process_lock(&self) -> Result<(), MigrationError> {
        self.store
            .delete_item(&self.table, LOCK_ID)
            .await
            .map_err(MigrationError::Connection)?;
        info!("Changelog process lock released");
        Ok(())
    }

    /// Strongly consistent check whether anyone holds the lock.
    pub async fn is_process_lock_held(&self) -> Result<bool, MigrationError> {
        Ok(self.read_lock_item().await?.is_some())
    }

    /// Current lock record, if the lock is held.
    pub async fn current_holder(&self) -> Result<Option<LockRecord>, MigrationError> {
        match self.read_lock_item().await? {
            Some(item) => Ok(Some(LockRecord::from_item(&item).map_err(MigrationError::Connection)?)),
            None => Ok(None),
        }
    }

    async fn read_lock_item(&self) -> Result<Option<crate::store::Item>, MigrationError> {
        self.store
            .get_item(&self.table, LOCK_ID, true)
            .await
            .map_err(MigrationError::Connection)
    }

    /// Sleeps for `duration`. Returns `false` if shutdown was signalled first.
    async fn pause(&self, duration: Duration) -> bool {
        match &self.shutdown {
            None => {
                tokio::time::sleep(duration).await;
                true
            }
            Some(shutdown) => {
                let mut shutdown = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(duration) => true,
                    _ = wait_for_shutdown(&mut shutdown) => false,
                }
            }
        }
    }
}

impl<S> LockManager<S>
where
    S: ChangelogStore + Clone + Send + Sync + 'static,
{
    /// Guard that releases the lock from a spawned task unless it is disarmed first.
    pub(crate) fn release_on_drop(&self) -> ReleaseOnDrop<S> {
        ReleaseOnDrop {
            store: self.store.clone(),
            table: self.table.clone(),
            armed: true,
        }
    }
}

/// Releases the process lock when dropped while armed, e.g. when a run future is
/// cancelled or unwinds after the lock was acquired.
pub(crate) struct ReleaseOnDrop<S>
where
    S: ChangelogStore + Clone + Send + Sync + 'static,
{
    store: S,
    table: String,
    armed: bool,
}

impl<S> ReleaseOnDrop<S>
where
    S: ChangelogStore + Clone + Send + Sync + 'static,
{
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S> Drop for ReleaseOnDrop<S>
where
    S: ChangelogStore + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            error!("No runtime to release the changelog lock of '{}'; it stays held", self.table);
            return;
        };
        let store = self.store.clone();
        let table = std::mem::take(&mut self.table);
        handle.spawn(async move {
            match store.delete_item(&table, LOCK_ID).await {
                Ok(()) => warn!("Changelog process lock released after an interrupted run"),
                Err(err) => error!("Failed to release changelog lock after an interrupted run: {err}"),
            }
        });
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender dropped without signalling; nothing can cancel us anymore.
            std::future::pending::<()>().await;
        }
    }
}

fn wait_deadline(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait).unwrap_or_else(|| now + FAR_FUTURE)
}

fn local_host_name() -> String {
    std::fs::read_to_string(KERNEL_HOST_NAME)
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| {
            ["HOSTNAME", "COMPUTERNAME"]
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|name| !name.is_empty()))
        })
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConfigFile,
        store::{FailOn, MemoryStore},
    };

    const TABLE: &str = "dbchangelog";

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table(TABLE, "changeId");
        store
    }

    fn manager(store: &MemoryStore, config: CoordinatorConfig) -> LockManager<MemoryStore> {
        LockManager::new(store.clone(), &config)
    }

    #[tokio::test]
    async fn acquire_then_contend_then_release() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE);
        let first = manager(&store, config.clone().with_lock_holder("host-a"));
        let second = manager(&store, config.with_lock_holder("host-b"));

        assert!(first.acquire_lock().await.unwrap());
        assert!(!second.acquire_lock().await.unwrap());
        assert_eq!(second.current_holder().await.unwrap().unwrap().holder, "host-a");

        first.release_process_lock().await.unwrap();
        assert!(!first.is_process_lock_held().await.unwrap());
        assert!(second.acquire_lock().await.unwrap());
    }

    #[tokio::test]
    async fn release_without_holding_is_fine() {
        let store = store();
        let lock = manager(&store, CoordinatorConfig::new(TABLE));
        lock.release_process_lock().await.unwrap();
        assert!(!lock.is_process_lock_held().await.unwrap());
    }

    #[tokio::test]
    async fn store_failure_is_not_lock_busy() {
        let store = store();
        let lock = manager(&store, CoordinatorConfig::new(TABLE));
        store.fail_next(FailOn::Put, 1);
        assert!(matches!(lock.acquire_lock().await, Err(MigrationError::Connection(_))));
    }

    #[tokio::test]
    async fn busy_lock_without_waiting_returns_false() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE);
        manager(&store, config.clone()).acquire_lock().await.unwrap();

        assert!(!manager(&store, config).acquire_process_lock().await.unwrap());
    }

    #[tokio::test]
    async fn busy_lock_fails_fast_when_configured() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE).with_fail_if_lock_unavailable(true);
        manager(&store, config.clone()).acquire_lock().await.unwrap();

        let err = manager(&store, config).acquire_process_lock().await.expect_err("lock busy");
        assert!(matches!(err, MigrationError::Lock { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_holder_releases() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE).with_lock_wait(Duration::from_secs(60), Duration::from_secs(1));
        let holder = manager(&store, config.clone().with_lock_holder("holder"));
        let waiter = manager(&store, config.with_lock_holder("waiter"));
        holder.acquire_lock().await.unwrap();

        let start = Instant::now();
        let (acquired, ()) = tokio::join!(waiter.acquire_process_lock(), async {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            holder.release_process_lock().await.unwrap();
        });

        assert!(acquired.unwrap());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5), "{elapsed:?}");
        assert_eq!(waiter.current_holder().await.unwrap().unwrap().holder, "waiter");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE)
            .with_lock_wait(Duration::from_secs(30), Duration::from_secs(7))
            .with_fail_if_lock_unavailable(true);
        manager(&store, config.clone()).acquire_lock().await.unwrap();

        let start = Instant::now();
        let err = manager(&store, config).acquire_process_lock().await.expect_err("timed out");
        assert!(matches!(err, MigrationError::Lock { .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_the_wait() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE).with_lock_wait(Duration::from_secs(600), Duration::from_secs(5));
        manager(&store, config.clone()).acquire_lock().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let waiter = manager(&store, config).with_shutdown(rx);
        let start = Instant::now();
        let (result, ()) = tokio::join!(waiter.acquire_process_lock(), async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            tx.send(true).unwrap();
        });

        assert!(matches!(result, Err(MigrationError::Lock { .. })));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_wait_still_acquires_once_released() {
        let store = store();
        let config = CoordinatorConfig::new(TABLE).with_lock_wait(Duration::MAX, Duration::from_secs(1));
        let holder = manager(&store, config.clone().with_lock_holder("holder"));
        let waiter = manager(&store, config.with_lock_holder("waiter"));
        holder.acquire_lock().await.unwrap();

        let (acquired, ()) = tokio::join!(waiter.acquire_process_lock(), async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            holder.release_process_lock().await.unwrap();
        });

        assert!(acquired.unwrap());
        assert_eq!(waiter.current_holder().await.unwrap().unwrap().holder, "waiter");
    }

    #[test]
    fn huge_configured_wait_does_not_overflow_the_deadline() {
        let config = ConfigFile::from_toml_str(
            r#"
            [changelog]
            table = "t"

            [lock]
            wait = true
            wait_minutes = 2.0e17
            "#,
        )
        .unwrap()
        .coordinator()
        .unwrap();

        let now = Instant::now();
        assert!(wait_deadline(now, config.lock_wait) > now);
        assert_eq!(wait_deadline(now, Duration::MAX), now + FAR_FUTURE);
        assert_eq!(wait_deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }

    #[tokio::test]
    async fn holder_defaults_to_host_identity() {
        let lock = manager(&store(), CoordinatorConfig::new(TABLE));
        assert!(!lock.holder().is_empty());
        if let Ok(kernel) = std::fs::read_to_string(KERNEL_HOST_NAME) {
            let kernel = kernel.trim();
            if !kernel.is_empty() {
                assert_eq!(lock.holder(), kernel);
            }
        }
    }

    #[tokio::test]
    async fn armed_guard_releases_on_drop() {
        let store = store();
        let lock = manager(&store, CoordinatorConfig::new(TABLE));
        assert!(lock.acquire_lock().await.unwrap());

        drop(lock.release_on_drop());
        for _ in 0..10 {
            if !lock.is_process_lock_held().await.unwrap() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_process_lock_held().await.unwrap());
    }

    #[tokio::test]
    async fn disarmed_guard_leaves_lock_alone() {
        let store = store();
        let lock = manager(&store, CoordinatorConfig::new(TABLE));
        assert!(lock.acquire_lock().await.unwrap());

        let mut guard = lock.release_on_drop();
        guard.disarm();
        drop(guard);
        tokio::task::yield_now().await;
        assert!(lock.is_process_lock_held().await.unwrap());
    }
}
