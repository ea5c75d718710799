//! In-memory implementation of [`VersionStore`] with fault injection for
//! exercising the synchronizers' failure paths: injected connectivity loss
//! and advisory locks dropped out from under their guards.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use cmd_util::env::config_test;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    errors::connection_lost,
    types::{
        DeviceId,
        RepositoryId,
        WorkingCopyVersion,
        WriteOwner,
        WriteProperties,
    },
    version_store::{
        read_lock_name,
        write_lock_name,
        ReadLockGuard,
        VersionStore,
        WriteLockGuard,
    },
};

#[derive(Clone)]
pub struct TestVersionStore {
    inner: Arc<Mutex<Inner>>,
    lock_released: Arc<Notify>,
}

struct Inner {
    rows: BTreeMap<(RepositoryId, DeviceId), WorkingCopyVersion>,
    /// Held advisory locks, name -> token of the owning guard.
    locks: HashMap<String, u64>,
    next_lock_token: u64,
    /// Remaining store operations that fail with `ConnectionLostError`.
    connection_failures: u32,
}

impl Inner {
    fn check_connectivity(&mut self) -> anyhow::Result<()> {
        if self.connection_failures > 0 {
            self.connection_failures -= 1;
            return Err(connection_lost("injected failure"));
        }
        Ok(())
    }
}

impl TestVersionStore {
    pub fn new() -> Self {
        config_test();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rows: BTreeMap::new(),
                locks: HashMap::new(),
                next_lock_token: 0,
                connection_failures: 0,
            })),
            lock_released: Arc::new(Notify::new()),
        }
    }

    /// The next `failures` row operations fail as if the database connection
    /// dropped mid-call.
    pub fn fail_connections(&self, failures: u32) {
        self.inner.lock().connection_failures = failures;
    }

    /// Drop every held advisory lock while leaving the guards dangling, as a
    /// database restart would. Dangling guards fail their next operation.
    pub fn break_locks(&self) {
        self.inner.lock().locks.clear();
        self.lock_released.notify_waiters();
    }

    pub fn insert_row(&self, repository: RepositoryId, device: DeviceId, row: WorkingCopyVersion) {
        self.inner.lock().rows.insert((repository, device), row);
    }

    pub fn row(&self, repository: RepositoryId, device: &DeviceId) -> Option<WorkingCopyVersion> {
        self.inner
            .lock()
            .rows
            .get(&(repository, device.clone()))
            .cloned()
    }

    pub fn lock_held(&self, name: &str) -> bool {
        self.inner.lock().locks.contains_key(name)
    }

    async fn acquire(
        &self,
        name: String,
        timeout: Duration,
        timeout_tag: &'static str,
    ) -> anyhow::Result<HeldLock> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before checking state so a release between
            // the check and the await can't be missed.
            let released = self.lock_released.notified();
            {
                let mut inner = self.inner.lock();
                if !inner.locks.contains_key(&name) {
                    let token = inner.next_lock_token;
                    inner.next_lock_token += 1;
                    inner.locks.insert(name.clone(), token);
                    return Ok(HeldLock {
                        inner: self.inner.clone(),
                        lock_released: self.lock_released.clone(),
                        name,
                        token,
                    });
                }
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                anyhow::bail!(ErrorMetadata::transient(
                    timeout_tag,
                    format!("timed out waiting {}s for {name}", timeout.as_secs()),
                ));
            }
        }
    }
}

#[async_trait]
impl VersionStore for TestVersionStore {
    async fn load_versions(
        &self,
        repository: RepositoryId,
    ) -> anyhow::Result<BTreeMap<DeviceId, WorkingCopyVersion>> {
        let mut inner = self.inner.lock();
        inner.check_connectivity()?;
        Ok(inner
            .rows
            .iter()
            .filter(|((r, _), _)| *r == repository)
            .map(|((_, device), row)| (device.clone(), row.clone()))
            .collect())
    }

    async fn update_version(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        version: i64,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.check_connectivity()?;
        inner
            .rows
            .insert((repository, device), WorkingCopyVersion::at(version));
        Ok(())
    }

    async fn did_write(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        old_version: i64,
        new_version: i64,
        owner: &WriteOwner,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.check_connectivity()?;
        match inner.rows.get_mut(&(repository, device)) {
            Some(row) if row.write_owner.as_ref() == Some(owner) => {
                tracing::info!(
                    "releasing write marker on {repository}: {old_version} -> {new_version}"
                );
                row.version = new_version;
                row.is_writing = false;
                row.write_properties = None;
                row.write_owner = None;
            },
            _ => {
                tracing::info!(
                    "ignoring write marker release on {repository}: owner token does not match"
                );
            },
        }
        Ok(())
    }

    async fn read_lock(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn ReadLockGuard>> {
        let name = read_lock_name(repository, &device);
        let held = self.acquire(name, timeout, "ReadLockTimeout").await?;
        Ok(Box::new(TestReadLockGuard { held }))
    }

    async fn write_lock(
        &self,
        repository: RepositoryId,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn WriteLockGuard>> {
        let name = write_lock_name(repository);
        let held = self.acquire(name, timeout, "WriteLockTimeout").await?;
        Ok(Box::new(TestWriteLockGuard {
            store: self.inner.clone(),
            held,
        }))
    }
}

/// A held in-memory lock. Unlocking is token-fenced so a guard left dangling
/// by `break_locks` can't release a lock someone else has since taken.
struct HeldLock {
    inner: Arc<Mutex<Inner>>,
    lock_released: Arc<Notify>,
    name: String,
    token: u64,
}

impl HeldLock {
    fn unlock(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.locks.get(&self.name) == Some(&self.token) {
            inner.locks.remove(&self.name);
            self.lock_released.notify_waiters();
            true
        } else {
            false
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

struct TestReadLockGuard {
    held: HeldLock,
}

#[async_trait]
impl ReadLockGuard for TestReadLockGuard {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        anyhow::ensure!(self.held.unlock(), "read lock was no longer held");
        Ok(())
    }
}

struct TestWriteLockGuard {
    store: Arc<Mutex<Inner>>,
    held: HeldLock,
}

#[async_trait]
impl WriteLockGuard for TestWriteLockGuard {
    async fn will_write(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        properties: WriteProperties,
        owner: &WriteOwner,
    ) -> anyhow::Result<()> {
        let mut inner = self.store.lock();
        inner.check_connectivity()?;
        // The guard's session died with the lock; a real pinned connection
        // would fail exactly here.
        if inner.locks.get(&self.held.name) != Some(&self.held.token) {
            return Err(connection_lost("write lock connection is gone"));
        }
        let row = inner
            .rows
            .entry((repository, device))
            .or_insert_with(|| WorkingCopyVersion::at(0));
        row.is_writing = true;
        row.write_properties = Some(properties);
        row.write_owner = Some(owner.clone());
        Ok(())
    }

    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        anyhow::ensure!(self.held.unlock(), "write lock was no longer held");
        Ok(())
    }
}
