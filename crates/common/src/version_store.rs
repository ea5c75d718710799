//! Contract between the synchronization engine and the database that stores
//! per-(repository, device) version rows and serves named advisory locks.

use std::{
    collections::BTreeMap,
    time::Duration,
};

use async_trait::async_trait;

use crate::types::{
    DeviceId,
    RepositoryId,
    WorkingCopyVersion,
    WriteOwner,
    WriteProperties,
};

/// Advisory lock serializing reads per (repository, device).
pub fn read_lock_name(repository: RepositoryId, device: &DeviceId) -> String {
    format!("repository-read-{repository}-{device}")
}

/// Advisory lock serializing writes per repository, cluster-wide.
pub fn write_lock_name(repository: RepositoryId) -> String {
    format!("repository-write-{repository}")
}

/// Version rows and advisory locks, backed by the cluster database.
///
/// Lock acquisition waits up to the caller's timeout and fails with a
/// `Transient`-tagged error once it elapses. Operations that lose their
/// database connection fail with a chain containing
/// [`crate::errors::ConnectionLostError`].
#[async_trait]
pub trait VersionStore: Send + Sync + 'static {
    /// Read every version row for a repository. Non-locking.
    async fn load_versions(
        &self,
        repository: RepositoryId,
    ) -> anyhow::Result<BTreeMap<DeviceId, WorkingCopyVersion>>;

    /// Upsert a row to `version`, clearing any write marker. Only legal when
    /// no write is in flight on this device.
    async fn update_version(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        version: i64,
    ) -> anyhow::Result<()>;

    /// Clear the durable write marker and advance the row to `new_version`,
    /// but only if the row's owner token matches `owner`. A mismatched token
    /// means another actor took over the row; the call then changes nothing
    /// and returns success.
    async fn did_write(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        old_version: i64,
        new_version: i64,
        owner: &WriteOwner,
    ) -> anyhow::Result<()>;

    /// Take the per-(repository, device) read lock.
    async fn read_lock(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn ReadLockGuard>>;

    /// Take the repository-wide write lock on a dedicated database
    /// connection. The returned guard stays pinned to that connection.
    async fn write_lock(
        &self,
        repository: RepositoryId,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn WriteLockGuard>>;
}

/// Held per-(repository, device) read lock. Dropping the guard releases the
/// lock by discarding the underlying database session.
#[async_trait]
pub trait ReadLockGuard: Send + Sync {
    /// Explicitly release the lock.
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

/// Held repository-wide write lock, pinned to one database connection.
#[async_trait]
pub trait WriteLockGuard: Send + Sync {
    /// Persist the durable write marker: `is_writing = true` plus the write
    /// descriptor and owner token.
    ///
    /// Runs on the same connection that holds the advisory lock, so the
    /// marker and the lock commit together; once it returns, the row fences
    /// out other writers even if the advisory lock is later lost.
    async fn will_write(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        properties: WriteProperties,
        owner: &WriteOwner,
    ) -> anyhow::Result<()>;

    /// Best-effort advisory lock release. Failure is expected when the
    /// database restarted out from under the lock.
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}
