//! Per-repository cluster synchronization engine.
//!
//! Devices in a cluster each hold a physical working copy of the same
//! logical repository. This engine keeps them consistent under a
//! version-ordered protocol:
//!
//! - reads observe a working copy at least as fresh as the freshest known
//!   leader, pulling from a leader first when this device is behind;
//! - writes are serialized per repository, cluster-wide, by a named
//!   advisory lock plus a durable `is_writing` row marker;
//! - an interrupted write leaves the marker behind, freezing the repository
//!   until an operator clears it;
//! - losing database connectivity while a write completes triggers a
//!   bounded reconnect-and-retry before the repository is declared frozen.
//!
//! Callers drive the engine through four lifecycle entry points wrapped
//! around their repository operations: [`ClusterSyncEngine::after_creation`],
//! [`ClusterSyncEngine::before_read`], [`ClusterSyncEngine::before_write`],
//! and [`ClusterSyncEngine::after_write`].

mod bindings;
mod fetch;
pub mod operator;
mod read;
mod write;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use common::{
    runtime::Runtime,
    types::{
        DeviceId,
        SyncedRepository,
        WriteOwner,
    },
    version_store::{
        VersionStore,
        WriteLockGuard,
    },
};

pub use crate::{
    bindings::ClusterDirectory,
    fetch::{
        FetchExecutor,
        FetchRequest,
        GitFetchExecutor,
    },
    write::PushLog,
};

/// Synchronization engine for one repository on one device.
///
/// The engine exclusively owns the held write-lock guard, the in-flight
/// write version, and the owner token between `before_write` and
/// `after_write`; they are cleared on completion and on terminal failure.
pub struct ClusterSyncEngine<RT: Runtime> {
    runtime: RT,
    repository: SyncedRepository,
    store: Arc<dyn VersionStore>,
    directory: Arc<dyn ClusterDirectory>,
    push_log: Arc<dyn PushLog>,
    fetcher: Arc<dyn FetchExecutor>,
    this_device: Option<DeviceId>,
    held_write: Option<HeldWrite>,
}

/// State carried between `before_write` and `after_write`.
pub(crate) struct HeldWrite {
    pub(crate) lock: Box<dyn WriteLockGuard>,
    /// Cluster maximum version at the time the write began.
    pub(crate) version: i64,
    pub(crate) owner: WriteOwner,
}

impl<RT: Runtime> ClusterSyncEngine<RT> {
    pub fn new(
        runtime: RT,
        repository: SyncedRepository,
        store: Arc<dyn VersionStore>,
        directory: Arc<dyn ClusterDirectory>,
        push_log: Arc<dyn PushLog>,
        fetcher: Arc<dyn FetchExecutor>,
        this_device: Option<DeviceId>,
    ) -> Self {
        Self {
            runtime,
            repository,
            store,
            directory,
            push_log,
            fetcher,
            this_device,
            held_write: None,
        }
    }

    /// Synchronization applies only to hosted git repositories bound to a
    /// cluster service, and only when this process knows which device it is
    /// running on. Everything else makes the four entry points no-ops.
    pub fn is_enabled(&self) -> bool {
        self.repository.cluster_service.is_some()
            && self.repository.family.is_git()
            && self.repository.hosted
            && self.this_device.is_some()
    }

    /// Seed a version-0 row for every active binding of a newly created
    /// repository, so later reads can unambiguously pick leaders.
    pub async fn after_creation(&self) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let bindings = self.active_bindings().await?;
        for binding in bindings {
            self.store
                .update_version(self.repository.id, binding.device, 0)
                .await?;
        }
        Ok(())
    }

    /// Bring this device's working copy up to the freshest version recorded
    /// anywhere in the cluster, and return that version. Returns `None` when
    /// synchronization is disabled for this repository.
    pub async fn before_read(&self) -> anyhow::Result<Option<i64>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        Ok(Some(self.synchronize_for_read().await?))
    }

    pub(crate) fn this_device(&self) -> &DeviceId {
        self.this_device
            .as_ref()
            .expect("entry points are no-ops without a device identity")
    }
}
