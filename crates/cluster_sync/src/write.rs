//! Write synchronization: cluster-wide serialization of writes to one
//! repository, with a durable marker that fences out other writers even if
//! the advisory lock is lost mid-write.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{
    errors::is_connection_lost,
    knobs::{
        REPOSITORY_LOCK_TIMEOUT,
        WRITE_RELEASE_BUDGET,
        WRITE_RELEASE_RETRY_INTERVAL,
    },
    runtime::Runtime,
    types::{
        RepositoryId,
        WriteOwner,
        WriteProperties,
    },
    version_store::{
        VersionStore as _,
        WriteLockGuard as _,
    },
};
use errors::ErrorMetadata;

use crate::{
    ClusterSyncEngine,
    HeldWrite,
};

/// The product's push-event log: a monotonic identifier source that records
/// every push, rejected or not. Post-write versions are minted from it.
#[async_trait]
pub trait PushLog: Send + Sync + 'static {
    /// Id of the most recent push event recorded for the repository.
    async fn latest_event_id(&self, repository: RepositoryId) -> anyhow::Result<Option<i64>>;
}

impl<RT: Runtime> ClusterSyncEngine<RT> {
    /// Returns once this process may mutate the repository: the cluster
    /// write lock is held, no prior write was left interrupted, this
    /// device's working copy is at the cluster maximum version, and the
    /// durable `is_writing` marker is persisted.
    pub async fn before_write(&mut self, acting_user: Option<&str>) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.held_write.is_some() {
            anyhow::bail!(ErrorMetadata::programmer_error(
                "WriteAlreadyHeld",
                format!(
                    "a write to \"{}\" is already in flight on this engine",
                    self.repository.display_name
                ),
            ));
        }
        let repository = self.repository.id;
        let device = self.this_device().clone();

        let started = self.runtime.monotonic_now();
        let lock = self
            .store
            .write_lock(repository, *REPOSITORY_LOCK_TIMEOUT)
            .await?;
        tracing::info!(
            "acquired write lock on \"{}\" after {}ms",
            self.repository.display_name,
            (self.runtime.monotonic_now() - started).as_millis(),
        );

        // Everything below runs under the lock; on an error path the guard
        // drops, closing its pinned connection and releasing the lock.
        let versions = self.store.load_versions(repository).await?;
        if let Some((frozen_device, _)) = versions.iter().find(|(_, row)| row.is_writing) {
            anyhow::bail!(ErrorMetadata::frozen(
                "RepositoryFrozen",
                format!(
                    "unable to synchronize repository \"{}\": a previous write to this \
                     repository was interrupted on device {frozen_device}; operator \
                     intervention is required before writes can proceed",
                    self.repository.display_name,
                ),
            ));
        }

        let version = self.synchronize_for_read().await?;

        let owner = {
            let mut rng = self.runtime.rng();
            WriteOwner::mint(rng.as_mut())
        };
        let properties = WriteProperties {
            user_id: acting_user.map(str::to_owned),
            epoch_seconds: self.runtime.unix_timestamp().as_secs() as i64,
            device_id: device.clone(),
            extra: BTreeMap::new(),
        };
        // The durable marker: once this lands, the row fences out every
        // other writer even if the advisory lock is later lost.
        lock.will_write(repository, device, properties, &owner).await?;

        self.held_write = Some(HeldWrite {
            lock,
            version,
            owner,
        });
        Ok(())
    }

    /// Clear the durable marker with the new post-write version, then
    /// release the cluster write lock.
    ///
    /// The advisory lock may already be gone (database restarted mid-push);
    /// the durable row marker is what actually fences out concurrent
    /// writers, so clearing it is the only release that matters. While the
    /// database is unreachable this retries for up to the release budget
    /// before declaring the repository frozen.
    pub async fn after_write(&mut self) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(write) = self.held_write.take() else {
            anyhow::bail!(ErrorMetadata::programmer_error(
                "WriteNotHeld",
                format!(
                    "completing a write to \"{}\" that was never started; call before_write \
                     first",
                    self.repository.display_name
                ),
            ));
        };
        let repository = self.repository.id;
        let device = self.this_device().clone();

        // The version advances whenever any push event was recorded,
        // rejected pushes included; with no event at all it stays put.
        let new_version = match self.push_log.latest_event_id(repository).await? {
            Some(event_id) => event_id,
            None => write.version,
        };

        let deadline = self.runtime.monotonic_now() + *WRITE_RELEASE_BUDGET;
        let mut released = false;
        let mut logged_connection_loss = false;
        loop {
            match self
                .store
                .did_write(
                    repository,
                    device.clone(),
                    write.version,
                    new_version,
                    &write.owner,
                )
                .await
            {
                Ok(()) => {
                    released = true;
                    break;
                },
                Err(e) if is_connection_lost(&e) => {
                    if !logged_connection_loss {
                        tracing::error!(
                            "lost database connectivity while releasing the write marker on \
                             \"{}\": {e:#}; retrying for up to {}s",
                            self.repository.display_name,
                            WRITE_RELEASE_BUDGET.as_secs(),
                        );
                        logged_connection_loss = true;
                    }
                },
                Err(e) => return Err(e),
            }
            if self.runtime.monotonic_now() + *WRITE_RELEASE_RETRY_INTERVAL > deadline {
                break;
            }
            self.runtime.wait(*WRITE_RELEASE_RETRY_INTERVAL).await;
        }
        if !released {
            anyhow::bail!(ErrorMetadata::frozen(
                "WriteMarkerStuck",
                format!(
                    "unable to clear the write marker on \"{}\" within {}s; the repository \
                     is frozen until an operator intervenes",
                    self.repository.display_name,
                    WRITE_RELEASE_BUDGET.as_secs(),
                ),
            ));
        }

        // Best effort: when the database restarted mid-write the lock is
        // already gone, and the cleared marker above is what matters.
        if let Err(e) = write.lock.release().await {
            tracing::warn!(
                "failed to release write lock on \"{}\": {e:#}",
                self.repository.display_name
            );
        }
        Ok(())
    }
}
