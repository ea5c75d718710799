//! Read synchronization: leave this device's working copy at a version at
//! least as fresh as any recorded for an active device, and record that.

use common::{
    knobs::REPOSITORY_LOCK_TIMEOUT,
    runtime::Runtime,
    types::{
        Binding,
        DeviceId,
    },
    version_store::{
        ReadLockGuard as _,
        VersionStore as _,
    },
};
use errors::ErrorMetadata;

use crate::ClusterSyncEngine;

impl<RT: Runtime> ClusterSyncEngine<RT> {
    /// Returns the version this device's working copy represents once the
    /// pull (if any) has landed.
    pub(crate) async fn synchronize_for_read(&self) -> anyhow::Result<i64> {
        let repository = self.repository.id;
        let device = self.this_device().clone();

        let started = self.runtime.monotonic_now();
        let lock = self
            .store
            .read_lock(repository, device.clone(), *REPOSITORY_LOCK_TIMEOUT)
            .await?;
        tracing::info!(
            "acquired read lock on \"{}\" after {}ms",
            self.repository.display_name,
            (self.runtime.monotonic_now() - started).as_millis(),
        );

        // The guard's drop releases the lock on the error path.
        let version = self.read_locked(&device).await?;
        if let Err(e) = lock.release().await {
            tracing::warn!(
                "failed to release read lock on \"{}\": {e:#}",
                self.repository.display_name
            );
        }
        Ok(version)
    }

    async fn read_locked(&self, device: &DeviceId) -> anyhow::Result<i64> {
        let repository = self.repository.id;
        let versions = self.store.load_versions(repository).await?;
        if versions.is_empty() {
            return self.bootstrap_version_rows(device).await;
        }

        let max = versions
            .values()
            .map(|row| row.version)
            .max()
            .expect("versions is nonempty");
        // A device with no row has seen nothing and is behind any leader.
        let this_version = versions.get(device).map(|row| row.version);
        if this_version.is_none_or(|version| version < max) {
            let leaders: Vec<DeviceId> = versions
                .iter()
                .filter(|(_, row)| row.version == max)
                .map(|(leader, _)| leader.clone())
                .collect();
            let leader_bindings: Vec<Binding> = self
                .active_bindings()
                .await?
                .into_iter()
                .filter(|binding| leaders.contains(&binding.device))
                .collect();
            self.fetch_from(leader_bindings).await?;
            self.store
                .update_version(repository, device.clone(), max)
                .await?;
            tracing::info!(
                "synchronized \"{}\" from version {:?} to {max}",
                self.repository.display_name,
                this_version,
            );
        }
        Ok(max)
    }

    /// No device has ever recorded a version, so any device could win a pull
    /// race against any other. Refuse to guess: only a sole bound device may
    /// declare itself the authority, at version 0.
    async fn bootstrap_version_rows(&self, device: &DeviceId) -> anyhow::Result<i64> {
        let bindings = self.active_bindings().await?;
        if bindings.len() > 1 {
            let devices = bindings
                .iter()
                .map(|binding| binding.device.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::bail!(ErrorMetadata::config_error(
                "AmbiguousClusterAuthority",
                format!(
                    "repository \"{}\" has no recorded version history, but more than one \
                     device is bound to its cluster service ({devices}); remove all but one \
                     device from service to designate an authority, then restore the others",
                    self.repository.display_name,
                ),
            ));
        }
        match bindings.into_iter().next() {
            Some(binding) if binding.device == *device => {},
            _ => anyhow::bail!(ErrorMetadata::config_error(
                "DeviceNotBound",
                format!(
                    "repository \"{}\" has no recorded version history and this device \
                     ({device}) is not the device bound to its cluster service",
                    self.repository.display_name,
                ),
            )),
        }
        self.store
            .update_version(self.repository.id, device.clone(), 0)
            .await?;
        Ok(0)
    }
}
