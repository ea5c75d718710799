//! Operator intervention on frozen repositories.
//!
//! An interrupted write leaves its durable `is_writing` marker behind, and
//! the engine refuses all further writes to that repository until someone
//! who has verified the working copies clears the marker.

use common::{
    types::{
        DeviceId,
        RepositoryId,
    },
    version_store::VersionStore,
};

/// Clear an interrupted write's durable marker, unfreezing the repository.
///
/// This drops the marker without touching the recorded version. It is only
/// safe after an operator has confirmed that the interrupted write either
/// fully landed or fully failed on the device's working copy.
pub async fn clear_write_marker(
    store: &dyn VersionStore,
    repository: RepositoryId,
    device: DeviceId,
) -> anyhow::Result<()> {
    let versions = store.load_versions(repository).await?;
    let Some(row) = versions.get(&device) else {
        anyhow::bail!("no version row for device {device} on repository {repository}");
    };
    anyhow::ensure!(
        row.is_writing,
        "device {device} has no interrupted write to clear on repository {repository}",
    );
    if let Some(owner) = &row.write_owner {
        tracing::info!(
            "clearing interrupted write owned by {owner} on repository {repository}, \
             device {device}"
        );
    }
    store.update_version(repository, device, row.version).await
}
