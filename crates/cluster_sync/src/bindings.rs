//! Resolving which devices are bound to a repository's cluster service.

use async_trait::async_trait;
use common::{
    runtime::Runtime,
    types::{
        Binding,
        ClusterServiceId,
    },
};
use errors::ErrorMetadata;

use crate::ClusterSyncEngine;

/// Read-only view of cluster service membership, supplied by the
/// surrounding product's metadata store. Binding lifecycle (adding and
/// removing devices from service) is managed there, never here.
#[async_trait]
pub trait ClusterDirectory: Send + Sync + 'static {
    /// Devices currently bound to the cluster service, with their transport
    /// properties. Fails with a `Config` error when the service cannot be
    /// resolved.
    async fn active_bindings(&self, service: &ClusterServiceId) -> anyhow::Result<Vec<Binding>>;
}

impl<RT: Runtime> ClusterSyncEngine<RT> {
    pub(crate) async fn active_bindings(&self) -> anyhow::Result<Vec<Binding>> {
        let Some(service) = &self.repository.cluster_service else {
            anyhow::bail!(ErrorMetadata::config_error(
                "NoClusterService",
                format!(
                    "repository \"{}\" is not associated with a cluster service",
                    self.repository.display_name
                ),
            ));
        };
        self.directory.active_bindings(service).await
    }
}
