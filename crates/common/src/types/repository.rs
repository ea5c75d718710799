use std::path::PathBuf;

use super::{
    ClusterServiceId,
    RepositoryId,
};

/// Version control family of a repository.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryFamily {
    Git,
    Mercurial,
    Subversion,
}

impl RepositoryFamily {
    pub fn is_git(&self) -> bool {
        matches!(self, RepositoryFamily::Git)
    }
}

/// Read-only view of a repository as the metadata store describes it, carrying
/// everything the synchronization engine needs to know.
#[derive(Clone, Debug)]
pub struct SyncedRepository {
    pub id: RepositoryId,
    /// Human-readable name, used in operator-facing error messages.
    pub display_name: String,
    pub family: RepositoryFamily,
    /// Hosted repositories are writable here; observed ones mirror a remote
    /// and are never synchronized.
    pub hosted: bool,
    pub cluster_service: Option<ClusterServiceId>,
    /// Where the physical working copy lives on this device.
    pub working_copy: PathBuf,
    /// Path component used when building fetch URIs against peer devices.
    pub remote_path: String,
}
