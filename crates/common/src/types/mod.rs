mod cluster;
mod repository;
mod version;

pub use cluster::{
    Binding,
    ClusterServiceId,
    TransportProtocol,
};
pub use repository::{
    RepositoryFamily,
    SyncedRepository,
};
pub use version::{
    WorkingCopyVersion,
    WriteOwner,
    WriteProperties,
};

/// Numeric identifier of a logical repository, unique across the install.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::FromStr,
    derive_more::From,
    derive_more::Into,
)]
pub struct RepositoryId(pub u64);

/// Identifier of a device: one physical host holding a working copy.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Deref,
    derive_more::AsRef,
)]
#[from(forward)]
#[as_ref(forward)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
