use super::DeviceId;

/// Identifier of a cluster service: the named grouping of devices that
/// collectively host one repository.
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
pub struct ClusterServiceId(String);

/// Wire protocol a binding is reachable over.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Ssh,
    Http,
}

impl TransportProtocol {
    /// Only SSH-family transports can serve intracluster fetches today. Kept
    /// as a predicate so the transport selection stays pluggable.
    pub fn is_ssh_family(&self) -> bool {
        matches!(self, TransportProtocol::Ssh)
    }
}

/// Association between a device and a repository's cluster service, with the
/// transport properties needed to reach it.
///
/// The binding lifecycle is managed outside the engine; the engine only
/// reads the active set.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Binding {
    pub device: DeviceId,
    pub protocol: TransportProtocol,
    /// Host (and optional port) the device serves repository traffic on.
    pub host: String,
}
