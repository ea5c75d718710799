use std::collections::BTreeMap;

use rand::{
    distr::{
        Alphanumeric,
        Distribution,
    },
    RngCore,
};
use serde_json::Value as JsonValue;

use super::DeviceId;

/// Token minted per write attempt. Only the process holding the matching
/// token may clear the durable write marker it planted.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Deref,
    derive_more::AsRef,
)]
#[from(forward)]
#[as_ref(forward)]
pub struct WriteOwner(String);

impl WriteOwner {
    /// Mint a collision-resistant owner token, `<pid>.<12 random chars>`.
    pub fn mint(rng: &mut dyn RngCore) -> Self {
        let suffix: String = (0..12)
            .map(|_| Alphanumeric.sample(&mut *rng) as char)
            .collect();
        WriteOwner(format!("{}.{}", std::process::id(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Descriptor of an in-flight write, persisted alongside the durable marker
/// so an operator inspecting a frozen repository can see who was writing,
/// when, and from where.
///
/// Unknown fields round-trip untouched through `extra`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteProperties {
    pub user_id: Option<String>,
    #[serde(rename = "epoch")]
    pub epoch_seconds: i64,
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// One row of cluster version state: what a device's working copy held the
/// last time we durably knew, and whether a write is in flight there.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkingCopyVersion {
    /// Monotonic, non-negative. Sourced from push-event log ids.
    pub version: i64,
    /// True between a successful write-marker upsert and the matching
    /// release (or an explicit operator clear).
    pub is_writing: bool,
    pub write_properties: Option<WriteProperties>,
    pub write_owner: Option<WriteOwner>,
}

impl WorkingCopyVersion {
    pub fn at(version: i64) -> Self {
        Self {
            version,
            is_writing: false,
            write_properties: None,
            write_owner: None,
        }
    }
}
