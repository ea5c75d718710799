//! Shared types and interfaces for the repository cluster synchronization
//! engine: identifier newtypes, the version-store contract, the `Runtime`
//! abstraction, and tunable knobs.

pub mod errors;
pub mod knobs;
pub mod runtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod version_store;
