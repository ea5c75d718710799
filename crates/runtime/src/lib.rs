//! Runtime implementations for abstracting out core systems functionality.
//! See [`common::runtime::Runtime`].
pub mod prod;

#[cfg(any(test, feature = "testing"))]
pub use ::common::runtime::testing;
