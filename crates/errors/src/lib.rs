//! Error classification for the repository synchronization engine.
//!
//! Errors flow through the codebase as `anyhow::Error` chains. An
//! [`ErrorMetadata`] object can be attached to a chain via
//! `.context(e /* ErrorMetadata */)` to tag it with a classification that
//! callers and operators can act on without string-matching the message.

use std::borrow::Cow;

/// Attached to an `anyhow` error chain to classify it.
///
/// The `msg` is the operator-facing description. The `short_msg` is a stable
/// ScreamingCamelCase tag usable in tests and log search, resilient to
/// changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. `WriteLockTimeout`.
    pub short_msg: Cow<'static, str>,
    /// Human readable, descriptive, e.g. "timed out waiting 120s for the
    /// repository write lock".
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Lock wait exceeded, transient database disconnect, fetch network
    /// failure. The caller may retry the whole entry point.
    Transient,
    /// A prior write was interrupted, or releasing the durable write marker
    /// exhausted its reconnect budget. Terminal for the repository until an
    /// operator intervenes.
    Frozen,
    /// Cluster configuration prevents synchronization. Terminal until an
    /// operator fixes the configuration.
    Config,
    /// No active, fetchable peer holds the required version. Terminal for
    /// this attempt; retrying may succeed once a peer recovers.
    LeaderLost,
    /// The local working copy has not been materialized yet.
    NotInitialized,
    /// A repository of an unsupported version control family reached a
    /// git-only code path.
    Unsupported,
    /// An engine invariant was violated by the caller.
    Programmer,
}

impl ErrorMetadata {
    /// Lock wait exceeded, connectivity loss, or another failure that a
    /// retry of the whole entry point may resolve.
    pub fn transient(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Transient,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The repository is frozen until an operator resolves the interrupted
    /// write.
    pub fn frozen(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Frozen,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Misconfiguration that an operator must fix before synchronization can
    /// proceed.
    pub fn config_error(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Config,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// No up-to-date peer can serve a pull right now.
    pub fn leader_lost(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::LeaderLost,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The working copy is missing on disk. The message should tell the
    /// operator how to materialize it.
    pub fn not_initialized(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotInitialized,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A non-git repository reached a git-only code path.
    pub fn unsupported(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unsupported,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The caller violated an engine invariant (e.g. completing a write that
    /// was never started).
    pub fn programmer_error(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Programmer,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code == ErrorCode::Transient
    }

    pub fn is_frozen(&self) -> bool {
        self.code == ErrorCode::Frozen
    }

    pub fn is_config_error(&self) -> bool {
        self.code == ErrorCode::Config
    }

    pub fn is_leader_lost(&self) -> bool {
        self.code == ErrorCode::LeaderLost
    }

    pub fn is_not_initialized(&self) -> bool {
        self.code == ErrorCode::NotInitialized
    }

    pub fn is_unsupported(&self) -> bool {
        self.code == ErrorCode::Unsupported
    }

    pub fn is_programmer_error(&self) -> bool {
        self.code == ErrorCode::Programmer
    }

    /// True when retrying the whole entry point can plausibly succeed
    /// without operator intervention.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            ErrorCode::Transient | ErrorCode::LeaderLost => true,
            ErrorCode::Frozen
            | ErrorCode::Config
            | ErrorCode::NotInitialized
            | ErrorCode::Unsupported
            | ErrorCode::Programmer => false,
        }
    }
}

/// Classification helpers on `anyhow::Error`, looking for an attached
/// [`ErrorMetadata`] anywhere in the chain.
pub trait ErrorMetadataAnyhowExt {
    fn is_transient(&self) -> bool;
    fn is_frozen(&self) -> bool;
    fn is_config_error(&self) -> bool;
    fn is_leader_lost(&self) -> bool;
    fn is_not_initialized(&self) -> bool;
    fn is_unsupported(&self) -> bool;
    fn is_programmer_error(&self) -> bool;
    fn is_retryable(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
}

pub const UNCLASSIFIED_ERROR: &str = "UnclassifiedError";
pub const UNCLASSIFIED_ERROR_MSG: &str = "The synchronization engine hit an unclassified error.";

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_transient(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_transient();
        }
        false
    }

    fn is_frozen(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_frozen();
        }
        false
    }

    fn is_config_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_config_error();
        }
        false
    }

    fn is_leader_lost(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_leader_lost();
        }
        false
    }

    fn is_not_initialized(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_initialized();
        }
        false
    }

    fn is_unsupported(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_unsupported();
        }
        false
    }

    fn is_programmer_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_programmer_error();
        }
        false
    }

    fn is_retryable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_retryable();
        }
        false
    }

    /// Return the short tag associated with this error, or
    /// [`UNCLASSIFIED_ERROR`] when no metadata is attached.
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        UNCLASSIFIED_ERROR
    }

    /// Return the descriptive message associated with this error.
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        UNCLASSIFIED_ERROR_MSG
    }
}

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|code| match code {
                    ErrorCode::Transient => ErrorMetadata::transient("Transient", "transient"),
                    ErrorCode::Frozen => ErrorMetadata::frozen("Frozen", "frozen"),
                    ErrorCode::Config => ErrorMetadata::config_error("Config", "config"),
                    ErrorCode::LeaderLost => ErrorMetadata::leader_lost("LeaderLost", "lost"),
                    ErrorCode::NotInitialized => {
                        ErrorMetadata::not_initialized("NotInitialized", "missing")
                    },
                    ErrorCode::Unsupported => ErrorMetadata::unsupported("Unsupported", "vcs"),
                    ErrorCode::Programmer => {
                        ErrorMetadata::programmer_error("Programmer", "invariant")
                    },
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        UNCLASSIFIED_ERROR,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_classification_survives_context(err in any::<ErrorMetadata>()) {
            let code = err.code;
            let short = err.short_msg.clone();
            let wrapped = anyhow::anyhow!("underlying failure")
                .context(err)
                .context("while synchronizing");
            // The outermost context string must not hide the metadata.
            assert_eq!(wrapped.short_msg(), short);
            assert_eq!(wrapped.is_retryable(),
                matches!(code, ErrorCode::Transient | ErrorCode::LeaderLost));
        }
    }

    #[test]
    fn test_unclassified_error() {
        let err = anyhow::anyhow!("plain failure");
        assert!(!err.is_transient());
        assert!(!err.is_frozen());
        assert_eq!(err.short_msg(), UNCLASSIFIED_ERROR);
    }
}
