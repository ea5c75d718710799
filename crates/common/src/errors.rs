use errors::ErrorMetadata;

/// Marker attached to an error chain when the database connection backing an
/// operation went away (server restart, failover, network partition).
///
/// The write synchronizer's release loop treats any chain containing this
/// marker as retryable; everything else propagates immediately.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("database connection lost")]
pub struct ConnectionLostError;

/// True when `e` signals lost database connectivity anywhere in its chain.
pub fn is_connection_lost(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ConnectionLostError>().is_some()
}

/// Standard tagging for a lost-connectivity failure: the [`ConnectionLostError`]
/// marker for the release loop, plus transient metadata for callers that
/// classify by [`ErrorMetadata`].
pub fn connection_lost(detail: impl std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(ConnectionLostError)
        .context(ErrorMetadata::transient(
            "DatabaseConnectionLost",
            format!("lost the database connection: {detail}"),
        ))
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::{
        connection_lost,
        is_connection_lost,
    };

    #[test]
    fn test_connection_lost_round_trip() {
        let err = connection_lost("socket closed");
        assert!(is_connection_lost(&err));
        assert!(err.is_transient());

        let other = anyhow::anyhow!("disk full");
        assert!(!is_connection_lost(&other));
    }
}
