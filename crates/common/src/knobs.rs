//! Tunable limits and parameters for the synchronization engine.
//!
//! Every knob can be overridden with an environment variable when running
//! locally. Each should have a comment explaining what it's for so an oncall
//! engineer can adjust it safely.

use std::{
    num::NonZeroUsize,
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// How long a read or write synchronizer waits for its named advisory lock
/// before giving up with a transient error.
pub static REPOSITORY_LOCK_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("REPOSITORY_LOCK_TIMEOUT_SECS", 120)));

/// Wall-clock budget for clearing the durable write marker after a write
/// completes. Exhausting it leaves the repository frozen for an operator.
pub static WRITE_RELEASE_BUDGET: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("WRITE_RELEASE_BUDGET_SECS", 300)));

/// Sleep between attempts to clear the durable write marker while the
/// database is unreachable.
pub static WRITE_RELEASE_RETRY_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("WRITE_RELEASE_RETRY_INTERVAL_MS", 1000)));

/// Maximum number of simultaneous connections handed out by the Postgres
/// pool. Lock guards hold a dedicated connection each, so this bounds the
/// number of concurrent synchronizer operations per process.
pub static POSTGRES_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("POSTGRES_MAX_CONNECTIONS", 16));

/// Idle pooled connections older than this are discarded instead of reused.
pub static POSTGRES_INACTIVE_CONNECTION_LIFETIME: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("POSTGRES_INACTIVE_CONNECTION_LIFETIME_SECS", 300))
});

/// Upper bound on prepared statements cached per pooled connection, to avoid
/// unbounded memory usage on the Postgres server.
pub static POSTGRES_MAX_CACHED_STATEMENTS: LazyLock<NonZeroUsize> = LazyLock::new(|| {
    env_config(
        "POSTGRES_MAX_CACHED_STATEMENTS",
        NonZeroUsize::new(256).unwrap(),
    )
});
