//! Runtime trait for abstracting away OS-esque features (time, sleeping,
//! randomness) so the engine can run against wall clocks in production and
//! virtual clocks in tests.

use std::{
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::future::FusedFuture;
use rand::RngCore;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Everything the synchronization engine needs from its environment. Prod
/// sleeps for wallclock time; the test runtime runs on tokio's paused clock
/// with a seeded rng so timeout and retry paths are deterministic.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Return (a potentially-virtualized) system time. Compare with
    /// `std::time::UNIX_EPOCH` to obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        UnixTimestamp(
            self.system_time()
                .duration_since(UNIX_EPOCH)
                .expect("Failed to compute unix timestamp"),
        )
    }

    /// Return (a potentially-virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// Use the runtime's source of randomness.
    fn rng(&self) -> Box<dyn RngCore>;
}

/// A unix timestamp stored as a duration since the epoch.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, serde::Serialize)]
pub struct UnixTimestamp(Duration);

impl UnixTimestamp {
    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}
