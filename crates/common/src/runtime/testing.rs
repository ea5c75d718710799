//! Test implementation of the Runtime trait.
//!
//! Built on tokio's clock so tests run under
//! `#[tokio::test(start_paused = true)]` advance through lock waits and
//! retry sleeps instantly, with a seeded rng for reproducibility.

use std::{
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use cmd_util::env::config_test;
use futures::{
    future::FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use super::Runtime;

const DEFAULT_SEED: u64 = 0;

#[derive(Clone)]
pub struct TestRuntime {
    rng: Arc<Mutex<ChaCha12Rng>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        config_test();
        Self {
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
        }
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(SharedRng {
            inner: self.rng.clone(),
        })
    }
}

/// Hands every caller a view of the same seeded generator.
struct SharedRng {
    inner: Arc<Mutex<ChaCha12Rng>>,
}

impl RngCore for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.lock().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.lock().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.lock().fill_bytes(dest)
    }
}
