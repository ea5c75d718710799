//! Production implementation of the Runtime trait: wallclock time, real
//! sleeps, thread-local randomness.

use std::{
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use common::runtime::Runtime;
use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::RngCore;

#[derive(Clone)]
pub struct ProdRuntime;

impl ProdRuntime {
    /// Must be called from within a tokio runtime; `wait` and
    /// `monotonic_now` use the ambient tokio clock.
    pub fn new() -> Self {
        ProdRuntime
    }
}

impl Runtime for ProdRuntime {
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
        Box::new(rand::rng())
    }
}
