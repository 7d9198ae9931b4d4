//! Services the core hands to a backend: blob storage, wall clock and timers.

mod store;
mod timer;

pub use store::{BlobStore, FileStore, MemoryStore, domain_hash};
pub use timer::{TimerClient, Timers};

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub trait Clock: Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|x| x.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Capability set a backend is started with.
#[derive(Clone)]
pub struct Host {
    pub storage: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
    pub timers: Arc<Timers>,
}

impl Host {
    pub fn new(storage: Arc<dyn BlobStore>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            timers: Arc::new(Timers::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
