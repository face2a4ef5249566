use std::sync::atomic::{AtomicBool, Ordering};

/// Marks one load epoch. Work started under a token checks it before touching
/// shared state and gives up once the token has been cancelled.
#[derive(Debug, Default)]
pub struct CancelToken {
    epoch: u64,
    in_progress: AtomicBool,
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Claims the token for a load. Returns false when a load already holds it.
    pub fn try_begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.in_progress.store(false, Ordering::SeqCst);
    }
}
