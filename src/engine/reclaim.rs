//! Memory-pressure relief after large transient allocations

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Advisory hook run after staging and after prediction.
///
/// A no-op implementation is always valid. Implementations must not touch the
/// shared model handle.
pub trait ResourceReclaimer: Send + Sync {
    fn relieve(&self);
}

/// Does nothing
#[derive(Debug, Default)]
pub struct NoopReclaimer;

impl ResourceReclaimer for NoopReclaimer {
    fn relieve(&self) {}
}

/// Hands freed heap pages back to the OS via `malloc_trim` on glibc targets
#[derive(Debug, Default)]
pub struct HeapTrimReclaimer {
    runs: AtomicU64,
}

impl HeapTrimReclaimer {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}

impl ResourceReclaimer for HeapTrimReclaimer {
    fn relieve(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            // SAFETY: malloc_trim only releases memory the allocator already considers free
            let released = unsafe { libc::malloc_trim(0) };
            trace!("malloc_trim released memory: {}", released != 0);
        }
        #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
        trace!("heap trim not supported on this target");
    }
}

/// Runs [`ResourceReclaimer::relieve`] when dropped, including during unwinding
pub struct ReliefGuard<'a> {
    reclaimer: &'a dyn ResourceReclaimer,
}

impl<'a> ReliefGuard<'a> {
    pub fn new(reclaimer: &'a dyn ResourceReclaimer) -> Self {
        Self { reclaimer }
    }
}

impl Drop for ReliefGuard<'_> {
    fn drop(&mut self) {
        self.reclaimer.relieve();
    }
}
