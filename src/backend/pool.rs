use std::fmt::{Debug, Display, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ArrayResult;

/// Which side of a transfer a pool's memory lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Host memory eligible for device-initiated transfers.
    Pinned,
    /// Accelerator-local memory.
    Device,
}

impl Display for PoolKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Pinned => write!(f, "pinned"),
            PoolKind::Device => write!(f, "device"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: usize,
    pub frees: usize,
    pub bytes_in_use: usize,
    pub peak_bytes_in_use: usize,
}

impl PoolStats {
    pub fn live_allocations(&self) -> usize {
        self.allocations - self.frees
    }
}

/// An arena handing out raw byte ranges.
///
/// Pools are shared between threads; a deferred release may free memory from
/// a runtime-owned callback thread.
pub trait MemoryPool: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PoolKind;

    /// Alignment every allocation from this pool is guaranteed to have.
    fn alignment(&self) -> usize;

    fn alloc(&self, bytes: usize) -> ArrayResult<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have come from `alloc` on this pool and must not be used
    /// afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>);

    fn stats(&self) -> PoolStats;
}

/// Counters shared by the pool implementations.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    bytes_in_use: AtomicUsize,
    peak_bytes_in_use: AtomicUsize,
}

impl PoolCounters {
    pub(crate) fn record_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let in_use = self.bytes_in_use.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak_bytes_in_use.fetch_max(in_use, Ordering::SeqCst);
    }

    pub(crate) fn record_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.bytes_in_use.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::SeqCst),
            frees: self.frees.load(Ordering::SeqCst),
            bytes_in_use: self.bytes_in_use.load(Ordering::SeqCst),
            peak_bytes_in_use: self.peak_bytes_in_use.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = PoolCounters::default();
        counters.record_alloc(128);
        counters.record_alloc(64);
        counters.record_free(128);

        let stats = counters.snapshot();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_allocations(), 1);
        assert_eq!(stats.bytes_in_use, 64);
        assert_eq!(stats.peak_bytes_in_use, 192);
    }
}
