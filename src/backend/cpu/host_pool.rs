use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use log::{error, trace};

use crate::backend::pool::PoolCounters;
use crate::backend::{BackendError, MemoryPool, PoolKind, PoolStats};
use crate::ArrayResult;

pub const DEFAULT_ALIGNMENT: usize = 64;

/// A pool backed by the system allocator.
///
/// Serves as the pinned pool when no accelerator runtime provides page-locked
/// memory, and as the device pool of the simulated accelerator. New memory is
/// zero-filled.
#[derive(Debug)]
pub struct HostPool {
    name: String,
    kind: PoolKind,
    alignment: usize,
    poison: Option<u8>,
    capacity: Option<usize>,
    live: Mutex<HashMap<usize, Layout>>,
    counters: PoolCounters,
}

impl HostPool {
    pub fn new(kind: PoolKind) -> Self {
        Self::named(&format!("host-{}", kind), kind)
    }

    pub fn named(name: &str, kind: PoolKind) -> Self {
        HostPool {
            name: name.to_string(),
            kind,
            alignment: DEFAULT_ALIGNMENT,
            poison: None,
            capacity: None,
            live: Mutex::new(HashMap::new()),
            counters: PoolCounters::default(),
        }
    }

    /// Overwrites memory with `byte` before handing it back to the allocator.
    pub fn with_poison(mut self, byte: u8) -> Self {
        self.poison = Some(byte);
        self
    }

    /// Refuses allocations that would push the bytes in use past `bytes`.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    fn alloc_failed(&self, bytes: usize) -> BackendError {
        BackendError::AllocationFailed {
            pool: self.name.clone(),
            bytes,
        }
    }
}

impl MemoryPool for HostPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PoolKind {
        self.kind
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn alloc(&self, bytes: usize) -> ArrayResult<NonNull<u8>> {
        if let Some(capacity) = self.capacity {
            let in_use = self.counters.snapshot().bytes_in_use;
            if in_use.checked_add(bytes).map_or(true, |total| total > capacity) {
                return Err(self.alloc_failed(bytes).into());
            }
        }

        // Zero-sized layouts are not valid for the global allocator.
        let layout = Layout::from_size_align(bytes.max(1), self.alignment)
            .map_err(|_| self.alloc_failed(bytes))?;

        // SAFETY: layout has a non-zero size and a power-of-two alignment.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| self.alloc_failed(bytes))?;

        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ptr.as_ptr() as usize, layout);
        self.counters.record_alloc(layout.size());
        trace!("{}: allocated {} bytes at {:p}", self.name, bytes, ptr);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let layout = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(ptr.as_ptr() as usize));

        let Some(layout) = layout else {
            error!("{}: free of unknown pointer {:p} ignored", self.name, ptr);
            return;
        };

        if let Some(byte) = self.poison {
            std::ptr::write_bytes(ptr.as_ptr(), byte, layout.size());
        }
        dealloc(ptr.as_ptr(), layout);

        self.counters.record_free(layout.size());
        trace!("{}: freed {} bytes at {:p}", self.name, layout.size(), ptr);
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}
