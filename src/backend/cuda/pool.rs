use super::core::{check, cudaFree, cudaFreeHost, cudaMalloc, cudaMallocHost, set_device};
use super::CudaError;
use crate::backend::pool::PoolCounters;
use crate::backend::{BackendError, MemoryPool, PoolKind, PoolStats};
use crate::ArrayResult;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::{null_mut, NonNull};
use std::sync::{Mutex, PoisonError};

/// Block sizes are rounded up to this many bytes so freed blocks can be
/// reused by requests of similar size.
const GRANULARITY: usize = 256;

#[derive(Debug, Default)]
struct Blocks {
    /// Live blocks by address, with their rounded size.
    live: HashMap<usize, usize>,
    /// Returned blocks by rounded size.
    cached: HashMap<usize, Vec<usize>>,
}

/// A caching pool over `cudaMalloc` or `cudaMallocHost`.
///
/// `free` only returns blocks to the cache and never calls into the CUDA
/// runtime, so it is safe to call from a stream callback. Cached blocks are
/// handed back to the runtime when the pool is dropped.
#[derive(Debug)]
pub struct CudaPool {
    name: String,
    kind: PoolKind,
    device_id: i32,
    blocks: Mutex<Blocks>,
    counters: PoolCounters,
}

impl CudaPool {
    /// Device memory on `device_id`.
    pub fn device(device_id: i32) -> Self {
        Self::with_kind(format!("cuda-device{}", device_id), PoolKind::Device, device_id)
    }

    /// Page-locked host memory registered with the runtime of `device_id`.
    pub fn pinned(device_id: i32) -> Self {
        Self::with_kind("cuda-pinned".to_string(), PoolKind::Pinned, device_id)
    }

    fn with_kind(name: String, kind: PoolKind, device_id: i32) -> Self {
        debug!("Creating {} pool", name);
        CudaPool {
            name,
            kind,
            device_id,
            blocks: Mutex::new(Blocks::default()),
            counters: PoolCounters::default(),
        }
    }

    fn lock_blocks(&self) -> std::sync::MutexGuard<'_, Blocks> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raw_alloc(&self, bytes: usize) -> Result<NonNull<u8>, CudaError> {
        set_device(self.device_id)?;

        let mut ptr: *mut c_void = null_mut();
        // SAFETY: ptr is a valid out pointer.
        match self.kind {
            PoolKind::Device => check("cudaMalloc", unsafe { cudaMalloc(&mut ptr, bytes) })?,
            PoolKind::Pinned => {
                check("cudaMallocHost", unsafe { cudaMallocHost(&mut ptr, bytes) })?
            }
        }
        NonNull::new(ptr.cast::<u8>()).ok_or(CudaError::Runtime {
            call: "cudaMalloc",
            code: -1,
            description: "returned a null pointer".to_string(),
        })
    }

    /// Returns every cached block to the runtime.
    pub fn trim(&self) {
        let cached: Vec<usize> = self
            .lock_blocks()
            .cached
            .drain()
            .flat_map(|(_, addrs)| addrs)
            .collect();

        for addr in cached {
            // SAFETY: cached blocks came from raw_alloc and are not live.
            let status = unsafe {
                match self.kind {
                    PoolKind::Device => cudaFree(addr as *mut c_void),
                    PoolKind::Pinned => cudaFreeHost(addr as *mut c_void),
                }
            };
            if let Err(e) = check("cudaFree", status) {
                warn!("{}: {}", self.name, e);
            }
        }
    }
}

/// The size class of a request, or `None` if rounding overflows.
fn rounded(bytes: usize) -> Option<usize> {
    bytes.max(1).div_ceil(GRANULARITY).checked_mul(GRANULARITY)
}

impl MemoryPool for CudaPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PoolKind {
        self.kind
    }

    /// `cudaMalloc` aligns to at least 256 bytes and `cudaMallocHost` to a
    /// page.
    fn alignment(&self) -> usize {
        GRANULARITY
    }

    fn alloc(&self, bytes: usize) -> ArrayResult<NonNull<u8>> {
        let size = rounded(bytes).ok_or_else(|| BackendError::AllocationFailed {
            pool: self.name.clone(),
            bytes,
        })?;

        let reused = self
            .lock_blocks()
            .cached
            .get_mut(&size)
            .and_then(|addrs| addrs.pop());
        let ptr = match reused.and_then(|addr| NonNull::new(addr as *mut u8)) {
            Some(ptr) => ptr,
            None => self.raw_alloc(size)?,
        };

        self.lock_blocks().live.insert(ptr.as_ptr() as usize, size);
        self.counters.record_alloc(size);
        trace!("{}: allocated {} bytes at {:p}", self.name, size, ptr);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let mut blocks = self.lock_blocks();
        let Some(size) = blocks.live.remove(&addr) else {
            error!("{}: free of unknown pointer {:p} ignored", self.name, ptr);
            return;
        };
        blocks.cached.entry(size).or_default().push(addr);
        drop(blocks);

        self.counters.record_free(size);
        trace!("{}: cached {} bytes at {:p}", self.name, size, ptr);
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

impl Drop for CudaPool {
    fn drop(&mut self) {
        let live = self.lock_blocks().live.len();
        if live > 0 {
            warn!("{} dropped with {} live allocations", self.name, live);
        }
        self.trim();
    }
}
