//! A temporary buffer living on the host, the device, or both.
//!
//! An [`AsyncArray`] created while the runtime executes device work
//! asynchronously lives in device memory, and its release is posted to the
//! runtime's stream so that kernels enqueued before the release still see
//! valid memory. Outside of that mode it is a plain pinned host buffer.

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use log::{debug, trace, warn};

mod device_copy;
mod residency;

pub use device_copy::DeviceCopy;
pub use residency::ResidencyKind;

use residency::Residency;

use crate::backend::{BackendError, ExecutionMode, MemoryPool, Runtime};
use crate::executor::ReleaseTask;
use crate::{fatal, ArrayError, ArrayResult};

pub struct AsyncArray<T: DeviceCopy> {
    residency: Residency<T>,
    len: usize,
    mode: ExecutionMode,
    runtime: Arc<Runtime>,
    _marker: PhantomData<T>,
}

// SAFETY: the array exclusively owns its allocations; the runtime is shared
// through an Arc and is itself Send + Sync.
unsafe impl<T: DeviceCopy + Send> Send for AsyncArray<T> {}
// SAFETY: shared references only read the pointers and copy out of them.
unsafe impl<T: DeviceCopy + Sync> Sync for AsyncArray<T> {}

fn byte_len<T>(n: usize) -> ArrayResult<usize> {
    n.checked_mul(mem::size_of::<T>()).ok_or_else(|| {
        ArrayError::StringError(format!(
            "{} elements of {} bytes overflow the address space",
            n,
            mem::size_of::<T>()
        ))
    })
}

impl<T: DeviceCopy> AsyncArray<T> {
    /// Copies `src` into a new buffer on the global runtime.
    pub fn from_host(src: &[T]) -> Self {
        Self::from_host_in(&Runtime::global(), src)
    }

    /// Copies `src` into a new buffer on `runtime`.
    ///
    /// In asynchronous mode the data is staged in pinned memory and an
    /// asynchronous copy to the device is enqueued. The call does not wait for
    /// that copy; work enqueued later on the same stream observes it.
    ///
    /// Aborts the process if memory cannot be allocated.
    pub fn from_host_in(runtime: &Arc<Runtime>, src: &[T]) -> Self {
        Self::try_from_host_in(runtime, src)
            .unwrap_or_else(|e| fatal("AsyncArray::from_host", &e))
    }

    pub fn try_from_host_in(runtime: &Arc<Runtime>, src: &[T]) -> ArrayResult<Self> {
        let bytes = byte_len::<T>(src.len())?;
        let device_pool = Self::device_pool_for(runtime);
        let mode = Self::mode_for(&device_pool);
        if bytes == 0 {
            return Ok(Self::empty(runtime, mode, src.len()));
        }

        let pinned = runtime.pinned_pool();
        Self::check_alignment(pinned.as_ref())?;
        if let Some(device_pool) = device_pool {
            Self::check_alignment(device_pool.as_ref())?;
        }
        let host = pinned.alloc(bytes)?;
        // SAFETY: host is a fresh allocation of `bytes` bytes and src spans
        // exactly `bytes` bytes.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr().cast::<u8>(), host.as_ptr(), bytes);
        }

        let residency = match device_pool {
            None => Residency::HostOnly { host: host.cast() },
            Some(device_pool) => {
                let device = match device_pool.alloc(bytes) {
                    Ok(device) => device,
                    Err(e) => {
                        // SAFETY: host was allocated above and never shared.
                        unsafe { pinned.free(host) };
                        return Err(e);
                    }
                };
                // SAFETY: the staging copy stays alive until the release task
                // runs, which the stream orders after this copy.
                let copied = unsafe { runtime.stream().copy_htod_async(device, host, bytes) };
                if let Err(e) = copied {
                    // SAFETY: the copy was never enqueued.
                    unsafe {
                        device_pool.free(device);
                        pinned.free(host);
                    }
                    return Err(e);
                }
                Residency::DeviceWithHostStaging {
                    device: device.cast(),
                    host: host.cast(),
                }
            }
        };

        let array = Self::with_residency(runtime, residency, src.len(), mode);
        trace!("Created {:?} from host data", array);
        Ok(array)
    }

    /// Allocates `n` elements on the global runtime without initializing them.
    pub fn uninit(n: usize) -> Self {
        Self::uninit_in(&Runtime::global(), n)
    }

    /// Allocates `n` elements on `runtime`: device memory in asynchronous mode,
    /// pinned host memory otherwise. The pools hand out zeroed memory, but
    /// callers are expected to fill the buffer with device work.
    ///
    /// Aborts the process if memory cannot be allocated.
    pub fn uninit_in(runtime: &Arc<Runtime>, n: usize) -> Self {
        Self::try_uninit_in(runtime, n).unwrap_or_else(|e| fatal("AsyncArray::uninit", &e))
    }

    pub fn try_uninit_in(runtime: &Arc<Runtime>, n: usize) -> ArrayResult<Self> {
        let bytes = byte_len::<T>(n)?;
        let device_pool = Self::device_pool_for(runtime);
        let mode = Self::mode_for(&device_pool);
        if bytes == 0 {
            return Ok(Self::empty(runtime, mode, n));
        }

        let residency = match device_pool {
            Some(device_pool) => {
                Self::check_alignment(device_pool.as_ref())?;
                Residency::DeviceOnly {
                    device: device_pool.alloc(bytes)?.cast(),
                }
            }
            None => {
                let pinned = runtime.pinned_pool();
                Self::check_alignment(pinned.as_ref())?;
                Residency::HostOnly {
                    host: pinned.alloc(bytes)?.cast(),
                }
            }
        };

        let array = Self::with_residency(runtime, residency, n, mode);
        trace!("Created uninitialized {:?}", array);
        Ok(array)
    }

    fn device_pool_for(runtime: &Runtime) -> Option<&Arc<dyn MemoryPool>> {
        match runtime.execution_mode() {
            ExecutionMode::Asynchronous => runtime.device_pool(),
            ExecutionMode::Synchronous => None,
        }
    }

    /// Refuses element types whose alignment `pool` cannot honor.
    fn check_alignment(pool: &dyn MemoryPool) -> ArrayResult<()> {
        let align = mem::align_of::<T>();
        if align > pool.alignment() {
            return Err(ArrayError::StringError(format!(
                "{} needs {}-byte alignment but the {} pool only guarantees {}",
                std::any::type_name::<T>(),
                align,
                pool.name(),
                pool.alignment()
            )));
        }
        Ok(())
    }

    fn mode_for(device_pool: &Option<&Arc<dyn MemoryPool>>) -> ExecutionMode {
        if device_pool.is_some() {
            ExecutionMode::Asynchronous
        } else {
            ExecutionMode::Synchronous
        }
    }

    /// Zero-byte buffers never touch a pool. `len` is nonzero only for
    /// zero-sized element types.
    fn empty(runtime: &Arc<Runtime>, mode: ExecutionMode, len: usize) -> Self {
        Self::with_residency(runtime, Residency::Empty, len, mode)
    }

    fn with_residency(
        runtime: &Arc<Runtime>,
        residency: Residency<T>,
        len: usize,
        mode: ExecutionMode,
    ) -> Self {
        if let Some(ptr) = residency.authoritative() {
            debug_assert_eq!(
                ptr.as_ptr() as usize % mem::align_of::<T>(),
                0,
                "pool returned memory misaligned for the element type"
            );
        }
        AsyncArray {
            residency,
            len,
            mode,
            runtime: Arc::clone(runtime),
            _marker: PhantomData,
        }
    }

    /// The device pointer if the buffer lives on the device, else the host
    /// pointer. Null once the buffer is empty.
    pub fn data(&self) -> *const T {
        self.data_mut().cast_const()
    }

    /// Mutable counterpart of [`AsyncArray::data`], for handing to kernels
    /// that write the buffer.
    pub fn data_mut(&self) -> *mut T {
        self.residency
            .authoritative()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn residency(&self) -> ResidencyKind {
        self.residency.kind()
    }

    pub fn has_device_copy(&self) -> bool {
        self.residency.device().is_some()
    }

    pub fn has_host_copy(&self) -> bool {
        self.residency.host().is_some()
    }

    /// The execution mode the buffer was created in. Release follows this
    /// mode even if the runtime has switched since.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Borrows the contents of a host-resident buffer.
    ///
    /// Returns `None` while the buffer lives on the device, including when it
    /// still holds its staging copy.
    pub fn host_slice(&self) -> Option<&[T]> {
        match self.residency {
            // SAFETY: the allocation holds `len` initialized elements and is
            // only released through `&mut self`.
            Residency::HostOnly { host } => {
                Some(unsafe { std::slice::from_raw_parts(host.as_ptr(), self.len) })
            }
            // SAFETY: an empty residency has no bytes; dangling is valid for
            // zero-length and zero-sized slices.
            Residency::Empty => {
                Some(unsafe { std::slice::from_raw_parts(NonNull::dangling().as_ptr(), self.len) })
            }
            _ => None,
        }
    }

    /// Releases the buffer's memory and leaves it empty.
    ///
    /// Host memory is freed right away. Device memory, together with any
    /// staging copy, is handed to the runtime's deferred executor and freed
    /// once the work already enqueued on the stream has completed. Calling
    /// `clear` on an empty buffer does nothing.
    ///
    /// Aborts the process if the release cannot be posted.
    pub fn clear(&mut self) {
        if let Err(e) = self.release() {
            fatal("AsyncArray::clear", &e);
        }
    }

    fn release(&mut self) -> ArrayResult<()> {
        let residency = self.residency.take();
        self.len = 0;

        let (device, host) = match residency {
            Residency::Empty => return Ok(()),
            Residency::HostOnly { host } => {
                self.warn_on_mode_change();
                trace!("Freeing host buffer {:p}", host);
                // SAFETY: the residency owned this allocation and was just
                // reset, so it is freed exactly once.
                unsafe { self.runtime.pinned_pool().free(host.cast()) };
                return Ok(());
            }
            Residency::DeviceOnly { device } => (device, None),
            Residency::DeviceWithHostStaging { device, host } => (device, Some(host)),
        };

        self.warn_on_mode_change();
        let device_pool = self.runtime.device_pool().ok_or_else(|| {
            BackendError::Other("Device buffer outlived its runtime's device pool".to_string())
        })?;
        let task = ReleaseTask::new(
            (device.cast(), Arc::clone(device_pool)),
            host.map(|host| (host.cast(), Arc::clone(self.runtime.pinned_pool()))),
        );

        let executor = self.runtime.executor();
        debug!(
            "Deferring release of {:p} on {} ({} executor)",
            device,
            self.runtime.stream().handle(),
            executor.kind()
        );
        executor.defer(self.runtime.stream(), task)
    }

    fn warn_on_mode_change(&self) {
        let current = self.runtime.execution_mode();
        if current != self.mode {
            warn!(
                "Releasing a buffer created in {} mode while the runtime is {}; \
                 following the creation mode",
                self.mode, current
            );
        }
    }

    /// Copies the first `dst.len()` elements into `dst`.
    ///
    /// Device-resident buffers are copied through the stream after all work
    /// enqueued before this call, so `dst` is ready when this returns.
    ///
    /// # Panics
    /// If `dst` is longer than the buffer. Aborts the process if the runtime
    /// copy fails.
    pub fn copy_to_host(&self, dst: &mut [T]) {
        assert!(
            dst.len() <= self.len,
            "Destination of {} elements exceeds buffer of {}",
            dst.len(),
            self.len
        );
        if let Err(e) = self.try_copy_to_host(dst) {
            fatal("AsyncArray::copy_to_host", &e);
        }
    }

    pub fn try_copy_to_host(&self, dst: &mut [T]) -> ArrayResult<()> {
        if dst.len() > self.len {
            return Err(ArrayError::StringError(format!(
                "Destination of {} elements exceeds buffer of {}",
                dst.len(),
                self.len
            )));
        }
        // SAFETY: dst is valid for dst.len() writes, checked against len.
        unsafe { self.copy_to_host_raw(dst.as_mut_ptr(), dst.len()) }
    }

    /// Copies `n` elements into `dst` without checking `n`.
    ///
    /// # Safety
    /// `n` must not exceed [`AsyncArray::len`] and `dst` must be valid for `n`
    /// element writes.
    pub unsafe fn copy_to_host_raw(&self, dst: *mut T, n: usize) -> ArrayResult<()> {
        let bytes = n * mem::size_of::<T>();
        if bytes == 0 {
            return Ok(());
        }

        match (self.residency.device(), self.residency.host()) {
            (Some(device), _) => {
                trace!("Copying {} bytes back from device {:p}", bytes, device);
                // SAFETY: caller guarantees dst; device is a live allocation
                // of at least `bytes` bytes.
                unsafe {
                    self.runtime
                        .stream()
                        .copy_dtoh(dst.cast::<u8>(), device.cast(), bytes)
                }
            }
            (None, Some(host)) => {
                // SAFETY: caller guarantees dst; host holds at least n elements.
                unsafe { ptr::copy_nonoverlapping(host.as_ptr(), dst, n) };
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Copies the whole buffer into a new vector.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        // SAFETY: out has capacity for len elements, all written by the copy
        // before the length is set.
        unsafe {
            if let Err(e) = self.copy_to_host_raw(out.as_mut_ptr(), self.len) {
                fatal("AsyncArray::to_vec", &e);
            }
            out.set_len(self.len);
        }
        out
    }
}

impl<T: DeviceCopy> Drop for AsyncArray<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: DeviceCopy> Debug for AsyncArray<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncArray")
            .field("type", &std::any::type_name::<T>())
            .field("len", &self.len)
            .field("residency", &self.residency.kind())
            .field("mode", &self.mode)
            .field("data", &self.data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostPool, PoolKind, PoolStats, SimConfig, SimStream, SIM_POISON};
    use crate::executor::ExecutorKind;
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// A device address a simulated kernel may capture.
    #[derive(Clone, Copy)]
    struct DevicePtr<T>(*mut T);

    // SAFETY: the kernels in these tests only touch buffers that the stream
    // keeps alive until they finish.
    unsafe impl<T> Send for DevicePtr<T> {}

    impl<T> DevicePtr<T> {
        fn get(&self) -> *mut T {
            self.0
        }
    }

    struct Harness {
        stream: Arc<SimStream>,
        pinned: Arc<HostPool>,
        device: Arc<HostPool>,
        runtime: Arc<Runtime>,
    }

    fn harness_with(config: SimConfig, executor: Option<ExecutorKind>) -> ArrayResult<Harness> {
        let stream = Arc::new(SimStream::new(config)?);
        let pinned = Arc::new(HostPool::named("test-pinned", PoolKind::Pinned));
        let device = Arc::new(
            HostPool::named("test-device", PoolKind::Device).with_poison(SIM_POISON),
        );
        let mut builder = Runtime::builder(stream.clone())
            .pinned_pool(pinned.clone())
            .device_pool(device.clone());
        if let Some(kind) = executor {
            builder = builder.executor(kind);
        }
        Ok(Harness {
            runtime: builder.build()?,
            stream,
            pinned,
            device,
        })
    }

    fn harness() -> ArrayResult<Harness> {
        harness_with(SimConfig::default(), None)
    }

    fn cpu_harness() -> ArrayResult<(Arc<HostPool>, Arc<Runtime>)> {
        let pinned = Arc::new(HostPool::named("test-pinned", PoolKind::Pinned));
        let runtime = Runtime::builder(Arc::new(crate::backend::CpuStream::new()))
            .pinned_pool(pinned.clone())
            .build()?;
        Ok((pinned, runtime))
    }

    /// Blocks the stream until the returned sender is used or dropped.
    fn gate(stream: &SimStream) -> ArrayResult<mpsc::Sender<()>> {
        let (open, wait) = mpsc::channel::<()>();
        stream.launch(move || {
            let _ = wait.recv();
        })?;
        Ok(open)
    }

    #[test]
    fn test_round_trip_synchronous() -> ArrayResult<()> {
        let (pinned, runtime) = cpu_harness()?;
        let src = [1.5f64, -2.0, 3.25];

        let array = AsyncArray::from_host_in(&runtime, &src);
        assert_eq!(array.mode(), ExecutionMode::Synchronous);
        assert_eq!(array.residency(), ResidencyKind::HostOnly);
        assert!(!array.has_device_copy());
        assert_eq!(array.host_slice(), Some(&src[..]));

        let mut dst = [0.0f64; 3];
        array.copy_to_host(&mut dst);
        assert_eq!(dst, src);

        drop(array);
        assert_eq!(pinned.stats().frees, 1);
        assert_eq!(pinned.stats().bytes_in_use, 0);
        Ok(())
    }

    #[test]
    fn test_round_trip_asynchronous() -> ArrayResult<()> {
        let h = harness()?;
        let src: Vec<u64> = (0..1000).map(|i| i * 7 + 3).collect();

        let array = AsyncArray::from_host_in(&h.runtime, &src);
        assert_eq!(array.mode(), ExecutionMode::Asynchronous);
        assert!(array.host_slice().is_none());
        assert_eq!(array.to_vec(), src);
        Ok(())
    }

    #[test]
    fn test_async_construction_enqueues_copy() -> ArrayResult<()> {
        let h = harness()?;
        let open = gate(&h.stream)?;

        let array = AsyncArray::<i32>::from_host_in(&h.runtime, &[1, 2, 3, 4]);
        assert_eq!(array.residency(), ResidencyKind::DeviceWithHostStaging);
        assert!(array.has_device_copy());
        assert!(array.has_host_copy());
        assert_eq!(h.device.stats().allocations, 1);
        assert_eq!(h.device.stats().bytes_in_use, 16);
        assert_eq!(h.pinned.stats().allocations, 1);
        // The gate and the host-to-device copy are both still queued.
        assert_eq!(h.stream.pending(), 2);
        let device = array.residency.device().map(|p| p.as_ptr().cast_const());
        assert_eq!(Some(array.data()), device);

        open.send(()).ok();
        let mut dst = [0i32; 4];
        array.copy_to_host(&mut dst);
        assert_eq!(dst, [1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_empty_buffers_never_touch_pools() -> ArrayResult<()> {
        let (cpu_pinned, cpu) = cpu_harness()?;
        let h = harness()?;

        for runtime in [&cpu, &h.runtime] {
            let mut array = AsyncArray::<f64>::from_host_in(runtime, &[]);
            assert!(array.data().is_null());
            assert!(array.is_empty());
            assert_eq!(array.residency(), ResidencyKind::Empty);
            array.copy_to_host(&mut []);
            assert!(array.to_vec().is_empty());
            array.clear();

            let array = AsyncArray::<f64>::uninit_in(runtime, 0);
            assert!(array.data().is_null());
        }

        assert_eq!(cpu_pinned.stats(), PoolStats::default());
        assert_eq!(h.pinned.stats(), PoolStats::default());
        assert_eq!(h.device.stats(), PoolStats::default());
        Ok(())
    }

    #[test]
    fn test_global_runtime_empty_buffer() {
        let array = AsyncArray::<f64>::from_host(&[]);
        assert!(array.data().is_null());
        assert_eq!(array.len(), 0);
    }

    #[test]
    fn test_uninit_synchronous_uses_host_pool_only() -> ArrayResult<()> {
        let h = harness()?;
        let _outside = h.runtime.launch_region(false);

        let array = AsyncArray::<f32>::uninit_in(&h.runtime, 100);
        assert_eq!(array.mode(), ExecutionMode::Synchronous);
        assert_eq!(array.residency(), ResidencyKind::HostOnly);
        assert_eq!(h.pinned.stats().allocations, 1);
        assert_eq!(h.pinned.stats().bytes_in_use, 100 * mem::size_of::<f32>());
        assert_eq!(h.device.stats().allocations, 0);
        Ok(())
    }

    #[test]
    fn test_uninit_asynchronous_filled_by_kernel() -> ArrayResult<()> {
        let h = harness()?;
        let array = AsyncArray::<u32>::uninit_in(&h.runtime, 64);
        assert_eq!(array.residency(), ResidencyKind::DeviceOnly);
        assert!(!array.has_host_copy());
        assert_eq!(h.pinned.stats().allocations, 0);

        let out = DevicePtr(array.data_mut());
        let n = array.len();
        h.stream.launch(move || {
            for i in 0..n {
                // SAFETY: the buffer holds n elements and outlives the kernel.
                unsafe { out.get().add(i).write(i as u32 * 2) };
            }
        })?;

        let expected: Vec<u32> = (0..64).map(|i| i * 2).collect();
        assert_eq!(array.to_vec(), expected);
        Ok(())
    }

    #[test]
    fn test_clear_is_idempotent() -> ArrayResult<()> {
        let h = harness()?;
        let mut array = AsyncArray::from_host_in(&h.runtime, &[9u8; 32]);

        array.clear();
        assert!(array.data().is_null());
        assert_eq!(array.len(), 0);
        assert_eq!(array.residency(), ResidencyKind::Empty);

        array.clear();
        drop(array);
        h.runtime.synchronize()?;
        assert_eq!(h.device.stats().frees, 1);
        assert_eq!(h.pinned.stats().frees, 1);
        Ok(())
    }

    #[test]
    fn test_release_waits_for_outstanding_kernel() -> ArrayResult<()> {
        let h = harness()?;
        let mut rng = rand::thread_rng();

        for round in 0..20 {
            let len = rng.gen_range(1..512);
            let src: Vec<u32> = (0..len).map(|_| rng.gen_range(0..1_000_000)).collect();
            let expected: u64 = src.iter().map(|&v| v as u64).sum();

            let array = AsyncArray::from_host_in(&h.runtime, &src);
            let input = DevicePtr(array.data_mut());
            let frees_before = h.device.stats().frees;
            let device = Arc::clone(&h.device);
            let intact = Arc::new(AtomicBool::new(false));
            let observed = Arc::clone(&intact);

            h.stream.launch(move || {
                thread::sleep(Duration::from_millis(5));
                // SAFETY: the release of this buffer is queued behind us.
                let data = unsafe { std::slice::from_raw_parts(input.get(), len) };
                let sum: u64 = data.iter().map(|&v| v as u64).sum();
                let not_freed = device.stats().frees == frees_before;
                observed.store(sum == expected && not_freed, Ordering::SeqCst);
            })?;

            drop(array);
            h.runtime.synchronize()?;
            assert!(intact.load(Ordering::SeqCst), "round {} read freed memory", round);
            assert_eq!(h.device.stats().frees, frees_before + 1);
        }

        assert_eq!(h.device.stats().bytes_in_use, 0);
        assert_eq!(h.pinned.stats().bytes_in_use, 0);
        Ok(())
    }

    #[test]
    fn test_release_returns_before_device_work() -> ArrayResult<()> {
        let h = harness()?;
        let open = gate(&h.stream)?;

        let array = AsyncArray::from_host_in(&h.runtime, &[1.0f32; 16]);
        drop(array);
        // The stream is blocked, so the release is still queued.
        assert_eq!(h.device.stats().frees, 0);
        assert_eq!(h.pinned.stats().frees, 0);

        open.send(()).ok();
        h.runtime.synchronize()?;
        assert_eq!(h.device.stats().frees, 1);
        assert_eq!(h.pinned.stats().frees, 1);
        Ok(())
    }

    #[test]
    fn test_random_round_trips() -> ArrayResult<()> {
        let h = harness()?;
        let (_, cpu) = cpu_harness()?;
        let mut rng = rand::thread_rng();

        for _ in 0..16 {
            let len = rng.gen_range(1..256);
            let src: Vec<(i16, f64)> = (0..len).map(|_| (rng.gen(), rng.gen())).collect();

            for runtime in [&h.runtime, &cpu] {
                let array = AsyncArray::from_host_in(runtime, &src);
                let mut dst = vec![(0i16, 0.0f64); len];
                array.copy_to_host(&mut dst);
                assert_eq!(dst, src);
            }
        }
        Ok(())
    }

    #[test]
    fn test_partial_copy_back() -> ArrayResult<()> {
        let h = harness()?;
        let array = AsyncArray::from_host_in(&h.runtime, &[10i64, 20, 30, 40]);

        let mut head = [0i64; 2];
        array.copy_to_host(&mut head);
        assert_eq!(head, [10, 20]);

        let mut too_long = [0i64; 5];
        assert!(array.try_copy_to_host(&mut too_long).is_err());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "exceeds buffer")]
    fn test_copy_to_host_rejects_long_destination() {
        let array = AsyncArray::from_host_in(&Runtime::cpu(), &[1u8, 2]);
        let mut dst = [0u8; 3];
        array.copy_to_host(&mut dst);
    }

    #[test]
    fn test_blocking_fallback_frees_on_release() -> ArrayResult<()> {
        let h = harness_with(SimConfig::without_callbacks(), None)?;
        assert_eq!(h.runtime.executor_kind(), ExecutorKind::Blocking);

        let array = AsyncArray::from_host_in(&h.runtime, &[3u16; 8]);
        let slow = Arc::new(AtomicBool::new(false));
        let finished = Arc::clone(&slow);
        h.stream.launch(move || {
            thread::sleep(Duration::from_millis(20));
            finished.store(true, Ordering::SeqCst);
        })?;

        drop(array);
        assert!(slow.load(Ordering::SeqCst));
        assert_eq!(h.stream.pending(), 0);
        assert_eq!(h.device.stats().frees, 1);
        assert_eq!(h.pinned.stats().frees, 1);
        Ok(())
    }

    #[test]
    fn test_forced_callback_executor_falls_back() -> ArrayResult<()> {
        let h = harness_with(SimConfig::without_callbacks(), Some(ExecutorKind::StreamCallback))?;
        let array = AsyncArray::<u8>::uninit_in(&h.runtime, 4096);
        drop(array);
        assert_eq!(h.device.stats().frees, 1);
        Ok(())
    }

    #[test]
    fn test_host_task_executor_defers_release() -> ArrayResult<()> {
        let config = SimConfig {
            host_func: false,
            host_task: true,
        };
        let h = harness_with(config, None)?;
        assert_eq!(h.runtime.executor_kind(), ExecutorKind::HostTask);

        let open = gate(&h.stream)?;
        let array = AsyncArray::from_host_in(&h.runtime, &[7u32; 10]);
        drop(array);
        assert_eq!(h.device.stats().frees, 0);

        open.send(()).ok();
        h.runtime.synchronize()?;
        assert_eq!(h.device.stats().frees, 1);
        assert_eq!(h.pinned.stats().frees, 1);
        Ok(())
    }

    #[test]
    fn test_release_follows_creation_mode() -> ArrayResult<()> {
        let h = harness()?;

        // Created asynchronously, released after leaving the launch region.
        let array = AsyncArray::from_host_in(&h.runtime, &[1u32; 4]);
        {
            let _outside = h.runtime.launch_region(false);
            drop(array);
        }
        h.runtime.synchronize()?;
        assert_eq!(h.device.stats().frees, 1);
        assert_eq!(h.device.stats().bytes_in_use, 0);
        assert_eq!(h.pinned.stats().bytes_in_use, 0);

        // Created synchronously, released inside the launch region.
        let array = {
            let _outside = h.runtime.launch_region(false);
            AsyncArray::from_host_in(&h.runtime, &[2u32; 4])
        };
        assert_eq!(array.mode(), ExecutionMode::Synchronous);
        assert_eq!(h.runtime.execution_mode(), ExecutionMode::Asynchronous);
        drop(array);
        assert_eq!(h.device.stats().allocations, 1);
        assert_eq!(h.pinned.stats().frees, 2);
        assert_eq!(h.pinned.stats().bytes_in_use, 0);
        Ok(())
    }

    #[test]
    fn test_device_allocation_failure_frees_staging() -> ArrayResult<()> {
        let stream = Arc::new(SimStream::new(SimConfig::default())?);
        let pinned = Arc::new(HostPool::new(PoolKind::Pinned));
        let device = Arc::new(HostPool::named("tiny", PoolKind::Device).with_capacity(16));
        let runtime = Runtime::builder(stream)
            .pinned_pool(pinned.clone())
            .device_pool(device)
            .build()?;

        let result = AsyncArray::try_from_host_in(&runtime, &[0u32; 100]);
        assert!(matches!(
            result,
            Err(ArrayError::BackendError(BackendError::AllocationFailed { .. }))
        ));
        assert_eq!(pinned.stats().allocations, 1);
        assert_eq!(pinned.stats().bytes_in_use, 0);

        let fits = AsyncArray::try_from_host_in(&runtime, &[5u32; 4])?;
        assert_eq!(fits.to_vec(), vec![5; 4]);
        Ok(())
    }

    #[test]
    fn test_oversized_request_returns_error() -> ArrayResult<()> {
        let stream = Arc::new(SimStream::new(SimConfig::default())?);
        let device = Arc::new(HostPool::named("tiny", PoolKind::Device).with_capacity(1024));
        let runtime = Runtime::builder(stream).device_pool(device.clone()).build()?;

        let result = AsyncArray::<u64>::try_uninit_in(&runtime, usize::MAX / 8);
        assert!(matches!(
            result,
            Err(ArrayError::BackendError(BackendError::AllocationFailed { .. }))
        ));
        assert_eq!(device.stats().allocations, 0);
        Ok(())
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    #[repr(align(256))]
    struct Wide(u8);

    unsafe impl DeviceCopy for Wide {}

    #[test]
    fn test_over_aligned_elements() -> ArrayResult<()> {
        let (cpu_pinned, cpu) = cpu_harness()?;
        let src = [Wide(1), Wide(2), Wide(3)];

        let result = AsyncArray::try_from_host_in(&cpu, &src);
        assert!(matches!(result, Err(ArrayError::StringError(_))));
        let result = AsyncArray::<Wide>::try_uninit_in(&cpu, 3);
        assert!(matches!(result, Err(ArrayError::StringError(_))));
        assert_eq!(cpu_pinned.stats().allocations, 0);

        // The device pool is checked before anything is allocated.
        let h = harness()?;
        assert!(AsyncArray::try_from_host_in(&h.runtime, &src).is_err());
        assert_eq!(h.pinned.stats().allocations, 0);
        assert_eq!(h.device.stats().allocations, 0);

        let pinned = Arc::new(HostPool::new(PoolKind::Pinned).with_alignment(256));
        let runtime = Runtime::builder(Arc::new(crate::backend::CpuStream::new()))
            .pinned_pool(pinned.clone())
            .build()?;
        let array = AsyncArray::try_from_host_in(&runtime, &src)?;
        assert_eq!(array.data() as usize % 256, 0);
        assert_eq!(array.to_vec(), src.to_vec());
        assert_eq!(array.host_slice(), Some(&src[..]));
        Ok(())
    }

    #[test]
    fn test_zero_sized_elements() -> ArrayResult<()> {
        let h = harness()?;
        let array = AsyncArray::from_host_in(&h.runtime, &[(); 5]);
        assert_eq!(array.len(), 5);
        assert_eq!(array.residency(), ResidencyKind::Empty);
        assert_eq!(array.to_vec().len(), 5);
        assert_eq!(h.device.stats().allocations, 0);
        Ok(())
    }

    #[test]
    fn test_array_moves_between_threads() -> ArrayResult<()> {
        let h = harness()?;
        let array = AsyncArray::from_host_in(&h.runtime, &[4u8; 3]);
        let copied = thread::spawn(move || array.to_vec())
            .join()
            .map_err(|_| ArrayError::from("worker panicked"))?;
        assert_eq!(copied, vec![4, 4, 4]);
        Ok(())
    }
}
