use std::ffi::c_void;
use std::fmt::{Debug, Display, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

mod cpu;
mod device;
mod feature;
mod pool;
mod sim;

#[cfg(feature = "cuda")]
mod cuda;

pub use cpu::{CpuStream, HostPool};
pub use device::{
    DeviceType, ExecutionMode, LaunchRegionGuard, Runtime, RuntimeBuilder, SIM_POISON,
};
pub use feature::{
    StreamFeature, StreamFeatures, STREAM_FEATURE_ASYNC_COPY, STREAM_FEATURE_HOST_FUNC,
    STREAM_FEATURE_HOST_TASK,
};
pub use pool::{MemoryPool, PoolKind, PoolStats};
pub use sim::{SimConfig, SimStream};

#[cfg(feature = "cuda")]
pub use cuda::{set_device, CudaError, CudaPool, CudaStream};

use crate::ArrayResult;

/// Opaque identity of a command stream, used for logging and equality checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub usize);

impl Display for StreamHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{:#x}", self.0)
    }
}

static NEXT_STREAM_ID: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn next_stream_handle() -> StreamHandle {
    StreamHandle(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
}

/// C-ABI function the runtime invokes once a stream has drained up to the
/// point of registration.
pub type HostFn = unsafe extern "C" fn(user_data: *mut c_void);

/// Work executed on the host, ordered after everything enqueued before it.
pub type HostTask = Box<dyn FnOnce() + Send + 'static>;

/// An in-order command queue on some device.
///
/// Copies take raw pointers because the device side of a transfer is not
/// addressable from the host in general.
pub trait DeviceStream: Debug + Send + Sync {
    fn device_type(&self) -> DeviceType;

    fn handle(&self) -> StreamHandle;

    /// Whether work enqueued on this stream runs asynchronously to the host.
    fn is_async_active(&self) -> bool;

    fn features(&self) -> StreamFeatures;

    /// Enqueues a host-to-device copy. Returns without waiting for it.
    ///
    /// # Safety
    /// `src` must stay valid until the copy has executed on the stream, and
    /// `dst` must be a device allocation of at least `bytes` bytes.
    unsafe fn copy_htod_async(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
    ) -> ArrayResult<()>;

    /// Copies device memory to the host, returning once `dst` holds the data.
    ///
    /// # Safety
    /// `dst` must be valid for `bytes` bytes of writes and `src` must be a
    /// live device allocation of at least `bytes` bytes.
    unsafe fn copy_dtoh(&self, dst: *mut u8, src: NonNull<u8>, bytes: usize)
        -> ArrayResult<()>;

    /// Blocks until all work enqueued so far has completed.
    fn synchronize(&self) -> ArrayResult<()>;

    /// Registers `func(user_data)` to run after all work enqueued so far.
    ///
    /// # Safety
    /// `user_data` must remain valid until `func` has been invoked. If this
    /// returns an error `func` is never invoked.
    unsafe fn launch_host_func(&self, func: HostFn, user_data: *mut c_void) -> ArrayResult<()> {
        let _ = (func, user_data);
        Err(BackendError::Unsupported {
            device: self.device_type(),
            operation: "launch_host_func",
        }
        .into())
    }

    /// Submits a host task ordered after all work enqueued so far.
    fn submit_host_task(&self, task: HostTask) -> ArrayResult<()> {
        drop(task);
        Err(BackendError::Unsupported {
            device: self.device_type(),
            operation: "submit_host_task",
        }
        .into())
    }
}

#[derive(Debug)]
pub enum BackendError {
    AllocationFailed {
        pool: String,
        bytes: usize,
    },
    Unsupported {
        device: DeviceType,
        operation: &'static str,
    },
    StreamClosed(String),
    Runtime {
        call: &'static str,
        description: String,
    },
    #[cfg(feature = "cuda")]
    CudaError(CudaError),
    Other(String),
}

impl BackendError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BackendError::Unsupported { .. })
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::AllocationFailed { pool, bytes } => {
                write!(f, "Failed to allocate {} bytes from the {} pool", bytes, pool)
            }
            BackendError::Unsupported { device, operation } => {
                write!(f, "{} is not supported on the {} backend", operation, device)
            }
            BackendError::StreamClosed(s) => write!(f, "Stream closed: {}", s),
            BackendError::Runtime { call, description } => {
                write!(f, "{} failed: {}", call, description)
            }
            #[cfg(feature = "cuda")]
            BackendError::CudaError(e) => write!(f, "{}", e),
            BackendError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(feature = "cuda")]
impl From<CudaError> for BackendError {
    fn from(err: CudaError) -> Self {
        BackendError::CudaError(err)
    }
}

#[cfg(feature = "cuda")]
impl From<CudaError> for crate::ArrayError {
    fn from(err: CudaError) -> Self {
        crate::ArrayError::BackendError(BackendError::CudaError(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArrayError;

    #[test]
    fn test_unsupported_defaults() {
        let stream = CpuStream::new();

        let err = stream.submit_host_task(Box::new(|| {})).unwrap_err();
        match err {
            ArrayError::BackendError(e) => assert!(e.is_unsupported()),
            other => panic!("unexpected error: {}", other),
        }

        extern "C" fn noop(_: *mut c_void) {}
        let err = unsafe { stream.launch_host_func(noop, std::ptr::null_mut()) }.unwrap_err();
        assert!(err.to_string().contains("launch_host_func"));
    }

    #[test]
    fn test_error_display() {
        let err = BackendError::AllocationFailed {
            pool: "pinned".to_string(),
            bytes: 64,
        };
        assert_eq!(err.to_string(), "Failed to allocate 64 bytes from the pinned pool");

        let err: ArrayError = BackendError::Runtime {
            call: "cudaLaunchHostFunc",
            description: "invalid resource handle".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Backend error: cudaLaunchHostFunc failed: invalid resource handle"
        );
    }
}
