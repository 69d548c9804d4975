//! Deferred release of device allocations.
//!
//! Freeing device memory while kernels that read it are still queued is a
//! use-after-free; waiting for them on the releasing thread stalls the
//! pipeline. A [`DeferredExecutor`] instead posts a [`ReleaseTask`] to the
//! stream so that it runs once everything enqueued before it has retired.
//!
//! One executor exists per kind of completion primitive a backend offers:
//!
//! - [`ImmediateExecutor`]: no accelerator, nothing can be in flight.
//! - [`StreamCallbackExecutor`]: a C callback registered on the stream.
//! - [`HostTaskExecutor`]: a host closure submitted to the stream's queue.
//! - [`BlockingExecutor`]: drain the stream, then free. Also the fallback
//!   for the two above when the stream turns out not to support them.

use std::ffi::c_void;
use std::fmt::{Debug, Display, Formatter};
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace, warn};

use crate::backend::{
    DeviceStream, MemoryPool, STREAM_FEATURE_HOST_FUNC, STREAM_FEATURE_HOST_TASK,
};
use crate::{ArrayError, ArrayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Immediate,
    StreamCallback,
    HostTask,
    Blocking,
}

impl ExecutorKind {
    pub fn build(self) -> Box<dyn DeferredExecutor> {
        match self {
            ExecutorKind::Immediate => Box::new(ImmediateExecutor),
            ExecutorKind::StreamCallback => Box::new(StreamCallbackExecutor),
            ExecutorKind::HostTask => Box::new(HostTaskExecutor),
            ExecutorKind::Blocking => Box::new(BlockingExecutor),
        }
    }
}

impl Display for ExecutorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Immediate => write!(f, "immediate"),
            ExecutorKind::StreamCallback => write!(f, "stream-callback"),
            ExecutorKind::HostTask => write!(f, "host-task"),
            ExecutorKind::Blocking => write!(f, "blocking"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = ArrayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "immediate" => Ok(ExecutorKind::Immediate),
            "callback" | "stream-callback" | "host-func" => Ok(ExecutorKind::StreamCallback),
            "host-task" | "task" => Ok(ExecutorKind::HostTask),
            "blocking" | "sync" => Ok(ExecutorKind::Blocking),
            other => Err(ArrayError::ConfigError(format!(
                "Unknown executor '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug)]
struct Allocation {
    ptr: NonNull<u8>,
    pool: Arc<dyn MemoryPool>,
}

/// The allocations of one released buffer: the device copy and, when the
/// buffer was seeded from host data, its pinned staging copy.
#[derive(Debug)]
pub struct ReleaseTask {
    device: Allocation,
    host: Option<Allocation>,
}

// SAFETY: the task exclusively owns both allocations and the pools are
// Send + Sync.
unsafe impl Send for ReleaseTask {}

impl ReleaseTask {
    pub(crate) fn new(
        device: (NonNull<u8>, Arc<dyn MemoryPool>),
        host: Option<(NonNull<u8>, Arc<dyn MemoryPool>)>,
    ) -> Self {
        ReleaseTask {
            device: Allocation {
                ptr: device.0,
                pool: device.1,
            },
            host: host.map(|(ptr, pool)| Allocation { ptr, pool }),
        }
    }

    /// Returns both allocations to their pools.
    pub fn run(self) {
        trace!(
            "Releasing {:p} to {} and {:?}",
            self.device.ptr,
            self.device.pool.name(),
            self.host.as_ref().map(|h| h.ptr)
        );
        // SAFETY: the task is the sole owner of these allocations and is
        // consumed here, so each one is freed exactly once.
        unsafe {
            self.device.pool.free(self.device.ptr);
            if let Some(host) = self.host {
                host.pool.free(host.ptr);
            }
        }
    }
}

pub trait DeferredExecutor: Debug + Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Arranges for `task` to run once all work enqueued on `stream` so far
    /// has completed. Does not wait for that work unless the executor is
    /// blocking by nature.
    fn defer(&self, stream: &dyn DeviceStream, task: ReleaseTask) -> ArrayResult<()>;
}

/// Picks the executor matching what `stream` supports.
pub fn select_executor(stream: &dyn DeviceStream) -> Box<dyn DeferredExecutor> {
    let features = stream.features();
    let kind = if !stream.is_async_active() {
        ExecutorKind::Immediate
    } else if features.is_supported(STREAM_FEATURE_HOST_FUNC) {
        ExecutorKind::StreamCallback
    } else if features.is_supported(STREAM_FEATURE_HOST_TASK) {
        ExecutorKind::HostTask
    } else {
        ExecutorKind::Blocking
    };
    debug!("Selected {} executor for {}", kind, stream.handle());
    kind.build()
}

fn drain_then_run(stream: &dyn DeviceStream, task: ReleaseTask) -> ArrayResult<()> {
    stream.synchronize()?;
    task.run();
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecutor;

impl DeferredExecutor for ImmediateExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Immediate
    }

    fn defer(&self, _stream: &dyn DeviceStream, task: ReleaseTask) -> ArrayResult<()> {
        task.run();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingExecutor;

impl DeferredExecutor for BlockingExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Blocking
    }

    fn defer(&self, stream: &dyn DeviceStream, task: ReleaseTask) -> ArrayResult<()> {
        trace!("Draining {} before release", stream.handle());
        drain_then_run(stream, task)
    }
}

unsafe extern "C" fn release_trampoline(user_data: *mut c_void) {
    // SAFETY: user_data is the pointer produced by Box::into_raw in
    // StreamCallbackExecutor::defer, handed to the runtime exactly once.
    let task = unsafe { Box::from_raw(user_data.cast::<ReleaseTask>()) };
    task.run();
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCallbackExecutor;

impl DeferredExecutor for StreamCallbackExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::StreamCallback
    }

    fn defer(&self, stream: &dyn DeviceStream, task: ReleaseTask) -> ArrayResult<()> {
        if !stream.features().is_supported(STREAM_FEATURE_HOST_FUNC) {
            warn!("{} has no stream callbacks, releasing synchronously", stream.handle());
            return drain_then_run(stream, task);
        }

        let raw = Box::into_raw(Box::new(task));
        // SAFETY: raw stays valid until the trampoline reclaims it.
        match unsafe { stream.launch_host_func(release_trampoline, raw.cast()) } {
            Ok(()) => {
                trace!("Release posted to {}", stream.handle());
                Ok(())
            }
            Err(e) => {
                // SAFETY: on error the stream never invokes the callback.
                let task = unsafe { Box::from_raw(raw) };
                if e.is_unsupported() {
                    warn!("{}: {}, releasing synchronously", stream.handle(), e);
                    drain_then_run(stream, *task)
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostTaskExecutor;

impl DeferredExecutor for HostTaskExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::HostTask
    }

    fn defer(&self, stream: &dyn DeviceStream, task: ReleaseTask) -> ArrayResult<()> {
        if !stream.features().is_supported(STREAM_FEATURE_HOST_TASK) {
            warn!("{} has no host tasks, releasing synchronously", stream.handle());
            return drain_then_run(stream, task);
        }

        // The slot lets the task be recovered if the submission is refused.
        let slot = Arc::new(Mutex::new(Some(task)));
        let queued = Arc::clone(&slot);
        let submitted = stream.submit_host_task(Box::new(move || {
            let task = queued.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(task) = task {
                task.run();
            }
        }));

        match submitted {
            Ok(()) => {
                trace!("Release posted to {}", stream.handle());
                Ok(())
            }
            Err(e) => {
                let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                match task {
                    Some(task) if e.is_unsupported() => {
                        warn!("{}: {}, releasing synchronously", stream.handle(), e);
                        drain_then_run(stream, task)
                    }
                    _ => Err(e),
                }
            }
        }
    }
}
