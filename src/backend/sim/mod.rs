//! A simulated accelerator.
//!
//! Work enqueued on a [`SimStream`] runs in submission order on a dedicated
//! worker thread, which stands in for the device. Device memory is ordinary
//! host memory handed out by a [`HostPool`](crate::backend::HostPool) of kind
//! `Device`, so every asynchronous code path can be exercised on machines
//! without an accelerator.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};

use crate::backend::feature::{
    StreamFeatures, STREAM_FEATURE_ASYNC_COPY, STREAM_FEATURE_HOST_FUNC, STREAM_FEATURE_HOST_TASK,
};
use crate::backend::{
    next_stream_handle, BackendError, DeviceStream, DeviceType, HostFn, HostTask, StreamHandle,
};
use crate::ArrayResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Which completion primitives the simulated runtime exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Stream callbacks through `launch_host_func`.
    pub host_func: bool,
    /// Closures through `submit_host_task`.
    pub host_task: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            host_func: true,
            host_task: true,
        }
    }
}

impl SimConfig {
    /// A runtime with no completion primitive at all.
    pub fn without_callbacks() -> Self {
        SimConfig {
            host_func: false,
            host_task: false,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    submitted: u64,
    completed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    progress: Mutex<Progress>,
    drained: Condvar,
}

struct SendPtr<T>(*mut T);

// SAFETY: the stream only moves addresses to the worker; the callers of the
// unsafe copy entry points guarantee the memory outlives the job.
unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    fn get(self) -> *mut T {
        self.0
    }
}

#[derive(Debug)]
pub struct SimStream {
    handle: StreamHandle,
    config: SimConfig,
    sender: Mutex<Option<Sender<Job>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimStream {
    pub fn new(config: SimConfig) -> ArrayResult<Self> {
        let handle = next_stream_handle();
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("sim-{}", handle))
            .spawn(move || run_worker(receiver, worker_shared))
            .map_err(|e| BackendError::Runtime {
                call: "spawn simulated device",
                description: e.to_string(),
            })?;

        debug!("Simulated stream {} created with {:?}", handle, config);
        Ok(SimStream {
            handle,
            config,
            sender: Mutex::new(Some(sender)),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueues a kernel. It runs on the device thread after everything
    /// enqueued before it.
    pub fn launch<F>(&self, kernel: F) -> ArrayResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(kernel))
    }

    /// Number of enqueued jobs that have not finished yet.
    pub fn pending(&self) -> u64 {
        let progress = self.lock_progress();
        progress.submitted - progress.completed
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.shared
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, job: Job) -> ArrayResult<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(BackendError::StreamClosed(self.handle.to_string()).into());
        };

        self.lock_progress().submitted += 1;
        if sender.send(job).is_err() {
            self.lock_progress().submitted -= 1;
            return Err(BackendError::StreamClosed(self.handle.to_string()).into());
        }
        Ok(())
    }
}

fn run_worker(receiver: Receiver<Job>, shared: Arc<Shared>) {
    for job in receiver {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job on simulated stream panicked");
        }

        let mut progress = shared
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        progress.completed += 1;
        shared.drained.notify_all();
    }
}

impl DeviceStream for SimStream {
    fn device_type(&self) -> DeviceType {
        DeviceType::Sim
    }

    fn handle(&self) -> StreamHandle {
        self.handle
    }

    fn is_async_active(&self) -> bool {
        true
    }

    fn features(&self) -> StreamFeatures {
        StreamFeatures::new()
            .with(STREAM_FEATURE_ASYNC_COPY, true, Some("Copies run on the device thread"))
            .with(
                STREAM_FEATURE_HOST_FUNC,
                self.config.host_func,
                Some("C callbacks ordered after prior work"),
            )
            .with(
                STREAM_FEATURE_HOST_TASK,
                self.config.host_task,
                Some("Host closures ordered after prior work"),
            )
    }

    unsafe fn copy_htod_async(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
    ) -> ArrayResult<()> {
        trace!("{}: enqueue htod copy of {} bytes", self.handle, bytes);
        let dst = SendPtr(dst.as_ptr());
        let src = SendPtr(src.as_ptr());
        self.enqueue(Box::new(move || {
            // SAFETY: upheld by the caller of copy_htod_async.
            unsafe { std::ptr::copy_nonoverlapping(src.get(), dst.get(), bytes) };
        }))
    }

    unsafe fn copy_dtoh(&self, dst: *mut u8, src: NonNull<u8>, bytes: usize) -> ArrayResult<()> {
        trace!("{}: dtoh copy of {} bytes", self.handle, bytes);
        let dst = SendPtr(dst);
        let src = SendPtr(src.as_ptr());
        self.enqueue(Box::new(move || {
            // SAFETY: upheld by the caller of copy_dtoh, which waits below.
            unsafe { std::ptr::copy_nonoverlapping(src.get(), dst.get(), bytes) };
        }))?;
        self.synchronize()
    }

    fn synchronize(&self) -> ArrayResult<()> {
        trace!("Synchronizing {}", self.handle);
        let mut progress = self.lock_progress();
        while progress.completed < progress.submitted {
            progress = self
                .shared
                .drained
                .wait(progress)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    unsafe fn launch_host_func(&self, func: HostFn, user_data: *mut c_void) -> ArrayResult<()> {
        if !self.config.host_func {
            return Err(BackendError::Unsupported {
                device: DeviceType::Sim,
                operation: "launch_host_func",
            }
            .into());
        }

        let data = SendPtr(user_data);
        self.enqueue(Box::new(move || {
            // SAFETY: upheld by the caller of launch_host_func.
            unsafe { func(data.get()) };
        }))
    }

    fn submit_host_task(&self, task: HostTask) -> ArrayResult<()> {
        if !self.config.host_task {
            return Err(BackendError::Unsupported {
                device: DeviceType::Sim,
                operation: "submit_host_task",
            }
            .into());
        }
        self.enqueue(task)
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        trace!("Destroying simulated stream {}", self.handle);
        // Closing the channel lets the worker finish the queued jobs and exit.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Simulated device thread for {} panicked", self.handle);
            }
        }
    }
}
