//! Stages a batch of buffers through the simulated accelerator: each buffer
//! is seeded from host data, transformed by a kernel, copied back and
//! released while the next kernel is still queued.
//!
//! Run with `ASYNCARRAY_LOG=debug cargo run --example pipeline`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use asyncarray::backend::{HostPool, PoolKind, SimConfig, SimStream, SIM_POISON};
use asyncarray::prelude::*;

/// A device address the simulated kernel can capture.
#[derive(Clone, Copy)]
struct DevicePtr(*mut f32);

// SAFETY: every buffer outlives the kernels enqueued against it because its
// release is ordered behind them on the stream.
unsafe impl Send for DevicePtr {}

impl DevicePtr {
    fn get(&self) -> *mut f32 {
        self.0
    }
}

fn main() -> ArrayResult<()> {
    if let Err(e) = asyncarray::log::init() {
        eprintln!("Logger already installed: {}", e);
    }

    let config = RuntimeConfig::from_env()?;
    let stream = Arc::new(SimStream::new(config.sim)?);
    let pinned = Arc::new(HostPool::new(PoolKind::Pinned));
    let device = Arc::new(HostPool::named("sim-device", PoolKind::Device).with_poison(SIM_POISON));
    let mut builder = Runtime::builder(stream.clone())
        .pinned_pool(pinned.clone())
        .device_pool(device.clone())
        .launch_region(config.launch_region);
    if let Some(kind) = config.executor {
        builder = builder.executor(kind);
    }
    let runtime = builder.build()?;

    println!(
        "Runtime: {} in {} mode, {} executor",
        runtime.device_type(),
        runtime.execution_mode(),
        runtime.executor_kind()
    );

    let start = Instant::now();
    let mut checksum = 0.0f64;
    for batch in 0..8 {
        let input: Vec<f32> = (0..4096).map(|i| (i + batch) as f32).collect();
        let array = AsyncArray::from_host_in(&runtime, &input);

        let data = DevicePtr(array.data_mut());
        let len = array.len();
        stream.launch(move || {
            thread::sleep(Duration::from_millis(2));
            for i in 0..len {
                // SAFETY: the buffer holds len elements until its release runs.
                unsafe { *data.get().add(i) *= 0.5 };
            }
        })?;

        // Host buffers are not ordered by the stream.
        if array.mode() == ExecutionMode::Synchronous {
            runtime.synchronize()?;
        }
        let mut output = vec![0.0f32; len];
        array.copy_to_host(&mut output);
        checksum += output.iter().map(|&v| v as f64).sum::<f64>();

        // Released here; the free is queued behind the kernel above.
        drop(array);
    }

    runtime.synchronize()?;
    let device_stats = device.stats();
    let pinned_stats = pinned.stats();
    println!("Processed 8 batches in {:?}, checksum {}", start.elapsed(), checksum);
    println!(
        "Device pool: {} allocations, {} frees, peak {} bytes",
        device_stats.allocations, device_stats.frees, device_stats.peak_bytes_in_use
    );
    println!(
        "Pinned pool: {} allocations, {} frees, peak {} bytes",
        pinned_stats.allocations, pinned_stats.frees, pinned_stats.peak_bytes_in_use
    );
    Ok(())
}
