use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};

use crate::backend::{
    CpuStream, DeviceStream, HostPool, MemoryPool, PoolKind, SimConfig, SimStream,
};
use crate::config::RuntimeConfig;
use crate::executor::{select_executor, DeferredExecutor, ExecutorKind};
use crate::{ArrayError, ArrayResult};

static GLOBAL_RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Byte written over simulated device memory when it is freed.
pub const SIM_POISON: u8 = 0xDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Sim,
    #[cfg(feature = "cuda")]
    Cuda,
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for DeviceType {
    type Err = ArrayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "host" | "none" => Ok(DeviceType::Cpu),
            "sim" | "simulated" => Ok(DeviceType::Sim),
            #[cfg(feature = "cuda")]
            "cuda" => Ok(DeviceType::Cuda),
            #[cfg(not(feature = "cuda"))]
            "cuda" => Err(ArrayError::ConfigError(
                "CUDA support is not compiled in (enable the `cuda` feature)".to_string(),
            )),
            other => Err(ArrayError::ConfigError(format!(
                "Unknown backend '{}'",
                other
            ))),
        }
    }
}

/// Whether device work may be outstanding when a buffer is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// No device queue in play; buffers live on the host only.
    Synchronous,
    /// Device work is issued asynchronously; buffers live on the device.
    Asynchronous,
}

impl Display for ExecutionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Synchronous => write!(f, "synchronous"),
            ExecutionMode::Asynchronous => write!(f, "asynchronous"),
        }
    }
}

/// A device stream together with the pools and the deferred executor that
/// buffers created against it use.
#[derive(Debug)]
pub struct Runtime {
    device_type: DeviceType,
    stream: Arc<dyn DeviceStream>,
    pinned_pool: Arc<dyn MemoryPool>,
    device_pool: Option<Arc<dyn MemoryPool>>,
    executor: Box<dyn DeferredExecutor>,
    launch_region: AtomicBool,
}

impl Runtime {
    pub fn builder(stream: Arc<dyn DeviceStream>) -> RuntimeBuilder {
        RuntimeBuilder {
            stream,
            pinned_pool: None,
            device_pool: None,
            executor: None,
            launch_region: true,
        }
    }

    /// A runtime without an accelerator. Every buffer is a host buffer.
    pub fn cpu() -> Arc<Runtime> {
        Runtime::builder(Arc::new(CpuStream::new()))
            .build()
            .unwrap_or_else(|e| crate::fatal("Runtime::cpu", &e))
    }

    pub fn sim(config: SimConfig) -> ArrayResult<Arc<Runtime>> {
        let stream = Arc::new(SimStream::new(config)?);
        Runtime::builder(stream)
            .device_pool(Arc::new(
                HostPool::named("sim-device", PoolKind::Device).with_poison(SIM_POISON),
            ))
            .build()
    }

    #[cfg(feature = "cuda")]
    pub fn cuda(device_id: i32) -> ArrayResult<Arc<Runtime>> {
        use crate::backend::cuda::{CudaPool, CudaStream};

        let stream = Arc::new(CudaStream::new(device_id)?);
        Runtime::builder(stream)
            .pinned_pool(Arc::new(CudaPool::pinned(device_id)))
            .device_pool(Arc::new(CudaPool::device(device_id)))
            .build()
    }

    pub fn from_config(config: &RuntimeConfig) -> ArrayResult<Arc<Runtime>> {
        let builder = match config.backend {
            DeviceType::Cpu => Runtime::builder(Arc::new(CpuStream::new())),
            DeviceType::Sim => Runtime::builder(Arc::new(SimStream::new(config.sim)?)).device_pool(
                Arc::new(HostPool::named("sim-device", PoolKind::Device).with_poison(SIM_POISON)),
            ),
            #[cfg(feature = "cuda")]
            DeviceType::Cuda => {
                use crate::backend::cuda::{CudaPool, CudaStream};

                Runtime::builder(Arc::new(CudaStream::new(config.device_id)?))
                    .pinned_pool(Arc::new(CudaPool::pinned(config.device_id)))
                    .device_pool(Arc::new(CudaPool::device(config.device_id)))
            }
        };

        let builder = match config.executor {
            Some(kind) => builder.executor(kind),
            None => builder,
        };
        builder.launch_region(config.launch_region).build()
    }

    /// The process-wide runtime, built from the environment on first use.
    pub fn global() -> Arc<Runtime> {
        GLOBAL_RUNTIME
            .get_or_init(|| {
                match RuntimeConfig::from_env().and_then(|config| Runtime::from_config(&config)) {
                    Ok(runtime) => {
                        info!("Global runtime set to: {}", runtime.device_type());
                        runtime
                    }
                    Err(e) => {
                        warn!("Failed to configure runtime ({}), falling back to CPU", e);
                        Runtime::cpu()
                    }
                }
            })
            .clone()
    }

    /// Installs `runtime` as the process-wide runtime.
    ///
    /// Fails once the global runtime exists, including after a call to
    /// [`Runtime::global`].
    pub fn install_global(runtime: Arc<Runtime>) -> ArrayResult<()> {
        GLOBAL_RUNTIME
            .set(runtime)
            .map_err(|_| ArrayError::ConfigError("Global runtime is already installed".into()))
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn stream(&self) -> &dyn DeviceStream {
        self.stream.as_ref()
    }

    pub fn pinned_pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pinned_pool
    }

    pub fn device_pool(&self) -> Option<&Arc<dyn MemoryPool>> {
        self.device_pool.as_ref()
    }

    pub fn executor(&self) -> &dyn DeferredExecutor {
        self.executor.as_ref()
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        self.executor.kind()
    }

    pub fn in_launch_region(&self) -> bool {
        self.launch_region.load(Ordering::SeqCst)
    }

    /// Turns asynchronous device execution on or off and returns the previous
    /// setting. Buffers keep the mode they were created in.
    pub fn set_launch_region(&self, enabled: bool) -> bool {
        let previous = self.launch_region.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            debug!(
                "Launch region on {} {}",
                self.stream.handle(),
                if enabled { "entered" } else { "left" }
            );
        }
        previous
    }

    /// Sets the launch region for the lifetime of the returned guard.
    pub fn launch_region(&self, enabled: bool) -> LaunchRegionGuard<'_> {
        LaunchRegionGuard {
            runtime: self,
            previous: self.set_launch_region(enabled),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.in_launch_region() && self.stream.is_async_active() && self.device_pool.is_some() {
            ExecutionMode::Asynchronous
        } else {
            ExecutionMode::Synchronous
        }
    }

    pub fn synchronize(&self) -> ArrayResult<()> {
        self.stream.synchronize()
    }
}

/// Restores the previous launch-region setting when dropped.
#[derive(Debug)]
pub struct LaunchRegionGuard<'a> {
    runtime: &'a Runtime,
    previous: bool,
}

impl Drop for LaunchRegionGuard<'_> {
    fn drop(&mut self) {
        self.runtime.set_launch_region(self.previous);
    }
}

pub struct RuntimeBuilder {
    stream: Arc<dyn DeviceStream>,
    pinned_pool: Option<Arc<dyn MemoryPool>>,
    device_pool: Option<Arc<dyn MemoryPool>>,
    executor: Option<ExecutorKind>,
    launch_region: bool,
}

impl RuntimeBuilder {
    pub fn pinned_pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pinned_pool = Some(pool);
        self
    }

    pub fn device_pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.device_pool = Some(pool);
        self
    }

    /// Forces a deferred executor instead of picking one from the stream's
    /// features.
    pub fn executor(mut self, kind: ExecutorKind) -> Self {
        self.executor = Some(kind);
        self
    }

    pub fn launch_region(mut self, enabled: bool) -> Self {
        self.launch_region = enabled;
        self
    }

    pub fn build(self) -> ArrayResult<Arc<Runtime>> {
        let stream = self.stream;
        let async_capable = stream.is_async_active();

        if async_capable && self.device_pool.is_none() {
            warn!(
                "{} runs asynchronously but has no device pool; buffers stay on the host",
                stream.handle()
            );
        }

        let executor = match self.executor {
            Some(ExecutorKind::Immediate) if async_capable => {
                return Err(ArrayError::ConfigError(format!(
                    "The immediate executor cannot release memory used by the asynchronous {} backend",
                    stream.device_type()
                )));
            }
            Some(kind) => kind.build(),
            None => select_executor(stream.as_ref()),
        };

        let pinned_pool = self
            .pinned_pool
            .unwrap_or_else(|| Arc::new(HostPool::new(PoolKind::Pinned)));

        debug!(
            "Runtime on {} ({}) using the {} executor",
            stream.handle(),
            stream.device_type(),
            executor.kind()
        );

        Ok(Arc::new(Runtime {
            device_type: stream.device_type(),
            stream,
            pinned_pool,
            device_pool: self.device_pool,
            executor,
            launch_region: AtomicBool::new(self.launch_region),
        }))
    }
}
