use super::core::{
    check, cudaLaunchHostFunc, cudaMemcpyAsync, cudaStreamCreate, cudaStreamDestroy,
    cudaStreamSynchronize, cudaStream_t, set_device, CUDA_MEMCPY_DEVICE_TO_HOST,
    CUDA_MEMCPY_HOST_TO_DEVICE,
};
use super::CudaError;
use crate::backend::feature::{StreamFeatures, STREAM_FEATURE_ASYNC_COPY, STREAM_FEATURE_HOST_FUNC};
use crate::backend::{DeviceStream, DeviceType, HostFn, StreamHandle};
use crate::ArrayResult;
use log::{debug, trace, warn};
use std::ffi::c_void;
use std::ptr::{null_mut, NonNull};

#[derive(Debug)]
pub struct CudaStream {
    stream: cudaStream_t,
    device_id: i32,
}

// SAFETY: CUDA streams may be used from any thread once created.
unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

impl CudaStream {
    pub fn new(device_id: i32) -> Result<Self, CudaError> {
        trace!("Creating CUDA stream on device {}", device_id);
        set_device(device_id)?;

        let mut stream = null_mut();
        // SAFETY: stream is a valid out pointer.
        check("cudaStreamCreate", unsafe { cudaStreamCreate(&mut stream) })?;

        debug!("CUDA stream created: {:p}", stream);
        Ok(CudaStream { stream, device_id })
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn as_ptr(&self) -> cudaStream_t {
        self.stream
    }
}

impl DeviceStream for CudaStream {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn handle(&self) -> StreamHandle {
        StreamHandle(self.stream as usize)
    }

    fn is_async_active(&self) -> bool {
        true
    }

    fn features(&self) -> StreamFeatures {
        StreamFeatures::new()
            .with(STREAM_FEATURE_ASYNC_COPY, true, Some("cudaMemcpyAsync"))
            .with(STREAM_FEATURE_HOST_FUNC, true, Some("cudaLaunchHostFunc"))
    }

    unsafe fn copy_htod_async(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
    ) -> ArrayResult<()> {
        trace!("{:p}: htod copy of {} bytes", self.stream, bytes);
        check("cudaMemcpyAsync", unsafe {
            cudaMemcpyAsync(
                dst.as_ptr().cast(),
                src.as_ptr().cast_const().cast(),
                bytes,
                CUDA_MEMCPY_HOST_TO_DEVICE,
                self.stream,
            )
        })?;
        Ok(())
    }

    unsafe fn copy_dtoh(&self, dst: *mut u8, src: NonNull<u8>, bytes: usize) -> ArrayResult<()> {
        trace!("{:p}: dtoh copy of {} bytes", self.stream, bytes);
        check("cudaMemcpyAsync", unsafe {
            cudaMemcpyAsync(
                dst.cast(),
                src.as_ptr().cast_const().cast(),
                bytes,
                CUDA_MEMCPY_DEVICE_TO_HOST,
                self.stream,
            )
        })?;
        self.synchronize()
    }

    fn synchronize(&self) -> ArrayResult<()> {
        trace!("Synchronizing CUDA stream {:p}", self.stream);
        // SAFETY: the stream is live until drop.
        check("cudaStreamSynchronize", unsafe {
            cudaStreamSynchronize(self.stream)
        })?;
        Ok(())
    }

    unsafe fn launch_host_func(&self, func: HostFn, user_data: *mut c_void) -> ArrayResult<()> {
        trace!("{:p}: host function registered", self.stream);
        check("cudaLaunchHostFunc", unsafe {
            cudaLaunchHostFunc(self.stream, func, user_data)
        })?;
        Ok(())
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        trace!("Destroying CUDA stream {:p}", self.stream);
        // SAFETY: the stream was created in new and is destroyed once.
        let synchronized = unsafe { cudaStreamSynchronize(self.stream) };
        if let Err(e) = check("cudaStreamSynchronize", synchronized) {
            warn!("{}", e);
        }
        // SAFETY: as above.
        let destroyed = unsafe { cudaStreamDestroy(self.stream) };
        if let Err(e) = check("cudaStreamDestroy", destroyed) {
            warn!("{}", e);
        }
    }
}
