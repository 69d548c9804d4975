use std::ptr::NonNull;

use log::trace;

use crate::backend::feature::{StreamFeatures, STREAM_FEATURE_ASYNC_COPY};
use crate::backend::{next_stream_handle, DeviceStream, DeviceType, StreamHandle};
use crate::ArrayResult;

mod host_pool;

pub use host_pool::HostPool;

/// The stream of a build or configuration with no accelerator.
///
/// Nothing is ever in flight, so every copy is a plain memory copy and
/// synchronization is a no-op.
#[derive(Debug)]
pub struct CpuStream {
    handle: StreamHandle,
}

impl Default for CpuStream {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuStream {
    pub fn new() -> Self {
        CpuStream {
            handle: next_stream_handle(),
        }
    }
}

impl DeviceStream for CpuStream {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn handle(&self) -> StreamHandle {
        self.handle
    }

    fn is_async_active(&self) -> bool {
        false
    }

    fn features(&self) -> StreamFeatures {
        StreamFeatures::new().with(
            STREAM_FEATURE_ASYNC_COPY,
            false,
            Some("Copies complete before returning"),
        )
    }

    unsafe fn copy_htod_async(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
    ) -> ArrayResult<()> {
        trace!("{}: htod copy of {} bytes", self.handle, bytes);
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), bytes);
        Ok(())
    }

    unsafe fn copy_dtoh(&self, dst: *mut u8, src: NonNull<u8>, bytes: usize) -> ArrayResult<()> {
        trace!("{}: dtoh copy of {} bytes", self.handle, bytes);
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, bytes);
        Ok(())
    }

    fn synchronize(&self) -> ArrayResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_stream_copies() -> ArrayResult<()> {
        let stream = CpuStream::new();
        assert!(!stream.is_async_active());
        assert!(!stream.features().is_supported(STREAM_FEATURE_ASYNC_COPY));

        let src = [1u8, 2, 3, 4];
        let mut mid = [0u8; 4];
        let mut dst = [0u8; 4];

        unsafe {
            stream.copy_htod_async(
                NonNull::from(&mut mid).cast(),
                NonNull::from(&src).cast(),
                4,
            )?;
            stream.copy_dtoh(dst.as_mut_ptr(), NonNull::from(&mid).cast(), 4)?;
        }
        stream.synchronize()?;

        assert_eq!(dst, src);
        Ok(())
    }

    #[test]
    fn test_stream_handles_are_distinct() {
        assert_ne!(CpuStream::new().handle(), CpuStream::new().handle());
    }
}
