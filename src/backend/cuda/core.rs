use super::CudaError;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;

#[allow(non_camel_case_types)]
pub(super) type cudaStream_t = *mut c_void;

pub(super) const CUDA_SUCCESS: i32 = 0;
pub(super) const CUDA_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub(super) const CUDA_MEMCPY_DEVICE_TO_HOST: i32 = 2;

#[link(name = "cudart")]
extern "C" {
    pub(super) fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub(super) fn cudaFree(ptr: *mut c_void) -> i32;
    pub(super) fn cudaMallocHost(ptr: *mut *mut c_void, size: usize) -> i32;
    pub(super) fn cudaFreeHost(ptr: *mut c_void) -> i32;
    pub(super) fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: i32,
        stream: cudaStream_t,
    ) -> i32;
    pub(super) fn cudaStreamCreate(stream: *mut cudaStream_t) -> i32;
    pub(super) fn cudaStreamDestroy(stream: cudaStream_t) -> i32;
    pub(super) fn cudaStreamSynchronize(stream: cudaStream_t) -> i32;
    pub(super) fn cudaLaunchHostFunc(
        stream: cudaStream_t,
        func: unsafe extern "C" fn(*mut c_void),
        user_data: *mut c_void,
    ) -> i32;
    fn cudaGetErrorString(error: i32) -> *const c_char;
    fn cudaSetDevice(device: i32) -> i32;
}

fn error_string(code: i32) -> String {
    // SAFETY: cudaGetErrorString returns a static NUL-terminated string, or
    // null for codes it does not know.
    unsafe {
        let ptr = cudaGetErrorString(code);
        if ptr.is_null() {
            format!("unknown error {}", code)
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

/// Turns a runtime status code into a `Result`, keeping the runtime's own
/// description of the failure.
pub(super) fn check(call: &'static str, code: i32) -> Result<(), CudaError> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(CudaError::Runtime {
            call,
            code,
            description: error_string(code),
        })
    }
}

/// Makes `device_id` current on the calling thread.
pub fn set_device(device_id: i32) -> Result<(), CudaError> {
    if device_id < 0 {
        return Err(CudaError::InvalidDevice(device_id));
    }
    // SAFETY: plain runtime call without pointers.
    check("cudaSetDevice", unsafe { cudaSetDevice(device_id) })
}
