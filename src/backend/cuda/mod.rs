mod core;
mod pool;
mod stream;

pub use self::core::set_device;
pub use pool::CudaPool;
pub use stream::CudaStream;

#[derive(Debug)]
pub enum CudaError {
    /// A runtime call returned a status other than `cudaSuccess`.
    Runtime {
        call: &'static str,
        code: i32,
        description: String,
    },
    InvalidDevice(i32),
}

impl CudaError {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Runtime { code, .. } => Some(*code),
            Self::InvalidDevice(_) => None,
        }
    }
}

impl std::fmt::Display for CudaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime {
                call,
                code,
                description,
            } => write!(f, "{} returned {}: {}", call, code, description),
            Self::InvalidDevice(device) => write!(f, "Invalid CUDA device: {}", device),
        }
    }
}

impl std::error::Error for CudaError {}
