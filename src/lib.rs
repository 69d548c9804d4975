use std::fmt::{Display, Formatter};

pub mod array;
pub mod backend;
pub mod config;
pub mod executor;
pub mod log;
pub mod prelude;

use backend::BackendError;

pub use array::{AsyncArray, DeviceCopy, ResidencyKind};
pub use backend::{ExecutionMode, Runtime};

#[derive(Debug)]
pub enum ArrayError {
    BackendError(BackendError),
    ConfigError(String),
    StringError(String),
}

impl Display for ArrayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayError::BackendError(e) => write!(f, "Backend error: {}", e),
            ArrayError::ConfigError(s) => write!(f, "Configuration error: {}", s),
            ArrayError::StringError(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ArrayError {}

impl ArrayError {
    /// Whether the backend reported the operation as unavailable rather than
    /// failed.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ArrayError::BackendError(e) if e.is_unsupported())
    }
}

impl From<BackendError> for ArrayError {
    fn from(error: BackendError) -> Self {
        ArrayError::BackendError(error)
    }
}

impl From<String> for ArrayError {
    fn from(error: String) -> Self {
        ArrayError::StringError(error)
    }
}

impl From<&str> for ArrayError {
    fn from(error: &str) -> Self {
        ArrayError::StringError(error.to_string())
    }
}

pub type ArrayResult<T> = Result<T, ArrayError>;

/// Reports an unrecoverable failure and aborts the process.
///
/// Pool exhaustion and failed runtime calls leave a pipeline without working
/// memory or without a way to order its frees, so nothing is unwound.
#[cold]
pub(crate) fn fatal(context: &str, error: &ArrayError) -> ! {
    ::log::error!("{}: {}", context, error);
    eprintln!("asyncarray: fatal: {}: {}", context, error);
    std::process::abort()
}
