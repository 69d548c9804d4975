pub use crate::array::{AsyncArray, DeviceCopy, ResidencyKind};
pub use crate::backend::{DeviceStream, DeviceType, ExecutionMode, MemoryPool, Runtime};
pub use crate::config::RuntimeConfig;
pub use crate::executor::ExecutorKind;
pub use crate::{ArrayError, ArrayResult};
