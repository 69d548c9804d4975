//! Runtime configuration.
//!
//! Recognized environment variables:
//!
//! | Variable                   | Values                                      |
//! |----------------------------|---------------------------------------------|
//! | `ASYNCARRAY_BACKEND`       | `cpu`, `sim`, `cuda`                        |
//! | `ASYNCARRAY_LAUNCH_REGION` | `1`/`0`, `true`/`false`, `on`/`off`         |
//! | `ASYNCARRAY_EXECUTOR`      | `immediate`, `callback`, `host-task`, `blocking` |
//! | `ASYNCARRAY_DEVICE`        | CUDA device ordinal                         |
//! | `ASYNCARRAY_LOG`           | log level, read by [`crate::log::init`]     |

use crate::backend::{DeviceType, SimConfig};
use crate::executor::ExecutorKind;
use crate::{ArrayError, ArrayResult};

pub const ENV_BACKEND: &str = "ASYNCARRAY_BACKEND";
pub const ENV_LAUNCH_REGION: &str = "ASYNCARRAY_LAUNCH_REGION";
pub const ENV_EXECUTOR: &str = "ASYNCARRAY_EXECUTOR";
pub const ENV_DEVICE: &str = "ASYNCARRAY_DEVICE";
pub const ENV_LOG: &str = "ASYNCARRAY_LOG";

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub backend: DeviceType,
    /// Whether buffers start out in asynchronous mode on an accelerator.
    pub launch_region: bool,
    /// Forced deferred executor; `None` picks one from the stream features.
    pub executor: Option<ExecutorKind>,
    pub device_id: i32,
    pub sim: SimConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            backend: DeviceType::Cpu,
            launch_region: true,
            executor: None,
            device_id: 0,
            sim: SimConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> ArrayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `lookup`, falling back to the defaults for
    /// unset keys.
    pub fn from_lookup<F>(lookup: F) -> ArrayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RuntimeConfig::default();

        if let Some(backend) = lookup(ENV_BACKEND) {
            config.backend = backend.parse()?;
        }
        if let Some(flag) = lookup(ENV_LAUNCH_REGION) {
            config.launch_region = parse_flag(ENV_LAUNCH_REGION, &flag)?;
        }
        if let Some(executor) = lookup(ENV_EXECUTOR) {
            config.executor = Some(executor.parse()?);
        }
        if let Some(device) = lookup(ENV_DEVICE) {
            config.device_id = device.trim().parse().map_err(|_| {
                ArrayError::ConfigError(format!("{} must be an integer, got '{}'", ENV_DEVICE, device))
            })?;
            if config.device_id < 0 {
                return Err(ArrayError::ConfigError(format!(
                    "{} must not be negative",
                    ENV_DEVICE
                )));
            }
        }

        Ok(config)
    }
}

fn parse_flag(key: &str, value: &str) -> ArrayResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ArrayError::ConfigError(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}
