//! Compute device selection.
//!
//! The device is initialized once and shared by every tensor the process
//! creates. Backend priority for `auto`: CUDA -> Metal -> CPU, limited to the
//! backends compiled in through the `cuda` / `metal` cargo features.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Global device singleton.
static DEVICE: OnceLock<Device> = OnceLock::new();

/// Requested compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Best compiled-in backend.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DevicePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DevicePreference {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            other => Err(ModelError::config(format!(
                "Invalid device '{}'. Must be 'auto', 'cpu', 'cuda' or 'metal'.",
                other
            ))),
        }
    }
}

/// Create a device for the given preference without touching the singleton.
pub fn new_device(preference: DevicePreference) -> ModelResult<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0).map_err(|e| ModelError::DeviceError {
            message: format!("CUDA device unavailable: {}", e),
        }),
        DevicePreference::Metal => Device::new_metal(0).map_err(|e| ModelError::DeviceError {
            message: format!("Metal device unavailable: {}", e),
        }),
        DevicePreference::Auto => Ok(best_available()),
    }
}

fn best_available() -> Device {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                tracing::info!("Using CUDA device 0");
                return device;
            }
            Err(e) => tracing::debug!("CUDA not available: {}", e),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("Using Metal device 0");
                return device;
            }
            Err(e) => tracing::debug!("Metal not available: {}", e),
        }
    }

    tracing::info!("Using CPU device");
    Device::Cpu
}

/// Initialize the process-wide device (call once at startup).
///
/// Later calls return the cached device regardless of `preference`.
///
/// # Errors
///
/// `ModelError::DeviceError` when an explicitly requested backend is missing.
pub fn init_device(preference: DevicePreference) -> ModelResult<&'static Device> {
    if let Some(device) = DEVICE.get() {
        tracing::debug!("Device already initialized, returning cached device");
        return Ok(device);
    }

    let device = new_device(preference)?;
    let _ = DEVICE.set(device);

    // set() only fails when another thread won the race; either way a device is stored
    DEVICE.get().ok_or_else(|| ModelError::DeviceError {
        message: "device singleton was not stored".to_string(),
    })
}

/// Short human-readable device name for logs and the model info endpoint.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("mps".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_preference_serde_is_lowercase() {
        let json = serde_json::to_string(&DevicePreference::Cuda).unwrap();
        assert_eq!(json, "\"cuda\"");
        let parsed: DevicePreference = serde_json::from_str("\"metal\"").unwrap();
        assert_eq!(parsed, DevicePreference::Metal);
    }

    #[test]
    fn test_cpu_device_always_available() {
        let device = new_device(DevicePreference::Cpu).unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(device_label(&device), "cpu");
    }

    #[test]
    fn test_init_device_is_cached() {
        let first = init_device(DevicePreference::Cpu).unwrap() as *const Device;
        let second = init_device(DevicePreference::Auto).unwrap() as *const Device;
        assert_eq!(first, second);
    }
}
