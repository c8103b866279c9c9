//! # Device Detection
//!
//! Selects the compute device for the heavy models (CUDA → Metal → CPU).
//! The embedding model ignores this and always runs on the CPU, so it never
//! competes for accelerator memory.

use candle_core::Device;
use std::str::FromStr;
use tracing::{debug, info};

/// Device preference, parsed from `models.device` in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force CUDA GPU usage (falls back to CPU if not available)
    Cuda,
    /// Force Metal GPU usage (falls back to CPU if not available)
    Metal,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Resolve a device preference into a concrete candle device.
pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_device().unwrap_or(Device::Cpu),
        DevicePreference::Metal => metal_device().unwrap_or(Device::Cpu),
        DevicePreference::Auto => {
            if let Some(device) = cuda_device() {
                info!("Selected CUDA GPU for model inference");
                return device;
            }
            if let Some(device) = metal_device() {
                info!("Selected Metal GPU for model inference");
                return device;
            }
            info!("Using CPU for model inference (no GPU acceleration available)");
            Device::Cpu
        }
    }
}

/// Resolve the configured device string, falling back to auto-detection on
/// an unrecognized value.
pub fn device_from_config(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => select_device(preference),
        Err(e) => {
            tracing::warn!("{}, using auto-detection", e);
            select_device(DevicePreference::Auto)
        }
    }
}

/// Human-readable device label for logging and the health endpoint.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}
