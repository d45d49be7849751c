use candle_core::Device;
use serde::Serialize;
use tracing::{info, warn};

/// What the current machine can do for model loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityConfig {
    pub use_accelerator: bool,
    pub quantize: bool,
}

impl CapabilityConfig {
    pub const CPU_ONLY: CapabilityConfig = CapabilityConfig {
        use_accelerator: false,
        quantize: false,
    };
}

pub fn probe() -> CapabilityConfig {
    probe_with(false)
}

/// Inspect the environment. Never fails: anything missing just turns the
/// matching flag off.
pub fn probe_with(force_cpu: bool) -> CapabilityConfig {
    if force_cpu {
        return CapabilityConfig::CPU_ONLY;
    }

    let use_accelerator = accelerator_available();
    // 4-bit weights are only used on the accelerator path
    let quantize = use_accelerator && quantization_available();

    CapabilityConfig {
        use_accelerator,
        quantize,
    }
}

fn quantization_available() -> bool {
    cfg!(feature = "quantized")
}

fn accelerator_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        if Device::new_cuda(0).is_ok() {
            return true;
        }
    }

    #[cfg(feature = "metal")]
    {
        if Device::new_metal(0).is_ok() {
            return true;
        }
    }

    false
}

pub fn select_device(use_accelerator: bool) -> Device {
    if !use_accelerator {
        info!("Using CPU device");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA device");
                return device;
            }
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal device");
                return device;
            }
            Err(e) => {
                warn!("Metal not available: {}, falling back to CPU", e);
            }
        }
    }

    warn!("Accelerator requested but none could be opened, using CPU");
    Device::Cpu
}

pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
