//! Initialization context: seed and device selection for one run.
//!
//! Nothing here touches process-wide state. The seed travels to the backend
//! (parameter init) and into the context's own RNG (loader shuffling), and
//! the device list is negotiated with the backend instead of being exported
//! through environment variables.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RuntimeConfig;
use crate::error::ActionDetError;

/// What the configuration asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequirement {
    /// Use the configured CUDA devices when present, else the CPU.
    #[default]
    Auto,
    Cpu,
    /// Fail unless every configured GPU id is available.
    Cuda,
}

/// A device a backend can place the model on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Per-run seed, RNG and resolved device set.
#[derive(Debug)]
pub struct InitContext {
    seed: u64,
    devices: Vec<Device>,
    rng: StdRng,
}

impl InitContext {
    /// Resolve the device requirement against what the backend offers.
    pub fn new(runtime: &RuntimeConfig, available: &[Device]) -> Result<Self, ActionDetError> {
        let devices = resolve_devices(runtime, available)?;
        Ok(Self {
            seed: runtime.seed,
            devices,
            rng: StdRng::seed_from_u64(runtime.seed),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The run's single source of loader randomness.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

fn resolve_devices(
    runtime: &RuntimeConfig,
    available: &[Device],
) -> Result<Vec<Device>, ActionDetError> {
    let wanted: Vec<Device> = runtime.gpu_ids.iter().map(|&id| Device::Cuda(id)).collect();
    let present: Vec<Device> = wanted
        .iter()
        .copied()
        .filter(|d| available.contains(d))
        .collect();

    match runtime.device {
        DeviceRequirement::Cpu => Ok(vec![Device::Cpu]),
        DeviceRequirement::Cuda => {
            if wanted.is_empty() {
                return Err(ActionDetError::device(
                    "runtime.device = \"cuda\" but runtime.gpu_ids is empty",
                ));
            }
            if present.len() != wanted.len() {
                let missing: Vec<String> = wanted
                    .iter()
                    .filter(|d| !available.contains(d))
                    .map(ToString::to_string)
                    .collect();
                return Err(ActionDetError::device(format!(
                    "requested CUDA devices not available: {}",
                    missing.join(", ")
                )));
            }
            Ok(present)
        }
        DeviceRequirement::Auto => {
            if present.is_empty() {
                Ok(vec![Device::Cpu])
            } else {
                Ok(present)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn runtime(device: DeviceRequirement, gpu_ids: Vec<usize>) -> RuntimeConfig {
        RuntimeConfig {
            seed: 7,
            device,
            gpu_ids,
        }
    }

    #[test]
    fn test_auto_falls_back_to_cpu() {
        let ctx = InitContext::new(&runtime(DeviceRequirement::Auto, vec![0]), &[Device::Cpu])
            .unwrap();
        assert_eq!(ctx.devices(), &[Device::Cpu]);
    }

    #[test]
    fn test_auto_uses_available_gpus() {
        let available = [Device::Cpu, Device::Cuda(0), Device::Cuda(1)];
        let ctx =
            InitContext::new(&runtime(DeviceRequirement::Auto, vec![0, 1, 3]), &available).unwrap();
        assert_eq!(ctx.devices(), &[Device::Cuda(0), Device::Cuda(1)]);
    }

    #[test]
    fn test_cuda_required_but_missing_is_fatal() {
        let err = InitContext::new(&runtime(DeviceRequirement::Cuda, vec![0]), &[Device::Cpu])
            .unwrap_err();
        assert!(matches!(err, ActionDetError::Device { .. }));
        assert!(err.to_string().contains("cuda:0"));
    }

    #[test]
    fn test_cpu_ignores_gpu_ids() {
        let available = [Device::Cpu, Device::Cuda(0)];
        let ctx = InitContext::new(&runtime(DeviceRequirement::Cpu, vec![0]), &available).unwrap();
        assert_eq!(ctx.devices(), &[Device::Cpu]);
    }

    #[test]
    fn test_same_seed_same_stream() {
        let rt = runtime(DeviceRequirement::Cpu, vec![]);
        let mut a = InitContext::new(&rt, &[Device::Cpu]).unwrap();
        let mut b = InitContext::new(&rt, &[Device::Cpu]).unwrap();
        let xs: Vec<u32> = (0..8).map(|_| a.rng().r#gen()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.rng().r#gen()).collect();
        assert_eq!(xs, ys);
        assert_eq!(a.seed(), 7);
    }
}
