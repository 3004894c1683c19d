// gpu/device.rs — Adapter enumeration and the device report used for
// memory budgeting.
//
// The stitching pipeline only needs to know two things about the device
// before it starts: that one exists, and how much memory it can hand out.
// `enumerate_devices` lists every adapter wgpu can see; `select_device` applies
// the selection policy and returns a `DeviceReport`.
//
// ADAPTER SELECTION:
// Software rasterizers (llvmpipe, swiftshader) report DeviceType::Cpu and
// are skipped. Among the rest, discrete GPUs are preferred over integrated,
// virtual and "other" adapters, in that order.
//
// MEMORY:
// wgpu does not expose total VRAM, and `Limits::max_buffer_size` is a
// per-buffer cap that some backends hard-wire. The size comes from the
// driver instead (see `vram.rs`). When it cannot be read the report carries
// `None` and the pipeline refuses to budget against it until the caller
// supplies a size with `DeviceReport::with_memory`.
//
// NEW RUST CONCEPTS:
// - `Instance::enumerate_adapters` is synchronous on native backends, so no
//   async executor is needed just to list devices.
// - `Iterator::min_by_key` with a rank function picks the preferred element
//   without sorting the whole list.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::InitError;

use super::vram::query_vram;

/// What the pipeline knows about the device it budgets against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
    /// Total device memory in bytes, if the driver reported it.
    pub global_mem_size: Option<u64>,
}

impl DeviceReport {
    /// A report that is not backed by a real adapter, for budgeting runs
    /// and tests.
    pub fn simulated(global_mem_size: u64) -> Self {
        DeviceReport {
            name: "simulated".to_string(),
            device_type: wgpu::DeviceType::Other,
            backend: wgpu::Backend::Empty,
            global_mem_size: Some(global_mem_size),
        }
    }

    /// The same device with a caller-supplied memory size.
    pub fn with_memory(self, global_mem_size: u64) -> Self {
        DeviceReport { global_mem_size: Some(global_mem_size), ..self }
    }

    pub fn is_software(&self) -> bool {
        self.device_type == wgpu::DeviceType::Cpu
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?}, ", self.name, self.backend, self.device_type)?;
        match self.global_mem_size {
            Some(bytes) => write!(f, "{} MiB)", bytes >> 20),
            None => write!(f, "unknown memory)"),
        }
    }
}

/// Preference rank, lower is better. `None` means never select.
fn rank(device_type: wgpu::DeviceType) -> Option<u8> {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => Some(0),
        wgpu::DeviceType::IntegratedGpu => Some(1),
        wgpu::DeviceType::VirtualGpu => Some(2),
        wgpu::DeviceType::Other => Some(3),
        wgpu::DeviceType::Cpu => None,
    }
}

/// Every adapter visible on the native backends.
pub fn enumerate_devices() -> Vec<DeviceReport> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    });
    let reports: Vec<DeviceReport> = instance
        .enumerate_adapters(wgpu::Backends::PRIMARY)
        .into_iter()
        .map(|adapter| {
            let info = adapter.get_info();
            let global_mem_size = query_vram(&info);
            if global_mem_size.is_none() {
                debug!(adapter = %info.name, "driver reports no memory size");
            }
            DeviceReport {
                name: info.name,
                device_type: info.device_type,
                backend: info.backend,
                global_mem_size,
            }
        })
        .collect();
    for r in &reports {
        debug!(adapter = %r, "found adapter");
    }
    reports
}

/// Pick the preferred hardware adapter from `reports`.
pub fn choose_device(reports: &[DeviceReport]) -> Option<&DeviceReport> {
    reports
        .iter()
        .filter_map(|r| rank(r.device_type).map(|k| (k, r)))
        .min_by_key(|&(k, _)| k)
        .map(|(_, r)| r)
}

/// Enumerate adapters and select a hardware one.
///
/// # Errors
/// `InitError::NoDevice` when only software adapters (or none) exist.
pub fn select_device() -> Result<DeviceReport, InitError> {
    let reports = enumerate_devices();
    match choose_device(&reports) {
        Some(report) => {
            info!(adapter = %report, "selected device");
            Ok(report.clone())
        }
        None => {
            warn!(adapters = reports.len(), "no hardware adapter available");
            Err(InitError::NoDevice)
        }
    }
}
