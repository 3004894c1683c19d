// gpu/mod.rs — Device discovery.
//
// Kernels run through `runtime::CommandQueue`; this module only finds the
// adapter whose memory the budget planner divides between workers.

pub mod device;
pub mod vram;

pub use device::{choose_device, enumerate_devices, select_device, DeviceReport};
