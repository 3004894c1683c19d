// error.rs — Initialization errors.
//
// Steady-state calls never return errors: precondition violations panic and
// worker failures abort the process. Only bringing a pipeline up can fail
// recoverably, so that a caller can fall back to a non-accelerated path.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// A configuration field is out of range.
    #[error("invalid init parameters: {0}")]
    InvalidParams(String),

    /// No adapter satisfied the device policy.
    #[error("no suitable GPU device found")]
    NoDevice,

    /// The driver did not report the device's memory size.
    #[error("memory size of device {device} is unknown; supply one with DeviceReport::with_memory")]
    UnknownDeviceMemory {
        /// Adapter name
        device: String,
    },

    /// The selected device is below the minimum memory policy.
    #[error("device memory {available} bytes is below the required minimum of {required} bytes")]
    DeviceTooSmall {
        /// Memory the device reports
        available: u64,
        /// Policy minimum
        required: u64,
    },

    /// Not even a single worker thread fits in device memory.
    #[error(
        "insufficient device memory: one render thread needs {required} bytes, device has {available}"
    )]
    InsufficientMemory {
        /// common + chunk + reserved for one thread
        required: u64,
        /// Device global memory
        available: u64,
    },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn render worker: {0}")]
    WorkerSpawn(String),
}
