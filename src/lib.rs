//! rocm-device - HIP compute device layer for AMD GPUs
//!
//! Loads the HIP driver at runtime, scopes its per-thread contexts, caches
//! kernel entry points, places device memory and shares display buffers with
//! OpenGL. Everything above the device (scenes, integrators, kernels
//! themselves) lives elsewhere.

#![allow(clippy::too_many_arguments)] // Driver entry points mirror the C API
#![allow(clippy::missing_safety_doc)] // Unsafe driver methods documented on the trait

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;

pub use backend::{
    DeviceKernel, DeviceMemory, HipContextScope, HipDevice, HipDeviceQueue, HipError, HipResult,
    KernelArgs, KernelFeatures, MemoryType,
};
pub use config::DeviceConfig;
pub use error::{DeviceResult, ErrorCategory, RocmDeviceError};
pub use logging::{init_logging_default, init_with_config, LoggingConfig, LoggingError};
