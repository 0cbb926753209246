//! ROCm/HIP device backend
//!
//! The driver is reached through [`hipew`], which opens libamdhip64 at runtime,
//! and the [`driver::HipDriver`] trait every other module calls through.

mod backend;
pub mod compiler;
pub mod device;
pub mod device_context;
pub mod driver;
pub mod error;
pub mod event;
pub mod ffi;
pub mod graphics_interop;
pub mod hipew;
pub mod kernels;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod module;
pub mod queue;
pub mod stream;

// Public API re-exports
pub use backend::HipDevice;
pub use compiler::{KernelCompiler, KernelFeatures};
pub use device::{enumerate_devices, hip_available, DeviceCapabilities, DeviceInfo, HipDeviceProp};
pub use device_context::HipContextScope;
pub use driver::{DriverResult, DynamicHipDriver, HipDriver};
pub use error::{ErrorState, HipError, HipResult};
pub use event::HipEvent;
pub use ffi::{DevicePtr, HostPtr};
pub use graphics_interop::{DisplayInterop, HipDeviceGraphicsInterop, InteropState};
pub use hipew::{Hipew, HipewError, HipewStatus};
pub use kernels::{DeviceKernel, HipDeviceKernel, HipDeviceKernels, KernelCacheState};
pub use memory::{DeviceMemory, MemoryStats, MemoryType, Placement};
pub use module::HipModule;
pub use queue::{HipDeviceQueue, KernelArgs, KernelTiming, LaunchConfig};
pub use stream::HipStream;
