//! HIP driver API types, constants and function-pointer signatures
//!
//! Nothing here is linked at build time. The signatures below describe the
//! entry points the hipew shim resolves from `libamdhip64` at runtime, and the
//! constants mirror `hip_runtime_api.h` for ROCm 6.x.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use std::ffi::{c_char, c_int, c_uint, c_void};

/// Raw HIP status code (`hipError_t`)
pub type hipError_t = c_int;
/// Raw device ordinal handle (`hipDevice_t`)
pub type hipDevice_t = c_int;
pub type hipCtx_t = *mut c_void;
pub type hipModule_t = *mut c_void;
pub type hipFunction_t = *mut c_void;
pub type hipStream_t = *mut c_void;
pub type hipEvent_t = *mut c_void;
pub type hipGraphicsResource_t = *mut c_void;
pub type hipDeviceptr_t = *mut c_void;

// Status codes
pub const hipSuccess: hipError_t = 0;
pub const hipErrorInvalidValue: hipError_t = 1;
pub const hipErrorOutOfMemory: hipError_t = 2;
pub const hipErrorNotInitialized: hipError_t = 3;
pub const hipErrorDeinitialized: hipError_t = 4;
pub const hipErrorInvalidConfiguration: hipError_t = 9;
pub const hipErrorInvalidSymbol: hipError_t = 13;
pub const hipErrorInvalidDevicePointer: hipError_t = 17;
pub const hipErrorInvalidMemcpyDirection: hipError_t = 21;
pub const hipErrorInsufficientDriver: hipError_t = 35;
pub const hipErrorInvalidDeviceFunction: hipError_t = 98;
pub const hipErrorNoDevice: hipError_t = 100;
pub const hipErrorInvalidDevice: hipError_t = 101;
pub const hipErrorInvalidImage: hipError_t = 200;
pub const hipErrorInvalidContext: hipError_t = 201;
pub const hipErrorContextAlreadyCurrent: hipError_t = 202;
pub const hipErrorMapFailed: hipError_t = 205;
pub const hipErrorUnmapFailed: hipError_t = 206;
pub const hipErrorAlreadyMapped: hipError_t = 208;
pub const hipErrorNoBinaryForGpu: hipError_t = 209;
pub const hipErrorNotMapped: hipError_t = 211;
pub const hipErrorPeerAccessUnsupported: hipError_t = 217;
pub const hipErrorInvalidKernelFile: hipError_t = 218;
pub const hipErrorInvalidGraphicsContext: hipError_t = 219;
pub const hipErrorFileNotFound: hipError_t = 301;
pub const hipErrorSharedObjectSymbolNotFound: hipError_t = 302;
pub const hipErrorSharedObjectInitFailed: hipError_t = 303;
pub const hipErrorInvalidHandle: hipError_t = 400;
pub const hipErrorIllegalState: hipError_t = 401;
pub const hipErrorNotFound: hipError_t = 500;
pub const hipErrorNotReady: hipError_t = 600;
pub const hipErrorIllegalAddress: hipError_t = 700;
pub const hipErrorLaunchOutOfResources: hipError_t = 701;
pub const hipErrorLaunchTimeOut: hipError_t = 702;
pub const hipErrorPeerAccessAlreadyEnabled: hipError_t = 704;
pub const hipErrorContextIsDestroyed: hipError_t = 709;
pub const hipErrorAssert: hipError_t = 710;
pub const hipErrorLaunchFailure: hipError_t = 719;
pub const hipErrorNotSupported: hipError_t = 801;
pub const hipErrorUnknown: hipError_t = 999;

// Context creation flags
pub const hipDeviceScheduleAuto: c_uint = 0x0;
pub const hipDeviceMapHost: c_uint = 0x8;
pub const hipDeviceLmemResizeToMax: c_uint = 0x10;

// Host allocation flags
pub const hipHostMallocMapped: c_uint = 0x2;
pub const hipHostMallocWriteCombined: c_uint = 0x4;

// Stream / event flags
pub const hipStreamDefault: c_uint = 0x0;
pub const hipStreamNonBlocking: c_uint = 0x1;
pub const hipEventDefault: c_uint = 0x0;
pub const hipEventBlockingSync: c_uint = 0x1;
pub const hipEventDisableTiming: c_uint = 0x2;

// Function cache preference
pub const hipFuncCachePreferNone: c_int = 0;
pub const hipFuncCachePreferShared: c_int = 1;
pub const hipFuncCachePreferL1: c_int = 2;
pub const hipFuncCachePreferEqual: c_int = 3;

// Graphics interop
pub const hipGraphicsRegisterFlagsNone: c_uint = 0x0;

/// Size of `hipDeviceProp_tR0600` in bytes
pub const HIP_DEVICE_PROP_SIZE: usize = 1472;

/// Opaque handles handed out by the driver.
///
/// Each handle is a plain copyable address. Ownership and lifetime are
/// managed by the RAII wrappers that create them, never by the handle itself.
macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(*mut c_void);

        // SAFETY: the handle is an opaque token the driver accepts from any
        // thread; it is never dereferenced on the host side.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            pub const fn null() -> Self {
                $name(std::ptr::null_mut())
            }

            pub fn from_raw(raw: *mut c_void) -> Self {
                $name(raw)
            }

            pub fn as_raw(&self) -> *mut c_void {
                self.0
            }

            pub fn is_null(&self) -> bool {
                self.0.is_null()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::null()
            }
        }
    };
}

opaque_handle!(
    /// Driver context (`hipCtx_t`)
    HipContextHandle
);
opaque_handle!(
    /// Loaded code object (`hipModule_t`)
    HipModuleHandle
);
opaque_handle!(
    /// Kernel entry point inside a module (`hipFunction_t`)
    HipFunctionHandle
);
opaque_handle!(
    /// Stream (`hipStream_t`); null is the legacy default stream
    HipStreamHandle
);
opaque_handle!(
    /// Event (`hipEvent_t`)
    HipEventHandle
);
opaque_handle!(
    /// Registered graphics resource (`hipGraphicsResource_t`)
    HipGraphicsResource
);

/// Device ordinal as returned by `hipDeviceGet`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HipDeviceHandle(pub hipDevice_t);

/// Device memory address (`hipDeviceptr_t`)
///
/// An integer rather than a pointer: it is only meaningful to the driver and
/// supports offsetting for sub-allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn as_raw(&self) -> hipDeviceptr_t {
        self.0 as usize as hipDeviceptr_t
    }

    pub fn from_raw(raw: hipDeviceptr_t) -> Self {
        DevicePtr(raw as usize as u64)
    }
}

/// Host address of a pinned (page-locked) allocation from `hipHostMalloc`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostPtr(pub usize);

impl HostPtr {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl std::fmt::LowerHex for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

// Function pointer signatures resolved by hipew
pub type FnHipInit = unsafe extern "C" fn(flags: c_uint) -> hipError_t;
pub type FnHipDriverGetVersion = unsafe extern "C" fn(version: *mut c_int) -> hipError_t;
pub type FnHipGetDeviceCount = unsafe extern "C" fn(count: *mut c_int) -> hipError_t;
pub type FnHipDeviceGet = unsafe extern "C" fn(device: *mut hipDevice_t, ordinal: c_int) -> hipError_t;
pub type FnHipGetDeviceProperties =
    unsafe extern "C" fn(props: *mut c_void, device: c_int) -> hipError_t;
pub type FnHipDeviceCanAccessPeer =
    unsafe extern "C" fn(can_access: *mut c_int, device: c_int, peer: c_int) -> hipError_t;
pub type FnHipGetErrorName = unsafe extern "C" fn(error: hipError_t) -> *const c_char;

pub type FnHipCtxCreate =
    unsafe extern "C" fn(ctx: *mut hipCtx_t, flags: c_uint, device: hipDevice_t) -> hipError_t;
pub type FnHipCtxDestroy = unsafe extern "C" fn(ctx: hipCtx_t) -> hipError_t;
pub type FnHipCtxPushCurrent = unsafe extern "C" fn(ctx: hipCtx_t) -> hipError_t;
pub type FnHipCtxPopCurrent = unsafe extern "C" fn(ctx: *mut hipCtx_t) -> hipError_t;
pub type FnHipCtxGetCurrent = unsafe extern "C" fn(ctx: *mut hipCtx_t) -> hipError_t;
pub type FnHipCtxSynchronize = unsafe extern "C" fn() -> hipError_t;
pub type FnHipCtxEnablePeerAccess =
    unsafe extern "C" fn(peer: hipCtx_t, flags: c_uint) -> hipError_t;

pub type FnHipModuleLoadData =
    unsafe extern "C" fn(module: *mut hipModule_t, image: *const c_void) -> hipError_t;
pub type FnHipModuleUnload = unsafe extern "C" fn(module: hipModule_t) -> hipError_t;
pub type FnHipModuleGetFunction = unsafe extern "C" fn(
    function: *mut hipFunction_t,
    module: hipModule_t,
    name: *const c_char,
) -> hipError_t;
pub type FnHipModuleGetGlobal = unsafe extern "C" fn(
    dptr: *mut hipDeviceptr_t,
    bytes: *mut usize,
    module: hipModule_t,
    name: *const c_char,
) -> hipError_t;
pub type FnHipFuncSetCacheConfig =
    unsafe extern "C" fn(function: *const c_void, config: c_int) -> hipError_t;
pub type FnHipModuleOccupancyMaxPotentialBlockSize = unsafe extern "C" fn(
    grid_size: *mut c_int,
    block_size: *mut c_int,
    function: hipFunction_t,
    dyn_shared_mem: usize,
    block_size_limit: c_int,
) -> hipError_t;

pub type FnHipMemGetInfo = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> hipError_t;
pub type FnHipMalloc = unsafe extern "C" fn(ptr: *mut hipDeviceptr_t, size: usize) -> hipError_t;
pub type FnHipFree = unsafe extern "C" fn(ptr: hipDeviceptr_t) -> hipError_t;
pub type FnHipHostMalloc =
    unsafe extern "C" fn(ptr: *mut *mut c_void, size: usize, flags: c_uint) -> hipError_t;
pub type FnHipHostFree = unsafe extern "C" fn(ptr: *mut c_void) -> hipError_t;
pub type FnHipHostGetDevicePointer = unsafe extern "C" fn(
    device_ptr: *mut hipDeviceptr_t,
    host_ptr: *mut c_void,
    flags: c_uint,
) -> hipError_t;
pub type FnHipMemcpyHtoD =
    unsafe extern "C" fn(dst: hipDeviceptr_t, src: *const c_void, bytes: usize) -> hipError_t;
pub type FnHipMemcpyDtoH =
    unsafe extern "C" fn(dst: *mut c_void, src: hipDeviceptr_t, bytes: usize) -> hipError_t;
pub type FnHipMemcpyDtoD =
    unsafe extern "C" fn(dst: hipDeviceptr_t, src: hipDeviceptr_t, bytes: usize) -> hipError_t;
pub type FnHipMemsetD8 =
    unsafe extern "C" fn(dst: hipDeviceptr_t, value: u8, count: usize) -> hipError_t;
pub type FnHipMemcpyHtoDAsync = unsafe extern "C" fn(
    dst: hipDeviceptr_t,
    src: *const c_void,
    bytes: usize,
    stream: hipStream_t,
) -> hipError_t;
pub type FnHipMemcpyDtoHAsync = unsafe extern "C" fn(
    dst: *mut c_void,
    src: hipDeviceptr_t,
    bytes: usize,
    stream: hipStream_t,
) -> hipError_t;
pub type FnHipMemsetD8Async = unsafe extern "C" fn(
    dst: hipDeviceptr_t,
    value: u8,
    count: usize,
    stream: hipStream_t,
) -> hipError_t;

pub type FnHipStreamCreateWithFlags =
    unsafe extern "C" fn(stream: *mut hipStream_t, flags: c_uint) -> hipError_t;
pub type FnHipStreamDestroy = unsafe extern "C" fn(stream: hipStream_t) -> hipError_t;
pub type FnHipStreamSynchronize = unsafe extern "C" fn(stream: hipStream_t) -> hipError_t;
pub type FnHipStreamQuery = unsafe extern "C" fn(stream: hipStream_t) -> hipError_t;

pub type FnHipEventCreateWithFlags =
    unsafe extern "C" fn(event: *mut hipEvent_t, flags: c_uint) -> hipError_t;
pub type FnHipEventDestroy = unsafe extern "C" fn(event: hipEvent_t) -> hipError_t;
pub type FnHipEventRecord = unsafe extern "C" fn(event: hipEvent_t, stream: hipStream_t) -> hipError_t;
pub type FnHipEventSynchronize = unsafe extern "C" fn(event: hipEvent_t) -> hipError_t;
pub type FnHipEventElapsedTime =
    unsafe extern "C" fn(ms: *mut f32, start: hipEvent_t, end: hipEvent_t) -> hipError_t;

pub type FnHipModuleLaunchKernel = unsafe extern "C" fn(
    function: hipFunction_t,
    grid_x: c_uint,
    grid_y: c_uint,
    grid_z: c_uint,
    block_x: c_uint,
    block_y: c_uint,
    block_z: c_uint,
    shared_mem_bytes: c_uint,
    stream: hipStream_t,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> hipError_t;

pub type FnHipGraphicsGLRegisterBuffer = unsafe extern "C" fn(
    resource: *mut hipGraphicsResource_t,
    buffer: c_uint,
    flags: c_uint,
) -> hipError_t;
pub type FnHipGraphicsUnregisterResource =
    unsafe extern "C" fn(resource: hipGraphicsResource_t) -> hipError_t;
pub type FnHipGraphicsMapResources = unsafe extern "C" fn(
    count: c_int,
    resources: *mut hipGraphicsResource_t,
    stream: hipStream_t,
) -> hipError_t;
pub type FnHipGraphicsUnmapResources = unsafe extern "C" fn(
    count: c_int,
    resources: *mut hipGraphicsResource_t,
    stream: hipStream_t,
) -> hipError_t;
pub type FnHipGraphicsResourceGetMappedPointer = unsafe extern "C" fn(
    device_ptr: *mut *mut c_void,
    size: *mut usize,
    resource: hipGraphicsResource_t,
) -> hipError_t;
