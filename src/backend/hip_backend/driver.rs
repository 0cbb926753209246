//! Driver seam between the device layer and the HIP driver API
//!
//! Every component talks to the GPU through [`HipDriver`]. The production
//! implementation, [`DynamicHipDriver`], forwards to function pointers bound
//! from `libamdhip64` at runtime. The in-memory `MockDriver` (feature `mock`)
//! implements the same surface for tests.

use std::ffi::{c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;

use crate::backend::hip_backend::device::HipDeviceProp;
use crate::backend::hip_backend::ffi::{self, *};
use crate::backend::hip_backend::hipew::{self, HipewError};

/// Raw driver result: `Err` carries the failing `hipError_t`
pub type DriverResult<T> = Result<T, hipError_t>;

#[inline]
fn check(code: hipError_t) -> DriverResult<()> {
    if code == hipSuccess {
        Ok(())
    } else {
        Err(code)
    }
}

/// Narrow, object-safe view of the HIP driver API
///
/// Methods mirror single driver entry points. They never record errors or
/// log; that is the caller's job, since only the caller knows which device's
/// error state a failure belongs to.
pub trait HipDriver: Send + Sync + std::fmt::Debug {
    // Initialization and discovery
    fn init(&self, flags: u32) -> DriverResult<()>;
    fn driver_version(&self) -> DriverResult<i32>;
    fn device_count(&self) -> DriverResult<i32>;
    fn device_get(&self, ordinal: i32) -> DriverResult<HipDeviceHandle>;
    fn device_properties(&self, ordinal: i32) -> DriverResult<HipDeviceProp>;
    fn device_can_access_peer(&self, device: i32, peer: i32) -> DriverResult<bool>;

    // Contexts
    fn ctx_create(&self, flags: u32, device: HipDeviceHandle) -> DriverResult<HipContextHandle>;
    fn ctx_destroy(&self, ctx: HipContextHandle) -> DriverResult<()>;
    fn ctx_push_current(&self, ctx: HipContextHandle) -> DriverResult<()>;
    fn ctx_pop_current(&self) -> DriverResult<HipContextHandle>;
    fn ctx_get_current(&self) -> DriverResult<HipContextHandle>;
    fn ctx_synchronize(&self) -> DriverResult<()>;
    fn ctx_enable_peer_access(&self, peer: HipContextHandle) -> DriverResult<()>;

    // Modules
    fn module_load_data(&self, image: &[u8]) -> DriverResult<HipModuleHandle>;
    fn module_unload(&self, module: HipModuleHandle) -> DriverResult<()>;
    fn module_get_function(&self, module: HipModuleHandle, name: &str) -> DriverResult<HipFunctionHandle>;
    fn module_get_global(&self, module: HipModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)>;
    fn func_set_cache_config(&self, function: HipFunctionHandle, config: i32) -> DriverResult<()>;
    /// Returns `(min_grid_size, block_size)`
    fn occupancy_max_potential_block_size(
        &self,
        function: HipFunctionHandle,
        dynamic_shared_mem: usize,
        block_size_limit: i32,
    ) -> DriverResult<(i32, i32)>;

    // Memory
    /// Returns `(free, total)` bytes for the current context's device
    fn mem_get_info(&self) -> DriverResult<(usize, usize)>;
    fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()>;
    fn host_alloc(&self, size: usize, flags: u32) -> DriverResult<HostPtr>;
    fn host_free(&self, ptr: HostPtr) -> DriverResult<()>;
    fn host_get_device_pointer(&self, ptr: HostPtr) -> DriverResult<DevicePtr>;
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()>;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()>;
    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()>;
    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()>;

    /// Stream-ordered host to device copy.
    ///
    /// # Safety
    /// `src` must stay valid and unmodified until `stream` has been synchronized.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: HipStreamHandle,
    ) -> DriverResult<()>;

    /// Stream-ordered device to host copy.
    ///
    /// # Safety
    /// `dst` must stay valid and must not be read until `stream` has been synchronized.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: HipStreamHandle,
    ) -> DriverResult<()>;

    fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: HipStreamHandle,
    ) -> DriverResult<()>;

    // Streams and events
    fn stream_create(&self, flags: u32) -> DriverResult<HipStreamHandle>;
    fn stream_destroy(&self, stream: HipStreamHandle) -> DriverResult<()>;
    fn stream_synchronize(&self, stream: HipStreamHandle) -> DriverResult<()>;
    /// `Ok(true)` when all work on the stream has completed
    fn stream_query(&self, stream: HipStreamHandle) -> DriverResult<bool>;
    fn event_create(&self, flags: u32) -> DriverResult<HipEventHandle>;
    fn event_destroy(&self, event: HipEventHandle) -> DriverResult<()>;
    fn event_record(&self, event: HipEventHandle, stream: HipStreamHandle) -> DriverResult<()>;
    fn event_synchronize(&self, event: HipEventHandle) -> DriverResult<()>;
    fn event_elapsed_time(&self, start: HipEventHandle, end: HipEventHandle) -> DriverResult<f32>;

    /// Launch a kernel.
    ///
    /// # Safety
    /// Every entry of `params` must point to a live value whose type and
    /// layout match the kernel's parameter at the same position.
    unsafe fn launch_kernel(
        &self,
        function: HipFunctionHandle,
        grid: [u32; 3],
        block: [u32; 3],
        shared_mem_bytes: u32,
        stream: HipStreamHandle,
        params: &mut [*mut c_void],
    ) -> DriverResult<()>;

    // OpenGL interop
    fn graphics_gl_register_buffer(&self, buffer: u32, flags: u32) -> DriverResult<HipGraphicsResource>;
    fn graphics_unregister_resource(&self, resource: HipGraphicsResource) -> DriverResult<()>;
    fn graphics_map_resource(&self, resource: HipGraphicsResource, stream: HipStreamHandle) -> DriverResult<()>;
    fn graphics_unmap_resource(&self, resource: HipGraphicsResource, stream: HipStreamHandle) -> DriverResult<()>;
    fn graphics_mapped_pointer(&self, resource: HipGraphicsResource) -> DriverResult<(DevicePtr, usize)>;

    /// Symbolic name of a status code, e.g. `hipErrorOutOfMemory`
    fn error_name(&self, code: hipError_t) -> String {
        hipew::error_string(code).to_string()
    }
}

/// Function pointer table bound from the driver library
struct HipFunctions {
    init: FnHipInit,
    driver_get_version: FnHipDriverGetVersion,
    get_device_count: FnHipGetDeviceCount,
    device_get: FnHipDeviceGet,
    get_device_properties: FnHipGetDeviceProperties,
    get_error_name: Option<FnHipGetErrorName>,
    device_can_access_peer: Option<FnHipDeviceCanAccessPeer>,

    ctx_create: FnHipCtxCreate,
    ctx_destroy: FnHipCtxDestroy,
    ctx_push_current: FnHipCtxPushCurrent,
    ctx_pop_current: FnHipCtxPopCurrent,
    ctx_get_current: FnHipCtxGetCurrent,
    ctx_synchronize: FnHipCtxSynchronize,
    ctx_enable_peer_access: Option<FnHipCtxEnablePeerAccess>,

    module_load_data: FnHipModuleLoadData,
    module_unload: FnHipModuleUnload,
    module_get_function: FnHipModuleGetFunction,
    module_get_global: FnHipModuleGetGlobal,
    func_set_cache_config: FnHipFuncSetCacheConfig,
    occupancy_max_potential_block_size: FnHipModuleOccupancyMaxPotentialBlockSize,

    mem_get_info: FnHipMemGetInfo,
    malloc: FnHipMalloc,
    free: FnHipFree,
    host_malloc: FnHipHostMalloc,
    host_free: FnHipHostFree,
    host_get_device_pointer: FnHipHostGetDevicePointer,
    memcpy_htod: FnHipMemcpyHtoD,
    memcpy_dtoh: FnHipMemcpyDtoH,
    memcpy_dtod: FnHipMemcpyDtoD,
    memset_d8: FnHipMemsetD8,
    memcpy_htod_async: FnHipMemcpyHtoDAsync,
    memcpy_dtoh_async: FnHipMemcpyDtoHAsync,
    memset_d8_async: FnHipMemsetD8Async,

    stream_create_with_flags: FnHipStreamCreateWithFlags,
    stream_destroy: FnHipStreamDestroy,
    stream_synchronize: FnHipStreamSynchronize,
    stream_query: FnHipStreamQuery,
    event_create_with_flags: FnHipEventCreateWithFlags,
    event_destroy: FnHipEventDestroy,
    event_record: FnHipEventRecord,
    event_synchronize: FnHipEventSynchronize,
    event_elapsed_time: FnHipEventElapsedTime,
    module_launch_kernel: FnHipModuleLaunchKernel,

    graphics_gl_register_buffer: Option<FnHipGraphicsGLRegisterBuffer>,
    graphics_unregister_resource: Option<FnHipGraphicsUnregisterResource>,
    graphics_map_resources: Option<FnHipGraphicsMapResources>,
    graphics_unmap_resources: Option<FnHipGraphicsUnmapResources>,
    graphics_resource_get_mapped_pointer: Option<FnHipGraphicsResourceGetMappedPointer>,
}

/// Bind a required symbol
unsafe fn required<T: Copy>(lib: &Library, name: &str) -> Result<T, HipewError> {
    lib.get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|e| HipewError::SymbolLookupFailed {
            symbol: name.to_string(),
            reason: e.to_string(),
        })
}

/// Bind an optional symbol; absence is logged, not fatal
unsafe fn optional<T: Copy>(lib: &Library, name: &str) -> Option<T> {
    match lib.get::<T>(name.as_bytes()) {
        Ok(symbol) => Some(*symbol),
        Err(_) => {
            tracing::debug!("hipew: optional symbol {} not exported by driver", name);
            None
        }
    }
}

impl HipFunctions {
    unsafe fn bind(lib: &Library) -> Result<Self, HipewError> {
        Ok(HipFunctions {
            init: required(lib, "hipInit")?,
            driver_get_version: required(lib, "hipDriverGetVersion")?,
            get_device_count: required(lib, "hipGetDeviceCount")?,
            device_get: required(lib, "hipDeviceGet")?,
            get_device_properties: required(lib, "hipGetDevicePropertiesR0600")?,
            get_error_name: optional(lib, "hipGetErrorName"),
            device_can_access_peer: optional(lib, "hipDeviceCanAccessPeer"),

            ctx_create: required(lib, "hipCtxCreate")?,
            ctx_destroy: required(lib, "hipCtxDestroy")?,
            ctx_push_current: required(lib, "hipCtxPushCurrent")?,
            ctx_pop_current: required(lib, "hipCtxPopCurrent")?,
            ctx_get_current: required(lib, "hipCtxGetCurrent")?,
            ctx_synchronize: required(lib, "hipCtxSynchronize")?,
            ctx_enable_peer_access: optional(lib, "hipCtxEnablePeerAccess"),

            module_load_data: required(lib, "hipModuleLoadData")?,
            module_unload: required(lib, "hipModuleUnload")?,
            module_get_function: required(lib, "hipModuleGetFunction")?,
            module_get_global: required(lib, "hipModuleGetGlobal")?,
            func_set_cache_config: required(lib, "hipFuncSetCacheConfig")?,
            occupancy_max_potential_block_size: required(
                lib,
                "hipModuleOccupancyMaxPotentialBlockSize",
            )?,

            mem_get_info: required(lib, "hipMemGetInfo")?,
            malloc: required(lib, "hipMalloc")?,
            free: required(lib, "hipFree")?,
            host_malloc: required(lib, "hipHostMalloc")?,
            host_free: required(lib, "hipHostFree")?,
            host_get_device_pointer: required(lib, "hipHostGetDevicePointer")?,
            memcpy_htod: required(lib, "hipMemcpyHtoD")?,
            memcpy_dtoh: required(lib, "hipMemcpyDtoH")?,
            memcpy_dtod: required(lib, "hipMemcpyDtoD")?,
            memset_d8: required(lib, "hipMemsetD8")?,
            memcpy_htod_async: required(lib, "hipMemcpyHtoDAsync")?,
            memcpy_dtoh_async: required(lib, "hipMemcpyDtoHAsync")?,
            memset_d8_async: required(lib, "hipMemsetD8Async")?,

            stream_create_with_flags: required(lib, "hipStreamCreateWithFlags")?,
            stream_destroy: required(lib, "hipStreamDestroy")?,
            stream_synchronize: required(lib, "hipStreamSynchronize")?,
            stream_query: required(lib, "hipStreamQuery")?,
            event_create_with_flags: required(lib, "hipEventCreateWithFlags")?,
            event_destroy: required(lib, "hipEventDestroy")?,
            event_record: required(lib, "hipEventRecord")?,
            event_synchronize: required(lib, "hipEventSynchronize")?,
            event_elapsed_time: required(lib, "hipEventElapsedTime")?,
            module_launch_kernel: required(lib, "hipModuleLaunchKernel")?,

            graphics_gl_register_buffer: optional(lib, "hipGraphicsGLRegisterBuffer"),
            graphics_unregister_resource: optional(lib, "hipGraphicsUnregisterResource"),
            graphics_map_resources: optional(lib, "hipGraphicsMapResources"),
            graphics_unmap_resources: optional(lib, "hipGraphicsUnmapResources"),
            graphics_resource_get_mapped_pointer: optional(
                lib,
                "hipGraphicsResourceGetMappedPointer",
            ),
        })
    }
}

/// [`HipDriver`] over a dynamically opened `libamdhip64`
///
/// The library handle lives exactly as long as this value; dropping the last
/// `Arc` to it closes the library.
pub struct DynamicHipDriver {
    fns: HipFunctions,
    path: PathBuf,
    // Declared last so the table is dropped before the library is closed.
    _lib: Library,
}

// SAFETY: the function table is immutable after binding and the HIP runtime
// is internally synchronized.
unsafe impl Send for DynamicHipDriver {}
unsafe impl Sync for DynamicHipDriver {}

impl std::fmt::Debug for DynamicHipDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicHipDriver")
            .field("path", &self.path)
            .field("interop", &self.fns.graphics_gl_register_buffer.is_some())
            .finish()
    }
}

impl DynamicHipDriver {
    /// Open the first loadable candidate and bind every required symbol.
    pub fn open(candidates: &[PathBuf]) -> Result<Self, HipewError> {
        let mut tried = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            tracing::debug!("hipew: trying {}", candidate.display());
            // SAFETY: loading the HIP runtime runs its initializers, which
            // have no preconditions on our side.
            match unsafe { Library::new(candidate) } {
                Ok(lib) => return Self::bind(lib, candidate),
                Err(e) => {
                    tracing::debug!("hipew: {} not loadable: {}", candidate.display(), e);
                    tried.push(candidate.display().to_string());
                }
            }
        }
        Err(HipewError::OpenFailed { tried })
    }

    fn bind(lib: Library, path: &Path) -> Result<Self, HipewError> {
        // SAFETY: each symbol is bound with the signature from hip_runtime_api.h.
        let fns = unsafe { HipFunctions::bind(&lib)? };
        tracing::info!("hipew: loaded HIP driver from {}", path.display());
        Ok(DynamicHipDriver {
            fns,
            path: path.to_path_buf(),
            _lib: lib,
        })
    }

    /// Path the library was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HipDriver for DynamicHipDriver {
    fn init(&self, flags: u32) -> DriverResult<()> {
        check(unsafe { (self.fns.init)(flags) })
    }

    fn driver_version(&self) -> DriverResult<i32> {
        let mut version: c_int = 0;
        check(unsafe { (self.fns.driver_get_version)(&mut version) })?;
        Ok(version)
    }

    fn device_count(&self) -> DriverResult<i32> {
        let mut count: c_int = 0;
        check(unsafe { (self.fns.get_device_count)(&mut count) })?;
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> DriverResult<HipDeviceHandle> {
        let mut device: hipDevice_t = 0;
        check(unsafe { (self.fns.device_get)(&mut device, ordinal) })?;
        Ok(HipDeviceHandle(device))
    }

    fn device_properties(&self, ordinal: i32) -> DriverResult<HipDeviceProp> {
        let mut props = HipDeviceProp::default();
        check(unsafe {
            (self.fns.get_device_properties)(props.as_mut_ptr() as *mut c_void, ordinal)
        })?;
        Ok(props)
    }

    fn device_can_access_peer(&self, device: i32, peer: i32) -> DriverResult<bool> {
        let f = self.fns.device_can_access_peer.ok_or(hipErrorNotSupported)?;
        let mut can_access: c_int = 0;
        check(unsafe { f(&mut can_access, device, peer) })?;
        Ok(can_access != 0)
    }

    fn ctx_create(&self, flags: u32, device: HipDeviceHandle) -> DriverResult<HipContextHandle> {
        let mut ctx: hipCtx_t = ptr::null_mut();
        check(unsafe { (self.fns.ctx_create)(&mut ctx, flags, device.0) })?;
        Ok(HipContextHandle::from_raw(ctx))
    }

    fn ctx_destroy(&self, ctx: HipContextHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.ctx_destroy)(ctx.as_raw()) })
    }

    fn ctx_push_current(&self, ctx: HipContextHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.ctx_push_current)(ctx.as_raw()) })
    }

    fn ctx_pop_current(&self) -> DriverResult<HipContextHandle> {
        let mut ctx: hipCtx_t = ptr::null_mut();
        check(unsafe { (self.fns.ctx_pop_current)(&mut ctx) })?;
        Ok(HipContextHandle::from_raw(ctx))
    }

    fn ctx_get_current(&self) -> DriverResult<HipContextHandle> {
        let mut ctx: hipCtx_t = ptr::null_mut();
        check(unsafe { (self.fns.ctx_get_current)(&mut ctx) })?;
        Ok(HipContextHandle::from_raw(ctx))
    }

    fn ctx_synchronize(&self) -> DriverResult<()> {
        check(unsafe { (self.fns.ctx_synchronize)() })
    }

    fn ctx_enable_peer_access(&self, peer: HipContextHandle) -> DriverResult<()> {
        let f = self.fns.ctx_enable_peer_access.ok_or(hipErrorNotSupported)?;
        check(unsafe { f(peer.as_raw(), 0) })
    }

    fn module_load_data(&self, image: &[u8]) -> DriverResult<HipModuleHandle> {
        let mut module: hipModule_t = ptr::null_mut();
        check(unsafe { (self.fns.module_load_data)(&mut module, image.as_ptr() as *const c_void) })?;
        Ok(HipModuleHandle::from_raw(module))
    }

    fn module_unload(&self, module: HipModuleHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.module_unload)(module.as_raw()) })
    }

    fn module_get_function(&self, module: HipModuleHandle, name: &str) -> DriverResult<HipFunctionHandle> {
        let name = CString::new(name).map_err(|_| hipErrorInvalidValue)?;
        let mut function: hipFunction_t = ptr::null_mut();
        check(unsafe { (self.fns.module_get_function)(&mut function, module.as_raw(), name.as_ptr()) })?;
        Ok(HipFunctionHandle::from_raw(function))
    }

    fn module_get_global(&self, module: HipModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)> {
        let name = CString::new(name).map_err(|_| hipErrorInvalidValue)?;
        let mut dptr: hipDeviceptr_t = ptr::null_mut();
        let mut bytes: usize = 0;
        check(unsafe {
            (self.fns.module_get_global)(&mut dptr, &mut bytes, module.as_raw(), name.as_ptr())
        })?;
        Ok((DevicePtr::from_raw(dptr), bytes))
    }

    fn func_set_cache_config(&self, function: HipFunctionHandle, config: i32) -> DriverResult<()> {
        check(unsafe { (self.fns.func_set_cache_config)(function.as_raw() as *const c_void, config) })
    }

    fn occupancy_max_potential_block_size(
        &self,
        function: HipFunctionHandle,
        dynamic_shared_mem: usize,
        block_size_limit: i32,
    ) -> DriverResult<(i32, i32)> {
        let mut grid: c_int = 0;
        let mut block: c_int = 0;
        check(unsafe {
            (self.fns.occupancy_max_potential_block_size)(
                &mut grid,
                &mut block,
                function.as_raw(),
                dynamic_shared_mem,
                block_size_limit,
            )
        })?;
        Ok((grid, block))
    }

    fn mem_get_info(&self) -> DriverResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        check(unsafe { (self.fns.mem_get_info)(&mut free, &mut total) })?;
        Ok((free, total))
    }

    fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        let mut dptr: hipDeviceptr_t = ptr::null_mut();
        check(unsafe { (self.fns.malloc)(&mut dptr, size) })?;
        Ok(DevicePtr::from_raw(dptr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        check(unsafe { (self.fns.free)(ptr.as_raw()) })
    }

    fn host_alloc(&self, size: usize, flags: u32) -> DriverResult<HostPtr> {
        let mut host: *mut c_void = ptr::null_mut();
        check(unsafe { (self.fns.host_malloc)(&mut host, size, flags) })?;
        Ok(HostPtr(host as usize))
    }

    fn host_free(&self, ptr: HostPtr) -> DriverResult<()> {
        check(unsafe { (self.fns.host_free)(ptr.as_raw()) })
    }

    fn host_get_device_pointer(&self, ptr: HostPtr) -> DriverResult<DevicePtr> {
        let mut dptr: hipDeviceptr_t = ptr::null_mut();
        check(unsafe { (self.fns.host_get_device_pointer)(&mut dptr, ptr.as_raw(), 0) })?;
        Ok(DevicePtr::from_raw(dptr))
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        check(unsafe { (self.fns.memcpy_htod)(dst.as_raw(), src.as_ptr() as *const c_void, src.len()) })
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        check(unsafe { (self.fns.memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src.as_raw(), dst.len()) })
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        check(unsafe { (self.fns.memcpy_dtod)(dst.as_raw(), src.as_raw(), bytes) })
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        check(unsafe { (self.fns.memset_d8)(dst.as_raw(), value, count) })
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: HipStreamHandle,
    ) -> DriverResult<()> {
        check((self.fns.memcpy_htod_async)(
            dst.as_raw(),
            src.as_ptr() as *const c_void,
            src.len(),
            stream.as_raw(),
        ))
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: HipStreamHandle,
    ) -> DriverResult<()> {
        check((self.fns.memcpy_dtoh_async)(
            dst.as_mut_ptr() as *mut c_void,
            src.as_raw(),
            dst.len(),
            stream.as_raw(),
        ))
    }

    fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: HipStreamHandle,
    ) -> DriverResult<()> {
        check(unsafe { (self.fns.memset_d8_async)(dst.as_raw(), value, count, stream.as_raw()) })
    }

    fn stream_create(&self, flags: u32) -> DriverResult<HipStreamHandle> {
        let mut stream: hipStream_t = ptr::null_mut();
        check(unsafe { (self.fns.stream_create_with_flags)(&mut stream, flags) })?;
        Ok(HipStreamHandle::from_raw(stream))
    }

    fn stream_destroy(&self, stream: HipStreamHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.stream_destroy)(stream.as_raw()) })
    }

    fn stream_synchronize(&self, stream: HipStreamHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.stream_synchronize)(stream.as_raw()) })
    }

    fn stream_query(&self, stream: HipStreamHandle) -> DriverResult<bool> {
        match unsafe { (self.fns.stream_query)(stream.as_raw()) } {
            ffi::hipSuccess => Ok(true),
            ffi::hipErrorNotReady => Ok(false),
            code => Err(code),
        }
    }

    fn event_create(&self, flags: u32) -> DriverResult<HipEventHandle> {
        let mut event: hipEvent_t = ptr::null_mut();
        check(unsafe { (self.fns.event_create_with_flags)(&mut event, flags) })?;
        Ok(HipEventHandle::from_raw(event))
    }

    fn event_destroy(&self, event: HipEventHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.event_destroy)(event.as_raw()) })
    }

    fn event_record(&self, event: HipEventHandle, stream: HipStreamHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.event_record)(event.as_raw(), stream.as_raw()) })
    }

    fn event_synchronize(&self, event: HipEventHandle) -> DriverResult<()> {
        check(unsafe { (self.fns.event_synchronize)(event.as_raw()) })
    }

    fn event_elapsed_time(&self, start: HipEventHandle, end: HipEventHandle) -> DriverResult<f32> {
        let mut ms: f32 = 0.0;
        check(unsafe { (self.fns.event_elapsed_time)(&mut ms, start.as_raw(), end.as_raw()) })?;
        Ok(ms)
    }

    unsafe fn launch_kernel(
        &self,
        function: HipFunctionHandle,
        grid: [u32; 3],
        block: [u32; 3],
        shared_mem_bytes: u32,
        stream: HipStreamHandle,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        check((self.fns.module_launch_kernel)(
            function.as_raw(),
            grid[0],
            grid[1],
            grid[2],
            block[0],
            block[1],
            block[2],
            shared_mem_bytes,
            stream.as_raw(),
            params.as_mut_ptr(),
            ptr::null_mut(),
        ))
    }

    fn graphics_gl_register_buffer(&self, buffer: u32, flags: u32) -> DriverResult<HipGraphicsResource> {
        let f = self.fns.graphics_gl_register_buffer.ok_or(hipErrorNotSupported)?;
        let mut resource: hipGraphicsResource_t = ptr::null_mut();
        check(unsafe { f(&mut resource, buffer, flags) })?;
        Ok(HipGraphicsResource::from_raw(resource))
    }

    fn graphics_unregister_resource(&self, resource: HipGraphicsResource) -> DriverResult<()> {
        let f = self.fns.graphics_unregister_resource.ok_or(hipErrorNotSupported)?;
        check(unsafe { f(resource.as_raw()) })
    }

    fn graphics_map_resource(&self, resource: HipGraphicsResource, stream: HipStreamHandle) -> DriverResult<()> {
        let f = self.fns.graphics_map_resources.ok_or(hipErrorNotSupported)?;
        let mut raw = resource.as_raw();
        check(unsafe { f(1, &mut raw, stream.as_raw()) })
    }

    fn graphics_unmap_resource(&self, resource: HipGraphicsResource, stream: HipStreamHandle) -> DriverResult<()> {
        let f = self.fns.graphics_unmap_resources.ok_or(hipErrorNotSupported)?;
        let mut raw = resource.as_raw();
        check(unsafe { f(1, &mut raw, stream.as_raw()) })
    }

    fn graphics_mapped_pointer(&self, resource: HipGraphicsResource) -> DriverResult<(DevicePtr, usize)> {
        let f = self
            .fns
            .graphics_resource_get_mapped_pointer
            .ok_or(hipErrorNotSupported)?;
        let mut dptr: *mut c_void = ptr::null_mut();
        let mut size: usize = 0;
        check(unsafe { f(&mut dptr, &mut size, resource.as_raw()) })?;
        Ok((DevicePtr::from_raw(dptr), size))
    }

    fn error_name(&self, code: hipError_t) -> String {
        if let Some(f) = self.fns.get_error_name {
            // SAFETY: hipGetErrorName returns a static NUL-terminated string or null.
            let name = unsafe { f(code) };
            if !name.is_null() {
                return unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
            }
        }
        hipew::error_string(code).to_string()
    }
}
