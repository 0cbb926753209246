//! HIP compute device
//!
//! [`HipDevice`] owns one driver context and, once kernels are loaded, the
//! kernel module. Every driver call runs inside a [`HipContextScope`], and
//! every failure is recorded on the device's sticky [`ErrorState`] before it
//! is returned.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::backend::hip_backend::compiler::{KernelCompiler, KernelFeatures};
use crate::backend::hip_backend::device::DeviceCapabilities;
use crate::backend::hip_backend::device_context::HipContextScope;
use crate::backend::hip_backend::driver::HipDriver;
use crate::backend::hip_backend::error::{hip_check, ErrorState, HipError, HipResult};
use crate::backend::hip_backend::ffi::{
    self, DevicePtr, HipContextHandle, HipDeviceHandle, HipStreamHandle,
};
use crate::backend::hip_backend::hipew;
use crate::backend::hip_backend::kernels::{DeviceKernel, HipDeviceKernels};
use crate::backend::hip_backend::memory::{
    fits_in_mapped_host, fits_on_device, system_map_host_limit, DeviceMemory, MemoryStats,
    MemoryTracker, MemoryType, Placement, Residency,
};
use crate::backend::hip_backend::module::HipModule;
use crate::backend::hip_backend::queue::{HipDeviceQueue, KernelArgs};
use crate::config::DeviceConfig;

/// Base name of the kernel module binary
const KERNEL_MODULE_NAME: &str = "kernel";

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// A HIP device and its driver context
pub struct HipDevice {
    id: u64,
    driver: Arc<dyn HipDriver>,
    ordinal: i32,
    handle: HipDeviceHandle,
    context: HipContextHandle,
    config: DeviceConfig,
    capabilities: DeviceCapabilities,
    map_host_limit: usize,
    errors: ErrorState,
    module: Mutex<Option<HipModule>>,
    kernels: OnceCell<HipDeviceKernels>,
    memory: Mutex<MemoryTracker>,
    /// Set while textures are being moved to host memory
    moving_textures: AtomicBool,
    local_memory_reserved: AtomicUsize,
}

impl std::fmt::Debug for HipDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HipDevice")
            .field("ordinal", &self.ordinal)
            .field("name", &self.capabilities.name)
            .field("gcn_arch", &self.capabilities.gcn_arch)
            .field("kernels_loaded", &self.kernels.get().is_some())
            .finish()
    }
}

impl HipDevice {
    /// Open device `ordinal` through the process-wide HIP shim
    pub fn open(ordinal: i32, config: DeviceConfig) -> HipResult<Arc<Self>> {
        let driver = hipew::driver()?;
        Self::new(driver, ordinal, config)
    }

    /// Create the driver context for device `ordinal`.
    ///
    /// The context is created current and popped again before returning, so
    /// the calling thread's context is unchanged.
    pub fn new(
        driver: Arc<dyn HipDriver>,
        ordinal: i32,
        config: DeviceConfig,
    ) -> HipResult<Arc<Self>> {
        let errors = ErrorState::new();

        hip_check!(errors, "hipInit", driver.init(0));
        let handle = hip_check!(errors, "hipDeviceGet", driver.device_get(ordinal));
        let props = hip_check!(
            errors,
            "hipGetDevicePropertiesR0600",
            driver.device_properties(ordinal)
        );
        let capabilities = DeviceCapabilities::from_props(&props);

        let map_host = capabilities.can_map_host_memory && config.map_host_memory;
        let mut flags = ffi::hipDeviceLmemResizeToMax;
        if map_host {
            flags |= ffi::hipDeviceMapHost;
        } else {
            tracing::debug!("HipDevice::new: device {} cannot map host memory", ordinal);
        }

        let context = hip_check!(errors, "hipCtxCreate", driver.ctx_create(flags, handle));
        if let Err(code) = driver.ctx_pop_current() {
            let err = HipError::driver("hipCtxPopCurrent", code, concat!(file!(), ":", line!()));
            errors.record(&err);
            if let Err(code) = driver.ctx_destroy(context) {
                tracing::warn!("HipDevice::new: hipCtxDestroy failed: {}", driver.error_name(code));
            }
            return Err(err);
        }

        let map_host_limit = if map_host {
            config.map_host_limit.unwrap_or_else(system_map_host_limit)
        } else {
            0
        };

        tracing::info!(
            "HipDevice::new: device {} {} ({}), {} compute units, {} MiB",
            ordinal,
            capabilities.name,
            capabilities.gcn_arch,
            capabilities.compute_units,
            capabilities.total_memory / (1024 * 1024)
        );

        Ok(Arc::new(HipDevice {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            ordinal,
            handle,
            context,
            config,
            capabilities,
            map_host_limit,
            errors,
            module: Mutex::new(None),
            kernels: OnceCell::new(),
            memory: Mutex::new(MemoryTracker::new()),
            moving_textures: AtomicBool::new(false),
            local_memory_reserved: AtomicUsize::new(0),
        }))
    }

    pub fn driver(&self) -> &Arc<dyn HipDriver> {
        &self.driver
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn handle(&self) -> HipDeviceHandle {
        self.handle
    }

    pub fn context_handle(&self) -> HipContextHandle {
        self.context
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn errors(&self) -> &ErrorState {
        &self.errors
    }

    /// Bytes of mapped host memory this device may use; 0 when disabled
    pub fn map_host_limit(&self) -> usize {
        self.map_host_limit
    }

    pub fn is_rdna2_or_newer(&self) -> bool {
        self.capabilities.is_rdna2_or_newer()
    }

    /// Whether the renderer kernels run on this device; records why not
    pub fn supports_device(&self) -> bool {
        if self.capabilities.is_supported() {
            return true;
        }
        self.set_error(self.capabilities.unsupported_message());
        false
    }

    // Sticky error state

    pub fn set_error(&self, message: impl Into<String>) -> bool {
        self.errors.set(message)
    }

    pub fn have_error(&self) -> bool {
        self.errors.have_error()
    }

    pub fn error_message(&self) -> Option<String> {
        self.errors.message()
    }

    pub fn clear_error(&self) {
        self.errors.clear()
    }

    /// Record the error of a failed operation on this device
    pub(crate) fn checked<T>(&self, result: HipResult<T>) -> HipResult<T> {
        if let Err(err) = &result {
            self.errors.record(err);
        }
        result
    }

    fn check_owner(&self, mem: &DeviceMemory) -> HipResult<()> {
        match mem.residency().owner {
            Some(owner) if owner != self.id => Err(HipError::InvalidArgument(format!(
                "'{}' is allocated on another device",
                mem.name()
            ))),
            _ => Ok(()),
        }
    }

    // Memory

    /// Free and total device memory in bytes
    pub fn mem_info(&self) -> HipResult<(usize, usize)> {
        let scope = HipContextScope::new(self);
        scope.check()?;
        Ok(hip_check!(self.errors, "hipMemGetInfo", self.driver.mem_get_info()))
    }

    pub fn memory_stats(&self) -> HipResult<MemoryStats> {
        Ok(self.memory.lock()?.stats())
    }

    /// Allocate `mem` on the device, or in mapped host memory when the
    /// device is full.
    ///
    /// When the request does not fit next to its headroom, textures already
    /// on the device are moved to mapped host memory first. Refused with
    /// [`HipError::PendingError`] while the device has an error.
    pub fn mem_alloc(&self, mem: &mut DeviceMemory) -> HipResult<()> {
        if mem.is_allocated() {
            return Err(HipError::InvalidArgument(format!(
                "'{}' is already allocated",
                mem.name()
            )));
        }
        if mem.size() == 0 {
            return Err(HipError::InvalidArgument(format!(
                "cannot allocate '{}' with zero size",
                mem.name()
            )));
        }
        self.errors.ensure_clear()?;

        let scope = HipContextScope::new(self);
        scope.check()?;

        let size = mem.size();
        let is_texture = mem.memory_type().is_texture();
        let headroom = if is_texture {
            self.config.texture_headroom
        } else {
            self.config.working_headroom
        };
        let (mut free, _total) = hip_check!(self.errors, "hipMemGetInfo", self.driver.mem_get_info());

        // Working memory hurts more in host memory than textures do
        if !mem.is_image() && self.map_host_limit > 0 && !fits_on_device(size, headroom, free) {
            let needed = size.saturating_add(headroom).saturating_sub(free);
            self.move_textures_to_host(needed, is_texture)?;
            free = hip_check!(self.errors, "hipMemGetInfo", self.driver.mem_get_info()).0;
        }

        let mut allocation = None;
        if fits_on_device(size, headroom, free) {
            match self.driver.mem_alloc(size) {
                Ok(ptr) => allocation = Some((ptr, Placement::Device)),
                Err(code) => tracing::debug!(
                    "HipDevice::mem_alloc: hipMalloc of {} bytes failed: {}",
                    size,
                    self.driver.error_name(code)
                ),
            }
        }

        let mut memory = self.memory.lock()?;
        if allocation.is_none()
            && self.map_host_limit > 0
            && fits_in_mapped_host(size, memory.map_host_used(), self.map_host_limit)
        {
            allocation = self.alloc_mapped_host(size)?;
            if allocation.is_some() {
                tracing::warn!(
                    "HipDevice::mem_alloc: '{}' ({} bytes) placed in mapped host memory",
                    mem.name(),
                    size
                );
            }
        }

        let (ptr, placement) = match allocation {
            Some(allocation) => allocation,
            None => {
                drop(memory);
                let message = "System is out of GPU and shared host memory".to_string();
                tracing::debug!(
                    "HipDevice::mem_alloc: '{}' ({} bytes) failed, out of device and host memory",
                    mem.name(),
                    size
                );
                self.errors.set(message.clone());
                return Err(HipError::OutOfMemory(message));
            }
        };

        memory.record_alloc(ptr, mem, placement);
        mem.set_residency(Residency {
            ptr,
            placement: Some(placement),
            owner: Some(self.id),
        });
        tracing::debug!(
            "HipDevice::mem_alloc: '{}' {} bytes at {:#x}",
            mem.name(),
            size,
            ptr
        );
        Ok(())
    }

    /// Pinned, write-combined host allocation mapped into the device.
    /// `Ok(None)` when the host allocation itself fails.
    fn alloc_mapped_host(&self, size: usize) -> HipResult<Option<(DevicePtr, Placement)>> {
        let host = match self
            .driver
            .host_alloc(size, ffi::hipHostMallocMapped | ffi::hipHostMallocWriteCombined)
        {
            Ok(host) => host,
            Err(code) => {
                tracing::debug!(
                    "HipDevice::mem_alloc: hipHostMalloc of {} bytes failed: {}",
                    size,
                    self.driver.error_name(code)
                );
                return Ok(None);
            }
        };

        match self.driver.host_get_device_pointer(host) {
            Ok(ptr) => Ok(Some((ptr, Placement::MappedHost(host)))),
            Err(code) => {
                if let Err(free_code) = self.driver.host_free(host) {
                    tracing::warn!(
                        "HipDevice::mem_alloc: hipHostFree after failed mapping failed: {}",
                        self.driver.error_name(free_code)
                    );
                }
                let err = HipError::driver(
                    "hipHostGetDevicePointer",
                    code,
                    concat!(file!(), ":", line!()),
                );
                self.errors.record(&err);
                Err(err)
            }
        }
    }

    /// Move device-resident textures to mapped host memory until `size`
    /// bytes were released or nothing movable is left. With `images_only`,
    /// only image textures are moved.
    ///
    /// Must be called with the device context current.
    fn move_textures_to_host(&self, size: usize, images_only: bool) -> HipResult<()> {
        if self.moving_textures.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.move_textures(size, images_only);
        self.moving_textures.store(false, Ordering::Release);
        result
    }

    fn move_textures(&self, mut size: usize, images_only: bool) -> HipResult<()> {
        let mut moved_globals = Vec::new();
        while size > 0 {
            let mut memory = self.memory.lock()?;
            let (old_ptr, candidate) = match memory.eviction_candidate(images_only) {
                Some((ptr, candidate)) => (ptr, candidate.clone()),
                None => break,
            };
            if !fits_in_mapped_host(candidate.size, memory.map_host_used(), self.map_host_limit) {
                break;
            }
            let (new_ptr, placement) = match self.alloc_mapped_host(candidate.size)? {
                Some(allocation) => allocation,
                None => break,
            };

            tracing::debug!(
                "HipDevice::mem_alloc: moving '{}' ({} bytes) from device to host memory",
                candidate.name,
                candidate.size
            );
            if let Err(code) = self.driver.memcpy_dtod(new_ptr, old_ptr, candidate.size) {
                if let Placement::MappedHost(host) = placement {
                    if let Err(free_code) = self.driver.host_free(host) {
                        tracing::warn!(
                            "HipDevice::mem_alloc: hipHostFree failed: {}",
                            self.driver.error_name(free_code)
                        );
                    }
                }
                let err = HipError::driver("hipMemcpyDtoD", code, concat!(file!(), ":", line!()));
                self.errors.record(&err);
                return Err(err);
            }
            if let Err(code) = self.driver.mem_free(old_ptr) {
                tracing::warn!(
                    "HipDevice::mem_alloc: hipFree of moved '{}' failed: {}",
                    candidate.name,
                    self.driver.error_name(code)
                );
            }

            if let Some(moved) = memory.record_move(old_ptr, new_ptr, placement) {
                moved.relocate(Residency {
                    ptr: new_ptr,
                    placement: Some(placement),
                    owner: Some(self.id),
                });
                if moved.mem_type == MemoryType::Global {
                    moved_globals.push((moved.name, new_ptr));
                }
            }
            size = size.saturating_sub(candidate.size);
        }

        // Kernels reach moved globals through their module-scope pointer
        if self.kernels.get().is_some() {
            for (name, ptr) in moved_globals {
                self.const_copy_to(&name, &ptr.0.to_ne_bytes())?;
            }
        }
        Ok(())
    }

    /// Copy `data` to the start of `mem`, allocating it first if needed
    pub fn mem_copy_to(&self, mem: &mut DeviceMemory, data: &[u8]) -> HipResult<()> {
        if data.len() > mem.size() {
            return Err(HipError::InvalidArgument(format!(
                "{} bytes do not fit in '{}' ({} bytes)",
                data.len(),
                mem.name(),
                mem.size()
            )));
        }
        self.check_owner(mem)?;
        if !mem.is_allocated() {
            self.mem_alloc(mem)?;
        }

        if mem.memory_type() == MemoryType::DeviceOnly {
            return Ok(());
        }

        {
            let scope = HipContextScope::new(self);
            scope.check()?;
            hip_check!(
                self.errors,
                "hipMemcpyHtoD",
                self.driver.memcpy_htod(mem.device_pointer(), data)
            );
        }

        // Kernels reach global data through a module-scope pointer of the same name
        if mem.memory_type() == MemoryType::Global {
            self.const_copy_to(mem.name(), &mem.device_pointer().0.to_ne_bytes())?;
        }
        Ok(())
    }

    /// Copy `out.len()` bytes starting at `offset` of `mem` to the host.
    ///
    /// An unallocated buffer reads as zeros.
    pub fn mem_copy_from(&self, mem: &DeviceMemory, offset: usize, out: &mut [u8]) -> HipResult<()> {
        if mem.memory_type() == MemoryType::DeviceOnly {
            return Err(HipError::InvalidArgument(format!(
                "'{}' is device-only and cannot be read back",
                mem.name()
            )));
        }
        let end = offset.checked_add(out.len());
        if end.map_or(true, |end| end > mem.size()) {
            return Err(HipError::InvalidArgument(format!(
                "read of {} bytes at offset {} exceeds '{}' ({} bytes)",
                out.len(),
                offset,
                mem.name(),
                mem.size()
            )));
        }
        if !mem.is_allocated() {
            out.fill(0);
            return Ok(());
        }
        self.check_owner(mem)?;

        let scope = HipContextScope::new(self);
        scope.check()?;
        hip_check!(
            self.errors,
            "hipMemcpyDtoH",
            self.driver.memcpy_dtoh(out, mem.device_pointer().offset(offset))
        );
        Ok(())
    }

    /// Fill `mem` with zeros, allocating it first if needed
    pub fn mem_zero(&self, mem: &mut DeviceMemory) -> HipResult<()> {
        self.check_owner(mem)?;
        if !mem.is_allocated() {
            self.mem_alloc(mem)?;
        }
        let scope = HipContextScope::new(self);
        scope.check()?;
        hip_check!(
            self.errors,
            "hipMemsetD8",
            self.driver.memset_d8(mem.device_pointer(), 0, mem.size())
        );
        Ok(())
    }

    /// Release `mem`. Freeing an unallocated buffer is a no-op.
    ///
    /// The descriptor is reset even when the driver reports a failure.
    pub fn mem_free(&self, mem: &mut DeviceMemory) -> HipResult<()> {
        if !mem.is_allocated() {
            return Ok(());
        }
        self.check_owner(mem)?;

        // Read the location under the lock, a texture move may change it
        let mut memory = self.memory.lock()?;
        let Residency { ptr, placement, .. } = mem.residency();
        let result = {
            let _scope = HipContextScope::new(self);
            match placement {
                Some(Placement::MappedHost(host)) => {
                    self.driver.host_free(host).map_err(|code| ("hipHostFree", code))
                }
                _ => self.driver.mem_free(ptr).map_err(|code| ("hipFree", code)),
            }
        };

        memory.record_free(ptr);
        mem.set_residency(Residency::default());
        drop(memory);

        result.map_err(|(call, code)| {
            let err = HipError::driver(call, code, concat!(file!(), ":", line!()));
            self.errors.record(&err);
            err
        })
    }

    /// Device address `offset` bytes into `mem`
    pub fn mem_alloc_sub_ptr(&self, mem: &DeviceMemory, offset: usize) -> HipResult<DevicePtr> {
        if !mem.is_allocated() {
            return Err(HipError::InvalidArgument(format!(
                "'{}' is not allocated",
                mem.name()
            )));
        }
        if offset > mem.size() {
            return Err(HipError::InvalidArgument(format!(
                "offset {} is past the end of '{}' ({} bytes)",
                offset,
                mem.name(),
                mem.size()
            )));
        }
        self.check_owner(mem)?;
        Ok(mem.device_pointer().offset(offset))
    }

    /// Write `data` into the module-scope variable `name`
    pub fn const_copy_to(&self, name: &str, data: &[u8]) -> HipResult<()> {
        let module = self.module.lock()?;
        let module = module.as_ref().ok_or_else(|| {
            HipError::KernelUnavailable(format!("cannot set '{}' before kernels are loaded", name))
        })?;

        let scope = HipContextScope::new(self);
        scope.check()?;
        let (ptr, size) = self.checked(module.global(name))?;
        if data.len() > size {
            return Err(HipError::InvalidArgument(format!(
                "{} bytes do not fit in global '{}' ({} bytes)",
                data.len(),
                name,
                size
            )));
        }
        hip_check!(self.errors, "hipMemcpyHtoD", self.driver.memcpy_htod(ptr, data));
        Ok(())
    }

    // Kernels

    /// Locate or compile the kernel binary for this device, load it and
    /// resolve every kernel.
    ///
    /// Once a module is loaded, later calls return immediately.
    pub fn load_kernels(&self, features: &KernelFeatures) -> HipResult<()> {
        let mut module = self.module.lock()?;
        if module.is_some() {
            if self.config.adaptive_compile {
                tracing::debug!(
                    "HipDevice::load_kernels: skipping kernel reload for adaptive compilation, not currently supported"
                );
            }
            return Ok(());
        }

        if !self.supports_device() {
            return Err(HipError::DeviceNotSupported(
                self.capabilities.unsupported_message(),
            ));
        }

        let scope = HipContextScope::new(self);
        scope.check()?;

        let compiler = KernelCompiler::from_config(&self.config);
        let path = self.checked(compiler.compile(
            KERNEL_MODULE_NAME,
            &self.capabilities.gcn_arch,
            features,
        ))?;
        let loaded = self.checked(HipModule::load_from_path(self.driver.clone(), &path))?;

        let mut kernels = HipDeviceKernels::new();
        let count = kernels.load(self.driver.as_ref(), loaded.handle());
        tracing::info!(
            "HipDevice::load_kernels: loaded {} kernels from {}",
            count,
            path.display()
        );

        *module = Some(loaded);
        let _ = self.kernels.set(kernels);
        drop(module);

        self.reserve_local_memory(features)
    }

    /// Launch the largest integrator kernel once so the driver sizes its
    /// local memory up front (the context uses `hipDeviceLmemResizeToMax`).
    /// Free memory readings afterwards reflect what scene data can use.
    fn reserve_local_memory(&self, features: &KernelFeatures) -> HipResult<()> {
        let kernel = if features.contains(KernelFeatures::NODE_RAYTRACE) {
            DeviceKernel::IntegratorShadeSurfaceRaytrace
        } else {
            DeviceKernel::IntegratorShadeSurface
        };
        let entry = match self.kernels()?.get(kernel) {
            Some(entry) => *entry,
            None => {
                tracing::debug!(
                    "HipDevice::load_kernels: no {} in module, local memory not reserved",
                    kernel
                );
                return Ok(());
            }
        };

        let scope = HipContextScope::new(self);
        scope.check()?;
        let (free_before, _) = hip_check!(self.errors, "hipMemGetInfo", self.driver.mem_get_info());

        // One block is enough to reserve memory for every multiprocessor
        let mut args = KernelArgs::new();
        args.push_ptr(DevicePtr::NULL).push_ptr(DevicePtr::NULL).push(0i32);
        let mut params = args.params();
        let threads = u32::try_from(entry.num_threads_per_block).unwrap_or(1).max(1);
        hip_check!(
            self.errors,
            "hipModuleLaunchKernel",
            // SAFETY: the kernel takes two pointers and a work size, matching
            // the slots in `args`, which outlives the call.
            unsafe {
                self.driver.launch_kernel(
                    entry.function,
                    [1, 1, 1],
                    [threads, 1, 1],
                    0,
                    HipStreamHandle::null(),
                    &mut params,
                )
            }
        );
        hip_check!(self.errors, "hipCtxSynchronize", self.driver.ctx_synchronize());

        let (free_after, _) = hip_check!(self.errors, "hipMemGetInfo", self.driver.mem_get_info());
        let reserved = free_before.saturating_sub(free_after);
        self.local_memory_reserved.store(reserved, Ordering::Relaxed);
        tracing::info!(
            "HipDevice::load_kernels: local memory reserved {} bytes ({} MiB)",
            reserved,
            reserved / (1024 * 1024)
        );
        Ok(())
    }

    /// Device memory taken by kernel local memory when kernels were loaded
    pub fn local_memory_reserved(&self) -> usize {
        self.local_memory_reserved.load(Ordering::Relaxed)
    }

    /// The kernel table; fails until [`HipDevice::load_kernels`] succeeded
    pub fn kernels(&self) -> HipResult<&HipDeviceKernels> {
        self.kernels
            .get()
            .ok_or_else(|| HipError::KernelUnavailable("kernels are not loaded".to_string()))
    }

    pub fn kernel_available(&self, kernel: DeviceKernel) -> bool {
        self.kernels.get().map_or(false, |k| k.available(kernel))
    }

    // Device-wide operations

    /// Enable peer access between this device and `peer` in both directions.
    ///
    /// Returns false for the device itself or when the hardware cannot
    /// access the peer.
    pub fn check_peer_access(&self, peer: &HipDevice) -> HipResult<bool> {
        if peer.id == self.id {
            return Ok(false);
        }

        let can_access = hip_check!(
            self.errors,
            "hipDeviceCanAccessPeer",
            self.driver.device_can_access_peer(self.ordinal, peer.ordinal)
        );
        if !can_access {
            return Ok(false);
        }

        for (device, other) in [(self, peer), (peer, self)] {
            let scope = HipContextScope::new(device);
            scope.check()?;
            match device.driver.ctx_enable_peer_access(other.context) {
                Ok(()) => {}
                Err(code) if code == ffi::hipErrorPeerAccessAlreadyEnabled => {}
                Err(code) => {
                    device.set_error(format!(
                        "Failed to enable peer access on HIP context ({})",
                        device.driver.error_name(code)
                    ));
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Wait for all work on the device context
    pub fn synchronize(&self) -> HipResult<()> {
        self.errors.ensure_clear()?;
        let scope = HipContextScope::new(self);
        scope.check()?;
        hip_check!(self.errors, "hipCtxSynchronize", self.driver.ctx_synchronize());
        Ok(())
    }

    pub fn create_queue(self: &Arc<Self>) -> HipResult<HipDeviceQueue> {
        HipDeviceQueue::new(Arc::clone(self))
    }
}

impl Drop for HipDevice {
    fn drop(&mut self) {
        let leaked = match self.memory.get_mut() {
            Ok(memory) => memory.drain(),
            Err(poisoned) => poisoned.into_inner().drain(),
        };
        let module = match self.module.get_mut() {
            Ok(module) => module.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        {
            let _scope = HipContextScope::new(self);
            for (ptr, allocation) in leaked {
                tracing::warn!(
                    "HipDevice::drop: freeing '{}' ({} bytes) that is still allocated",
                    allocation.name,
                    allocation.size
                );
                allocation.relocate(Residency::default());
                let result = match allocation.placement {
                    Placement::Device => self.driver.mem_free(ptr),
                    Placement::MappedHost(host) => self.driver.host_free(host),
                };
                if let Err(code) = result {
                    tracing::warn!(
                        "HipDevice::drop: failed to free '{}': {}",
                        allocation.name,
                        self.driver.error_name(code)
                    );
                }
            }
            drop(module);
        }

        if let Err(code) = self.driver.ctx_destroy(self.context) {
            tracing::warn!(
                "HipDevice::drop: hipCtxDestroy failed: {}",
                self.driver.error_name(code)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::hip_backend::mock::MockDriver;

    const MIB: usize = 1024 * 1024;

    fn device(driver: &Arc<MockDriver>, config: DeviceConfig) -> Arc<HipDevice> {
        HipDevice::new(driver.clone(), 0, config).unwrap()
    }

    fn config() -> DeviceConfig {
        DeviceConfig::default().with_map_host_limit(64 * MIB)
    }

    #[test]
    fn test_new_leaves_no_context_current() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        assert_eq!(driver.context_depth(), 0);
        assert_eq!(driver.live_contexts(), 1);
        assert_eq!(device.capabilities().gcn_arch, "gfx1100");
        assert!(device.is_rdna2_or_newer());
        assert_eq!(device.map_host_limit(), 64 * MIB);

        drop(device);
        assert_eq!(driver.live_contexts(), 0);
    }

    #[test]
    fn test_new_reports_invalid_ordinal() {
        let driver = Arc::new(MockDriver::new());
        let err = HipDevice::new(driver.clone(), 3, config()).unwrap_err();
        assert_eq!(err.code(), Some(ffi::hipErrorInvalidDevice));
        assert_eq!(driver.live_contexts(), 0);
    }

    #[test]
    fn test_unsupported_device_records_message() {
        let driver = Arc::new(MockDriver::new());
        driver.set_device_props(0, MockDriver::default_props("AMD Radeon R9 Fury", "gfx803", 8, 0));
        let device = device(&driver, config());

        assert!(!device.supports_device());
        assert_eq!(
            device.error_message().as_deref(),
            Some("HIP backend requires AMD RDNA graphics card or up, but found AMD Radeon R9 Fury.")
        );
        assert!(matches!(
            device.load_kernels(&KernelFeatures::NONE),
            Err(HipError::DeviceNotSupported(_))
        ));
    }

    #[test]
    fn test_alloc_copy_roundtrip_and_free() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());

        let mut mem = DeviceMemory::new("buffer", MemoryType::ReadWrite, 16);
        device.mem_copy_to(&mut mem, &[7u8; 16]).unwrap();
        assert!(mem.is_allocated());
        assert!(!mem.is_host_mapped());
        assert_eq!(device.memory_stats().unwrap().used, 16);

        let mut out = [0u8; 8];
        device.mem_copy_from(&mem, 8, &mut out).unwrap();
        assert_eq!(out, [7u8; 8]);

        device.mem_zero(&mut mem).unwrap();
        device.mem_copy_from(&mem, 0, &mut out).unwrap();
        assert_eq!(out, [0u8; 8]);

        device.mem_free(&mut mem).unwrap();
        assert!(!mem.is_allocated());
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(device.memory_stats().unwrap().used, 0);
        assert_eq!(device.memory_stats().unwrap().peak, 16);
        assert_eq!(driver.context_depth(), 0);
    }

    #[test]
    fn test_copy_from_unallocated_reads_zeros() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        let mem = DeviceMemory::new("empty", MemoryType::ReadOnly, 4);
        let mut out = [9u8; 4];
        device.mem_copy_from(&mem, 0, &mut out).unwrap();
        assert_eq!(out, [0u8; 4]);
        assert!(device.mem_copy_from(&mem, 2, &mut out).is_err());
    }

    #[test]
    fn test_falls_back_to_mapped_host_memory() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        // Less free memory than the working headroom
        driver.set_memory(64 * MIB, 16 * MIB);

        let mut mem = DeviceMemory::new("big", MemoryType::ReadWrite, MIB);
        device.mem_alloc(&mut mem).unwrap();
        assert!(mem.is_host_mapped());
        assert_eq!(driver.live_host_allocations(), 1);
        assert_eq!(device.memory_stats().unwrap().map_host_used, MIB);

        device.mem_copy_to(&mut mem, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        device.mem_copy_from(&mem, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);

        device.mem_free(&mut mem).unwrap();
        assert_eq!(driver.live_host_allocations(), 0);
        assert_eq!(device.memory_stats().unwrap().map_host_used, 0);
    }

    #[test]
    fn test_texture_headroom_is_larger() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config().with_map_host_memory(false));
        driver.set_memory(256 * MIB, 100 * MIB);

        let mut buffer = DeviceMemory::new("buffer", MemoryType::ReadWrite, MIB);
        device.mem_alloc(&mut buffer).unwrap();

        let mut texture = DeviceMemory::new("texture", MemoryType::Texture, MIB);
        assert!(matches!(device.mem_alloc(&mut texture), Err(HipError::OutOfMemory(_))));
        device.clear_error();
        device.mem_free(&mut buffer).unwrap();
    }

    #[test]
    fn test_global_memory_gets_texture_headroom() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config().with_map_host_memory(false));
        driver.set_memory(256 * MIB, 100 * MIB);

        let mut global = DeviceMemory::new("lookup_table", MemoryType::Global, MIB);
        assert!(matches!(device.mem_alloc(&mut global), Err(HipError::OutOfMemory(_))));
        assert!(!global.is_allocated());
        device.clear_error();
    }

    #[test]
    fn test_zero_size_alloc_rejected() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        let mut empty = DeviceMemory::new("empty", MemoryType::ReadWrite, 0);
        assert!(matches!(device.mem_alloc(&mut empty), Err(HipError::InvalidArgument(_))));
        assert!(!device.have_error());
        assert_eq!(device.memory_stats().unwrap().allocations, 0);
        assert_eq!(driver.call_count("hipMalloc"), 0);
    }

    #[test]
    fn test_unmappable_host_memory_is_released() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        driver.set_memory(64 * MIB, 16 * MIB);
        driver.fail_next("hipHostGetDevicePointer", ffi::hipErrorUnknown);

        let mut mem = DeviceMemory::new("mapped", MemoryType::ReadWrite, MIB);
        assert!(device.mem_alloc(&mut mem).is_err());
        assert!(device.have_error());
        assert!(!mem.is_allocated());
        assert_eq!(driver.live_host_allocations(), 0);
        assert_eq!(device.memory_stats().unwrap().map_host_used, 0);
    }

    #[test]
    fn test_working_memory_moves_image_to_host() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config().with_headroom(MIB, 4 * MIB));
        driver.set_memory(64 * MIB, 16 * MIB);

        let mut image = DeviceMemory::new("image", MemoryType::Texture, 8 * MIB).with_height(64);
        device.mem_alloc(&mut image).unwrap();
        assert_eq!(image.placement(), Some(Placement::Device));
        device.mem_copy_to(&mut image, &[9u8; 32]).unwrap();
        let before = image.device_pointer();

        // 8 MiB plus headroom does not fit in the 8 MiB left
        let mut film = DeviceMemory::new("film", MemoryType::ReadWrite, 8 * MIB);
        device.mem_alloc(&mut film).unwrap();
        assert_eq!(film.placement(), Some(Placement::Device));

        assert!(image.is_host_mapped());
        assert_ne!(image.device_pointer(), before);
        let mut out = [0u8; 32];
        device.mem_copy_from(&image, 0, &mut out).unwrap();
        assert_eq!(out, [9u8; 32]);
        assert_eq!(driver.call_count("hipMemcpyDtoD"), 1);

        let stats = device.memory_stats().unwrap();
        assert_eq!(stats.map_host_used, 8 * MIB);
        assert_eq!(stats.allocations, 2);
        assert!(!device.have_error());

        device.mem_free(&mut image).unwrap();
        device.mem_free(&mut film).unwrap();
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.live_host_allocations(), 0);
    }

    #[test]
    fn test_texture_request_moves_only_images() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config().with_headroom(MIB, 4 * MIB));
        driver.set_memory(64 * MIB, 16 * MIB);

        let mut lookup = DeviceMemory::new("lookup", MemoryType::Global, 8 * MIB);
        device.mem_alloc(&mut lookup).unwrap();

        // Another texture does not push the non-image one out, it goes to host itself
        let mut texture = DeviceMemory::new("texture", MemoryType::Texture, 4 * MIB);
        device.mem_alloc(&mut texture).unwrap();
        assert_eq!(lookup.placement(), Some(Placement::Device));
        assert!(texture.is_host_mapped());
        assert_eq!(driver.call_count("hipMemcpyDtoD"), 0);

        // Image allocations never trigger a move
        let mut image = DeviceMemory::new("image", MemoryType::Texture, 8 * MIB).with_height(2);
        device.mem_alloc(&mut image).unwrap();
        assert!(image.is_host_mapped());
        assert_eq!(lookup.placement(), Some(Placement::Device));

        for mem in [&mut lookup, &mut texture, &mut image] {
            device.mem_free(mem).unwrap();
        }
    }

    #[test]
    fn test_moved_global_is_republished() {
        let driver = Arc::new(MockDriver::new());
        let dir = kernel_dir(b"kernel_gpu_prefix_sum\nglobal lookup_table 8\n");
        let device = device(
            &driver,
            config().with_kernel_dir(dir.path()).with_headroom(MIB, 4 * MIB),
        );
        device.load_kernels(&KernelFeatures::NONE).unwrap();
        driver.set_memory(64 * MIB, 16 * MIB);

        let mut table = DeviceMemory::new("lookup_table", MemoryType::Global, 8 * MIB);
        device.mem_copy_to(&mut table, &[1, 2, 3, 4]).unwrap();
        assert_eq!(driver.call_count("hipModuleGetGlobal"), 1);

        let mut film = DeviceMemory::new("film", MemoryType::ReadWrite, 8 * MIB);
        device.mem_alloc(&mut film).unwrap();
        assert!(table.is_host_mapped());
        assert_eq!(driver.call_count("hipModuleGetGlobal"), 2);

        device.mem_free(&mut table).unwrap();
        device.mem_free(&mut film).unwrap();
    }

    #[test]
    fn test_out_of_memory_is_sticky() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config().with_map_host_memory(false));
        driver.set_memory(64 * MIB, 0);

        let mut mem = DeviceMemory::new("a", MemoryType::ReadWrite, 1024);
        match device.mem_alloc(&mut mem) {
            Err(HipError::OutOfMemory(msg)) => {
                assert_eq!(msg, "System is out of GPU and shared host memory")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(device.have_error());

        driver.set_memory(1024 * MIB, 1024 * MIB);
        let mut other = DeviceMemory::new("b", MemoryType::ReadWrite, 1024);
        assert!(matches!(device.mem_alloc(&mut other), Err(HipError::PendingError(_))));

        device.clear_error();
        device.mem_alloc(&mut other).unwrap();
        device.mem_free(&mut other).unwrap();
    }

    #[test]
    fn test_failed_malloc_falls_through_to_host() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        driver.fail_next("hipMalloc", ffi::hipErrorOutOfMemory);

        let mut mem = DeviceMemory::new("retry", MemoryType::ReadWrite, 4096);
        device.mem_alloc(&mut mem).unwrap();
        assert!(mem.is_host_mapped());
        assert!(!device.have_error());
        device.mem_free(&mut mem).unwrap();
    }

    #[test]
    fn test_drop_frees_leaked_allocations() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        let mut mem = DeviceMemory::new("leak", MemoryType::ReadWrite, 64);
        device.mem_alloc(&mut mem).unwrap();
        assert_eq!(driver.live_allocations(), 1);

        drop(device);
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.live_contexts(), 0);
        // Descriptor outlived its device and no longer claims an allocation
        assert!(!mem.is_allocated());
    }

    #[test]
    fn test_memory_owned_by_other_device_rejected() {
        let driver = Arc::new(MockDriver::new());
        let a = device(&driver, config());
        let b = device(&driver, config());
        let mut mem = DeviceMemory::new("a-only", MemoryType::ReadWrite, 8);
        a.mem_alloc(&mut mem).unwrap();
        assert!(matches!(b.mem_free(&mut mem), Err(HipError::InvalidArgument(_))));
        a.mem_free(&mut mem).unwrap();
    }

    #[test]
    fn test_sub_pointer() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        let mut mem = DeviceMemory::new("buf", MemoryType::ReadWrite, 32);
        assert!(device.mem_alloc_sub_ptr(&mem, 0).is_err());
        device.mem_alloc(&mut mem).unwrap();
        assert_eq!(
            device.mem_alloc_sub_ptr(&mem, 16).unwrap(),
            mem.device_pointer().offset(16)
        );
        assert!(device.mem_alloc_sub_ptr(&mem, 33).is_err());
        device.mem_free(&mut mem).unwrap();
    }

    fn kernel_dir(image: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kernel_gfx1100.fatbin"), image).unwrap();
        dir
    }

    #[test]
    fn test_load_kernels_and_const_copy() {
        let driver = Arc::new(MockDriver::new());
        let dir = kernel_dir(b"kernel_gpu_prefix_sum\nkernel_gpu_integrator_init_from_camera\nglobal kernel_params 64\n");
        let device = device(&driver, config().with_kernel_dir(dir.path()));

        assert!(device.kernels().is_err());
        assert!(device.const_copy_to("kernel_params", &[0u8; 8]).is_err());

        device.load_kernels(&KernelFeatures::NONE).unwrap();
        assert!(device.kernel_available(DeviceKernel::PrefixSum));
        assert!(!device.kernel_available(DeviceKernel::FilterColorPreprocess));
        assert_eq!(device.kernels().unwrap().num_available(), 2);
        assert_eq!(driver.context_depth(), 0);

        // Second load is a no-op
        device.load_kernels(&KernelFeatures::NONE).unwrap();
        assert_eq!(driver.call_count("hipModuleLoadData"), 1);

        device.const_copy_to("kernel_params", &[5u8; 8]).unwrap();
        assert!(device.const_copy_to("kernel_params", &[0u8; 65]).is_err());
        assert!(device.const_copy_to("missing", &[0u8; 1]).is_err());

        drop(device);
        assert_eq!(driver.loaded_modules(), 0);
    }

    #[test]
    fn test_global_memory_publishes_pointer() {
        let driver = Arc::new(MockDriver::new());
        let dir = kernel_dir(b"kernel_gpu_prefix_sum\nglobal lookup_table 8\n");
        let device = device(&driver, config().with_kernel_dir(dir.path()));
        device.load_kernels(&KernelFeatures::NONE).unwrap();

        let mut table = DeviceMemory::new("lookup_table", MemoryType::Global, 4);
        device.mem_copy_to(&mut table, &[1, 2, 3, 4]).unwrap();
        assert_eq!(driver.call_count("hipModuleGetGlobal"), 1);
        device.mem_free(&mut table).unwrap();
    }

    #[test]
    fn test_load_kernels_reserves_local_memory() {
        let driver = Arc::new(MockDriver::new());
        let dir = kernel_dir(
            b"kernel_gpu_integrator_shade_surface\nkernel_gpu_integrator_shade_surface_raytrace\n",
        );
        let device = device(&driver, config().with_kernel_dir(dir.path()));
        driver.set_occupancy(32, 384);
        driver.set_launch_local_memory(48 * MIB);

        device.load_kernels(&KernelFeatures::NODE_RAYTRACE).unwrap();
        assert_eq!(device.local_memory_reserved(), 48 * MIB);

        let launches = driver.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].kernel, "kernel_gpu_integrator_shade_surface_raytrace");
        assert_eq!(launches[0].grid, [1, 1, 1]);
        assert_eq!(launches[0].block, [384, 1, 1]);
        assert_eq!(launches[0].num_params, 3);
        assert_eq!(driver.call_count("hipCtxSynchronize"), 1);
        assert_eq!(driver.context_depth(), 0);
    }

    #[test]
    fn test_local_memory_not_reserved_without_integrator() {
        let driver = Arc::new(MockDriver::new());
        let dir = kernel_dir(b"kernel_gpu_prefix_sum\n");
        let device = device(&driver, config().with_kernel_dir(dir.path()));
        device.load_kernels(&KernelFeatures::NONE).unwrap();
        assert_eq!(device.local_memory_reserved(), 0);
        assert!(driver.launches().is_empty());
    }

    #[test]
    fn test_peer_access() {
        let driver = Arc::new(MockDriver::new());
        driver.add_device(MockDriver::default_props("AMD Radeon PRO W7900", "gfx1100", 11, 0));
        let a = device(&driver, config());
        let b = HipDevice::new(driver.clone(), 1, config()).unwrap();

        assert!(!a.check_peer_access(&a).unwrap());
        assert!(a.check_peer_access(&b).unwrap());
        assert_eq!(driver.call_count("hipCtxEnablePeerAccess"), 2);
        assert_eq!(driver.context_depth(), 0);

        driver.set_peer_access(false);
        assert!(!a.check_peer_access(&b).unwrap());
    }

    #[test]
    fn test_synchronize_refused_with_pending_error() {
        let driver = Arc::new(MockDriver::new());
        let device = device(&driver, config());
        device.synchronize().unwrap();
        device.set_error("boom");
        assert!(matches!(device.synchronize(), Err(HipError::PendingError(_))));
    }
}
