//! In-memory [`HipDriver`] for tests
//!
//! Behaves like a single-process HIP runtime closely enough to exercise the
//! device layer without a GPU:
//!
//! - contexts are tracked on per-thread stacks, and creating resources
//!   requires a current context
//! - device allocations are real byte buffers with a configurable free budget
//! - a module image is UTF-8 text listing one kernel name per line; a line
//!   `global <name> <bytes>` declares a module global
//! - `fail_next(call, code)` makes the next call to that entry point fail once

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::backend::hip_backend::device::HipDeviceProp;
use crate::backend::hip_backend::driver::{DriverResult, HipDriver};
use crate::backend::hip_backend::ffi::{self, *};

const DEVICE_BASE: u64 = 0x7f00_0000_0000;
const ALLOC_ALIGN: u64 = 256;
const DEFAULT_MEMORY: usize = 1 << 30;
const DEFAULT_GL_BUFFER_SIZE: usize = 1 << 20;

/// One recorded kernel launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
    pub stream: HipStreamHandle,
    pub num_params: usize,
}

#[derive(Debug)]
struct MockModule {
    kernels: Vec<String>,
    globals: HashMap<String, (DevicePtr, usize)>,
}

#[derive(Debug)]
struct MockResource {
    pbo: u32,
    storage: DevicePtr,
    size: usize,
    mapped: bool,
}

#[derive(Debug)]
struct MockAllocation {
    bytes: Vec<u8>,
    /// Counted against the device memory budget
    device: bool,
}

#[derive(Debug)]
struct MockState {
    driver_version: i32,
    devices: Vec<HipDeviceProp>,
    contexts: HashMap<usize, i32>,
    stacks: HashMap<ThreadId, Vec<HipContextHandle>>,
    next_handle: usize,

    allocations: BTreeMap<u64, MockAllocation>,
    next_address: u64,
    total_memory: usize,
    free_memory: usize,
    /// Taken from free memory by the first kernel launch
    launch_local_memory: usize,
    host_allocations: HashMap<usize, DevicePtr>,

    modules: HashMap<usize, MockModule>,
    functions: HashMap<usize, String>,
    cache_configs: HashMap<usize, i32>,
    occupancy: (i32, i32),

    streams: Vec<HipStreamHandle>,
    events: HashMap<usize, Option<u64>>,
    clock: u64,

    gl_buffer_sizes: HashMap<u32, usize>,
    resources: HashMap<usize, MockResource>,

    peer_access: bool,
    fail_next: HashMap<String, hipError_t>,
    calls: Vec<String>,
    launches: Vec<LaunchRecord>,
}

impl MockState {
    fn handle(&mut self) -> usize {
        self.next_handle += 0x10;
        self.next_handle
    }

    fn stack(&mut self) -> &mut Vec<HipContextHandle> {
        self.stacks.entry(thread::current().id()).or_default()
    }

    fn current(&mut self) -> HipContextHandle {
        self.stack().last().copied().unwrap_or_default()
    }

    fn require_context(&mut self) -> DriverResult<()> {
        let current = self.current();
        if current.is_null() || !self.contexts.contains_key(&(current.as_raw() as usize)) {
            return Err(ffi::hipErrorInvalidContext);
        }
        Ok(())
    }

    fn allocate(&mut self, size: usize, device: bool) -> DriverResult<DevicePtr> {
        if device {
            if size > self.free_memory {
                return Err(ffi::hipErrorOutOfMemory);
            }
            self.free_memory -= size;
        }
        let address = self.next_address;
        let span = (size.max(1) as u64 + ALLOC_ALIGN - 1) / ALLOC_ALIGN * ALLOC_ALIGN;
        self.next_address += span + ALLOC_ALIGN;
        self.allocations.insert(
            address,
            MockAllocation {
                bytes: vec![0u8; size],
                device,
            },
        );
        Ok(DevicePtr(address))
    }

    fn release(&mut self, ptr: DevicePtr) -> DriverResult<()> {
        let allocation = self
            .allocations
            .remove(&ptr.0)
            .ok_or(ffi::hipErrorInvalidDevicePointer)?;
        if allocation.device {
            self.free_memory += allocation.bytes.len();
        }
        Ok(())
    }

    /// Byte range `[ptr, ptr + len)` inside one allocation
    fn range_mut(&mut self, ptr: DevicePtr, len: usize) -> DriverResult<&mut [u8]> {
        let (base, allocation) = self
            .allocations
            .range_mut(..=ptr.0)
            .next_back()
            .ok_or(ffi::hipErrorInvalidDevicePointer)?;
        let start = (ptr.0 - *base) as usize;
        let end = start.checked_add(len).ok_or(ffi::hipErrorInvalidValue)?;
        if end > allocation.bytes.len() {
            return Err(ffi::hipErrorInvalidValue);
        }
        Ok(&mut allocation.bytes[start..end])
    }

    fn check_stream(&self, stream: HipStreamHandle) -> DriverResult<()> {
        if stream.is_null() || self.streams.contains(&stream) {
            Ok(())
        } else {
            Err(ffi::hipErrorInvalidHandle)
        }
    }
}

/// Test double implementing the full [`HipDriver`] surface in memory
#[derive(Debug)]
pub struct MockDriver {
    state: Mutex<MockState>,
    live: Option<Arc<AtomicUsize>>,
}

impl MockDriver {
    /// Driver with one supported device (gfx1100, 48 CUs) and 1 GiB of memory
    pub fn new() -> Self {
        MockDriver {
            state: Mutex::new(MockState {
                driver_version: 60_140_000,
                devices: vec![Self::default_props("AMD Radeon RX 7900 XTX", "gfx1100", 11, 0)],
                contexts: HashMap::new(),
                stacks: HashMap::new(),
                next_handle: 0x1000,
                allocations: BTreeMap::new(),
                next_address: DEVICE_BASE,
                total_memory: DEFAULT_MEMORY,
                free_memory: DEFAULT_MEMORY,
                launch_local_memory: 0,
                host_allocations: HashMap::new(),
                modules: HashMap::new(),
                functions: HashMap::new(),
                cache_configs: HashMap::new(),
                occupancy: (96, 256),
                streams: Vec::new(),
                events: HashMap::new(),
                clock: 0,
                gl_buffer_sizes: HashMap::new(),
                resources: HashMap::new(),
                peer_access: true,
                fail_next: HashMap::new(),
                calls: Vec::new(),
                launches: Vec::new(),
            }),
            live: None,
        }
    }

    /// Driver that increments `counter` while it is alive
    pub fn with_live_counter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut driver = Self::new();
        driver.live = Some(counter);
        driver
    }

    /// Properties of a plausible device
    pub fn default_props(name: &str, arch: &str, major: i32, minor: i32) -> HipDeviceProp {
        let mut props = HipDeviceProp::default();
        props
            .set_name(name)
            .set_gcn_arch_name(arch)
            .set_compute_capability(major, minor)
            .set_total_global_mem(DEFAULT_MEMORY as u64)
            .set_warp_size(32)
            .set_max_threads_per_block(1024)
            .set_multi_processor_count(48)
            .set_max_threads_per_multiprocessor(2048)
            .set_can_map_host_memory(true)
            .set_texture_pitch_alignment(256);
        props
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log the call and consume a pending injected failure
    fn enter(&self, call: &str) -> DriverResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(call.to_string());
        match state.fail_next.remove(call) {
            Some(code) => Err(code),
            None => Ok(state),
        }
    }

    // Configuration

    pub fn set_driver_version(&self, version: i32) {
        self.lock().driver_version = version;
    }

    /// Add a device; returns its ordinal
    pub fn add_device(&self, props: HipDeviceProp) -> i32 {
        let mut state = self.lock();
        state.devices.push(props);
        state.devices.len() as i32 - 1
    }

    pub fn set_device_props(&self, ordinal: i32, props: HipDeviceProp) {
        if let Some(slot) = self.lock().devices.get_mut(ordinal as usize) {
            *slot = props;
        }
    }

    pub fn remove_all_devices(&self) {
        self.lock().devices.clear();
    }

    /// Set both the total and the currently free device memory
    pub fn set_memory(&self, total: usize, free: usize) {
        let mut state = self.lock();
        state.total_memory = total;
        state.free_memory = free;
    }

    /// Device memory the first kernel launch takes for local memory
    pub fn set_launch_local_memory(&self, bytes: usize) {
        self.lock().launch_local_memory = bytes;
    }

    pub fn set_occupancy(&self, min_grid: i32, block_size: i32) {
        self.lock().occupancy = (min_grid, block_size);
    }

    pub fn set_peer_access(&self, allowed: bool) {
        self.lock().peer_access = allowed;
    }

    pub fn set_gl_buffer_size(&self, pbo: u32, bytes: usize) {
        self.lock().gl_buffer_sizes.insert(pbo, bytes);
    }

    /// Fail the next call to `call` (a HIP symbol name) with `code`
    pub fn fail_next(&self, call: &str, code: hipError_t) {
        self.lock().fail_next.insert(call.to_string(), code);
    }

    // Inspection

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == call).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().launches.clone()
    }

    /// Current context of the calling thread (null when none)
    pub fn current_context(&self) -> HipContextHandle {
        self.lock().current()
    }

    pub fn context_depth(&self) -> usize {
        self.lock().stack().len()
    }

    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Device allocations still outstanding
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.values().filter(|a| a.device).count()
    }

    pub fn live_host_allocations(&self) -> usize {
        self.lock().host_allocations.len()
    }

    pub fn free_memory(&self) -> usize {
        self.lock().free_memory
    }

    pub fn loaded_modules(&self) -> usize {
        self.lock().modules.len()
    }

    pub fn live_streams(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn live_events(&self) -> usize {
        self.lock().events.len()
    }

    pub fn registered_resources(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn mapped_resources(&self) -> usize {
        self.lock().resources.values().filter(|r| r.mapped).count()
    }

    pub fn cache_config(&self, function: HipFunctionHandle) -> Option<i32> {
        self.lock().cache_configs.get(&(function.as_raw() as usize)).copied()
    }

    /// Copy of device bytes `[ptr, ptr + len)`
    pub fn read_device(&self, ptr: DevicePtr, len: usize) -> Option<Vec<u8>> {
        self.lock().range_mut(ptr, len).ok().map(|bytes| bytes.to_vec())
    }

    pub fn write_device(&self, ptr: DevicePtr, data: &[u8]) -> bool {
        match self.lock().range_mut(ptr, data.len()) {
            Ok(bytes) => {
                bytes.copy_from_slice(data);
                true
            }
            Err(_) => false,
        }
    }

    /// Build a module image from kernel symbol names
    pub fn module_image<S: AsRef<str>>(symbols: &[S]) -> Vec<u8> {
        let mut image = String::new();
        for symbol in symbols {
            image.push_str(symbol.as_ref());
            image.push('\n');
        }
        image.into_bytes()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl HipDriver for MockDriver {
    fn init(&self, _flags: u32) -> DriverResult<()> {
        self.enter("hipInit")?;
        Ok(())
    }

    fn driver_version(&self) -> DriverResult<i32> {
        Ok(self.enter("hipDriverGetVersion")?.driver_version)
    }

    fn device_count(&self) -> DriverResult<i32> {
        Ok(self.enter("hipGetDeviceCount")?.devices.len() as i32)
    }

    fn device_get(&self, ordinal: i32) -> DriverResult<HipDeviceHandle> {
        let state = self.enter("hipDeviceGet")?;
        if ordinal < 0 || ordinal as usize >= state.devices.len() {
            return Err(ffi::hipErrorInvalidDevice);
        }
        Ok(HipDeviceHandle(ordinal))
    }

    fn device_properties(&self, ordinal: i32) -> DriverResult<HipDeviceProp> {
        let state = self.enter("hipGetDevicePropertiesR0600")?;
        state
            .devices
            .get(ordinal as usize)
            .cloned()
            .ok_or(ffi::hipErrorInvalidDevice)
    }

    fn device_can_access_peer(&self, device: i32, peer: i32) -> DriverResult<bool> {
        let state = self.enter("hipDeviceCanAccessPeer")?;
        let count = state.devices.len() as i32;
        if device < 0 || peer < 0 || device >= count || peer >= count {
            return Err(ffi::hipErrorInvalidDevice);
        }
        Ok(state.peer_access && device != peer)
    }

    fn ctx_create(&self, _flags: u32, device: HipDeviceHandle) -> DriverResult<HipContextHandle> {
        let mut state = self.enter("hipCtxCreate")?;
        if device.0 < 0 || device.0 as usize >= state.devices.len() {
            return Err(ffi::hipErrorInvalidDevice);
        }
        let raw = state.handle();
        state.contexts.insert(raw, device.0);
        let ctx = HipContextHandle::from_raw(raw as *mut c_void);
        // A new context becomes current on the creating thread.
        state.stack().push(ctx);
        Ok(ctx)
    }

    fn ctx_destroy(&self, ctx: HipContextHandle) -> DriverResult<()> {
        let mut state = self.enter("hipCtxDestroy")?;
        state
            .contexts
            .remove(&(ctx.as_raw() as usize))
            .map(|_| ())
            .ok_or(ffi::hipErrorInvalidContext)
    }

    fn ctx_push_current(&self, ctx: HipContextHandle) -> DriverResult<()> {
        let mut state = self.enter("hipCtxPushCurrent")?;
        if !state.contexts.contains_key(&(ctx.as_raw() as usize)) {
            return Err(ffi::hipErrorInvalidContext);
        }
        state.stack().push(ctx);
        Ok(())
    }

    fn ctx_pop_current(&self) -> DriverResult<HipContextHandle> {
        let mut state = self.enter("hipCtxPopCurrent")?;
        state.stack().pop().ok_or(ffi::hipErrorInvalidContext)
    }

    fn ctx_get_current(&self) -> DriverResult<HipContextHandle> {
        let mut state = self.enter("hipCtxGetCurrent")?;
        Ok(state.current())
    }

    fn ctx_synchronize(&self) -> DriverResult<()> {
        self.enter("hipCtxSynchronize")?.require_context()
    }

    fn ctx_enable_peer_access(&self, peer: HipContextHandle) -> DriverResult<()> {
        let mut state = self.enter("hipCtxEnablePeerAccess")?;
        state.require_context()?;
        if !state.contexts.contains_key(&(peer.as_raw() as usize)) {
            return Err(ffi::hipErrorInvalidContext);
        }
        Ok(())
    }

    fn module_load_data(&self, image: &[u8]) -> DriverResult<HipModuleHandle> {
        let mut state = self.enter("hipModuleLoadData")?;
        state.require_context()?;

        let text = std::str::from_utf8(image).map_err(|_| ffi::hipErrorInvalidImage)?;
        let mut kernels = Vec::new();
        let mut declared_globals = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("global"), Some(name), Some(size)) => {
                    let size: usize = size.parse().map_err(|_| ffi::hipErrorInvalidImage)?;
                    declared_globals.push((name.to_string(), size));
                }
                (Some(kernel), None, None) => kernels.push(kernel.to_string()),
                _ => return Err(ffi::hipErrorInvalidImage),
            }
        }
        if kernels.is_empty() && declared_globals.is_empty() {
            return Err(ffi::hipErrorInvalidImage);
        }

        let mut globals = HashMap::new();
        for (name, size) in declared_globals {
            let ptr = state.allocate(size, false)?;
            globals.insert(name, (ptr, size));
        }

        let raw = state.handle();
        state.modules.insert(raw, MockModule { kernels, globals });
        Ok(HipModuleHandle::from_raw(raw as *mut c_void))
    }

    fn module_unload(&self, module: HipModuleHandle) -> DriverResult<()> {
        let mut state = self.enter("hipModuleUnload")?;
        let removed = state
            .modules
            .remove(&(module.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?;
        for (ptr, _) in removed.globals.values() {
            let _ = state.release(*ptr);
        }
        Ok(())
    }

    fn module_get_function(&self, module: HipModuleHandle, name: &str) -> DriverResult<HipFunctionHandle> {
        let mut state = self.enter("hipModuleGetFunction")?;
        let found = state
            .modules
            .get(&(module.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?
            .kernels
            .iter()
            .any(|k| k == name);
        if !found {
            return Err(ffi::hipErrorNotFound);
        }
        let raw = state.handle();
        state.functions.insert(raw, name.to_string());
        Ok(HipFunctionHandle::from_raw(raw as *mut c_void))
    }

    fn module_get_global(&self, module: HipModuleHandle, name: &str) -> DriverResult<(DevicePtr, usize)> {
        let state = self.enter("hipModuleGetGlobal")?;
        state
            .modules
            .get(&(module.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?
            .globals
            .get(name)
            .copied()
            .ok_or(ffi::hipErrorNotFound)
    }

    fn func_set_cache_config(&self, function: HipFunctionHandle, config: i32) -> DriverResult<()> {
        let mut state = self.enter("hipFuncSetCacheConfig")?;
        let key = function.as_raw() as usize;
        if !state.functions.contains_key(&key) {
            return Err(ffi::hipErrorInvalidDeviceFunction);
        }
        state.cache_configs.insert(key, config);
        Ok(())
    }

    fn occupancy_max_potential_block_size(
        &self,
        function: HipFunctionHandle,
        _dynamic_shared_mem: usize,
        block_size_limit: i32,
    ) -> DriverResult<(i32, i32)> {
        let state = self.enter("hipModuleOccupancyMaxPotentialBlockSize")?;
        if !state.functions.contains_key(&(function.as_raw() as usize)) {
            return Err(ffi::hipErrorInvalidDeviceFunction);
        }
        let (grid, mut block) = state.occupancy;
        if block_size_limit > 0 {
            block = block.min(block_size_limit);
        }
        Ok((grid, block))
    }

    fn mem_get_info(&self) -> DriverResult<(usize, usize)> {
        let mut state = self.enter("hipMemGetInfo")?;
        state.require_context()?;
        Ok((state.free_memory, state.total_memory))
    }

    fn mem_alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        let mut state = self.enter("hipMalloc")?;
        state.require_context()?;
        state.allocate(size, true)
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        self.enter("hipFree")?.release(ptr)
    }

    fn host_alloc(&self, size: usize, _flags: u32) -> DriverResult<HostPtr> {
        let mut state = self.enter("hipHostMalloc")?;
        state.require_context()?;
        let device = state.allocate(size, false)?;
        let host = state.handle();
        state.host_allocations.insert(host, device);
        Ok(HostPtr(host))
    }

    fn host_free(&self, ptr: HostPtr) -> DriverResult<()> {
        let mut state = self.enter("hipHostFree")?;
        let device = state
            .host_allocations
            .remove(&ptr.0)
            .ok_or(ffi::hipErrorInvalidValue)?;
        state.release(device)
    }

    fn host_get_device_pointer(&self, ptr: HostPtr) -> DriverResult<DevicePtr> {
        let state = self.enter("hipHostGetDevicePointer")?;
        state
            .host_allocations
            .get(&ptr.0)
            .copied()
            .ok_or(ffi::hipErrorInvalidValue)
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        let mut state = self.enter("hipMemcpyHtoD")?;
        state.range_mut(dst, src.len())?.copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        let mut state = self.enter("hipMemcpyDtoH")?;
        dst.copy_from_slice(state.range_mut(src, dst.len())?);
        Ok(())
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        let mut state = self.enter("hipMemcpyDtoD")?;
        let data = state.range_mut(src, bytes)?.to_vec();
        state.range_mut(dst, bytes)?.copy_from_slice(&data);
        Ok(())
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        let mut state = self.enter("hipMemsetD8")?;
        state.range_mut(dst, count)?.fill(value);
        Ok(())
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: HipStreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.enter("hipMemcpyHtoDAsync")?;
        state.check_stream(stream)?;
        state.range_mut(dst, src.len())?.copy_from_slice(src);
        Ok(())
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: HipStreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.enter("hipMemcpyDtoHAsync")?;
        state.check_stream(stream)?;
        dst.copy_from_slice(state.range_mut(src, dst.len())?);
        Ok(())
    }

    fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: HipStreamHandle,
    ) -> DriverResult<()> {
        let mut state = self.enter("hipMemsetD8Async")?;
        state.check_stream(stream)?;
        state.range_mut(dst, count)?.fill(value);
        Ok(())
    }

    fn stream_create(&self, _flags: u32) -> DriverResult<HipStreamHandle> {
        let mut state = self.enter("hipStreamCreateWithFlags")?;
        state.require_context()?;
        let stream = HipStreamHandle::from_raw(state.handle() as *mut c_void);
        state.streams.push(stream);
        Ok(stream)
    }

    fn stream_destroy(&self, stream: HipStreamHandle) -> DriverResult<()> {
        let mut state = self.enter("hipStreamDestroy")?;
        let before = state.streams.len();
        state.streams.retain(|s| *s != stream);
        if state.streams.len() == before {
            return Err(ffi::hipErrorInvalidHandle);
        }
        Ok(())
    }

    fn stream_synchronize(&self, stream: HipStreamHandle) -> DriverResult<()> {
        self.enter("hipStreamSynchronize")?.check_stream(stream)
    }

    fn stream_query(&self, stream: HipStreamHandle) -> DriverResult<bool> {
        self.enter("hipStreamQuery")?.check_stream(stream)?;
        Ok(true)
    }

    fn event_create(&self, _flags: u32) -> DriverResult<HipEventHandle> {
        let mut state = self.enter("hipEventCreateWithFlags")?;
        let raw = state.handle();
        state.events.insert(raw, None);
        Ok(HipEventHandle::from_raw(raw as *mut c_void))
    }

    fn event_destroy(&self, event: HipEventHandle) -> DriverResult<()> {
        let mut state = self.enter("hipEventDestroy")?;
        state
            .events
            .remove(&(event.as_raw() as usize))
            .map(|_| ())
            .ok_or(ffi::hipErrorInvalidHandle)
    }

    fn event_record(&self, event: HipEventHandle, stream: HipStreamHandle) -> DriverResult<()> {
        let mut state = self.enter("hipEventRecord")?;
        state.check_stream(stream)?;
        state.clock += 1;
        let now = state.clock;
        match state.events.get_mut(&(event.as_raw() as usize)) {
            Some(stamp) => {
                *stamp = Some(now);
                Ok(())
            }
            None => Err(ffi::hipErrorInvalidHandle),
        }
    }

    fn event_synchronize(&self, event: HipEventHandle) -> DriverResult<()> {
        let state = self.enter("hipEventSynchronize")?;
        if state.events.contains_key(&(event.as_raw() as usize)) {
            Ok(())
        } else {
            Err(ffi::hipErrorInvalidHandle)
        }
    }

    /// Each recorded event advances a virtual clock by 0.5 ms
    fn event_elapsed_time(&self, start: HipEventHandle, end: HipEventHandle) -> DriverResult<f32> {
        let state = self.enter("hipEventElapsedTime")?;
        let stamp = |e: HipEventHandle| -> DriverResult<u64> {
            state
                .events
                .get(&(e.as_raw() as usize))
                .copied()
                .ok_or(ffi::hipErrorInvalidHandle)?
                .ok_or(ffi::hipErrorNotReady)
        };
        let (t0, t1) = (stamp(start)?, stamp(end)?);
        Ok(t1.saturating_sub(t0) as f32 * 0.5)
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
        let mut state = self.enter("hipModuleLaunchKernel")?;
        state.require_context()?;
        state.check_stream(stream)?;
        let kernel = state
            .functions
            .get(&(function.as_raw() as usize))
            .cloned()
            .ok_or(ffi::hipErrorInvalidDeviceFunction)?;
        let threads: u64 = block.iter().map(|&b| b as u64).product();
        if threads == 0 || threads > 1024 || grid.iter().any(|&g| g == 0) {
            return Err(ffi::hipErrorInvalidConfiguration);
        }
        if params.iter().any(|p| p.is_null()) {
            return Err(ffi::hipErrorInvalidValue);
        }
        let local = std::mem::take(&mut state.launch_local_memory).min(state.free_memory);
        state.free_memory -= local;
        state.launches.push(LaunchRecord {
            kernel,
            grid,
            block,
            shared_mem_bytes,
            stream,
            num_params: params.len(),
        });
        Ok(())
    }

    fn graphics_gl_register_buffer(&self, buffer: u32, _flags: u32) -> DriverResult<HipGraphicsResource> {
        let mut state = self.enter("hipGraphicsGLRegisterBuffer")?;
        state.require_context()?;
        if buffer == 0 {
            return Err(ffi::hipErrorInvalidValue);
        }
        let size = state
            .gl_buffer_sizes
            .get(&buffer)
            .copied()
            .unwrap_or(DEFAULT_GL_BUFFER_SIZE);
        let storage = state.allocate(size, false)?;
        let raw = state.handle();
        state.resources.insert(
            raw,
            MockResource {
                pbo: buffer,
                storage,
                size,
                mapped: false,
            },
        );
        Ok(HipGraphicsResource::from_raw(raw as *mut c_void))
    }

    fn graphics_unregister_resource(&self, resource: HipGraphicsResource) -> DriverResult<()> {
        let mut state = self.enter("hipGraphicsUnregisterResource")?;
        let removed = state
            .resources
            .remove(&(resource.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?;
        state.release(removed.storage)
    }

    fn graphics_map_resource(&self, resource: HipGraphicsResource, stream: HipStreamHandle) -> DriverResult<()> {
        let mut state = self.enter("hipGraphicsMapResources")?;
        state.check_stream(stream)?;
        let entry = state
            .resources
            .get_mut(&(resource.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?;
        if entry.mapped {
            return Err(ffi::hipErrorAlreadyMapped);
        }
        entry.mapped = true;
        Ok(())
    }

    fn graphics_unmap_resource(&self, resource: HipGraphicsResource, stream: HipStreamHandle) -> DriverResult<()> {
        let mut state = self.enter("hipGraphicsUnmapResources")?;
        state.check_stream(stream)?;
        let entry = state
            .resources
            .get_mut(&(resource.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?;
        if !entry.mapped {
            return Err(ffi::hipErrorNotMapped);
        }
        entry.mapped = false;
        Ok(())
    }

    fn graphics_mapped_pointer(&self, resource: HipGraphicsResource) -> DriverResult<(DevicePtr, usize)> {
        let state = self.enter("hipGraphicsResourceGetMappedPointer")?;
        let entry = state
            .resources
            .get(&(resource.as_raw() as usize))
            .ok_or(ffi::hipErrorInvalidHandle)?;
        if !entry.mapped {
            return Err(ffi::hipErrorNotMapped);
        }
        tracing::trace!("mock: pbo {} mapped at {:#x}", entry.pbo, entry.storage);
        Ok((entry.storage, entry.size))
    }
}
