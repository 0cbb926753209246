//! Device queue: kernel launches and stream-ordered copies

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use crate::backend::hip_backend::backend::HipDevice;
use crate::backend::hip_backend::device_context::HipContextScope;
use crate::backend::hip_backend::error::{hip_check, HipError, HipResult};
use crate::backend::hip_backend::event::HipEvent;
use crate::backend::hip_backend::ffi::{self, DevicePtr};
use crate::backend::hip_backend::graphics_interop::HipDeviceGraphicsInterop;
use crate::backend::hip_backend::kernels::DeviceKernel;
use crate::backend::hip_backend::memory::DeviceMemory;
use crate::backend::hip_backend::stream::HipStream;

/// Integrator states per thread the device can keep resident
const STATES_PER_THREAD: usize = 16;
/// Thread count assumed when the device does not report one
const FALLBACK_MAX_THREADS: usize = 65536;
const MIN_CONCURRENT_STATES: usize = 1024;

/// Kernel launch arguments
///
/// Each argument is copied into its own 8-byte aligned slot. The launch API
/// takes an array of pointers to those slots.
#[derive(Debug, Default)]
pub struct KernelArgs {
    slots: Vec<Box<[u64]>>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a copy of `value`. The kernel parameter at this position must
    /// have the same size and layout as `T`.
    pub fn push<T: Copy + 'static>(&mut self, value: T) -> &mut Self {
        let size = std::mem::size_of::<T>();
        let words = ((size + 7) / 8).max(1);
        let mut slot = vec![0u64; words].into_boxed_slice();
        // SAFETY: the slot holds at least `size` bytes and `T: Copy` has no
        // drop glue, so a bytewise copy is a valid duplicate.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                slot.as_mut_ptr() as *mut u8,
                size,
            );
        }
        self.slots.push(slot);
        self
    }

    pub fn push_ptr(&mut self, ptr: DevicePtr) -> &mut Self {
        self.push(ptr.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Raw bytes of argument `index`
    pub fn bytes(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index).map(|slot| {
            // SAFETY: any u64 slice is valid to view as bytes
            unsafe { std::slice::from_raw_parts(slot.as_ptr() as *const u8, slot.len() * 8) }
        })
    }

    /// The `void**` array; valid while `self` is borrowed
    pub(crate) fn params(&mut self) -> Vec<*mut c_void> {
        self.slots
            .iter_mut()
            .map(|slot| slot.as_mut_ptr() as *mut c_void)
            .collect()
    }
}

/// Accumulated launch time of one kernel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KernelTiming {
    pub launches: u64,
    pub total_ms: f64,
}

/// Launch geometry of one kernel dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub num_blocks: u32,
    pub threads_per_block: u32,
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// Cover `work_size` items with blocks of `threads_per_block`
    pub fn for_work(kernel: DeviceKernel, work_size: usize, threads_per_block: u32) -> HipResult<Self> {
        if threads_per_block == 0 {
            return Err(HipError::InvalidArgument(format!(
                "kernel {} has no threads per block",
                kernel
            )));
        }
        let threads = threads_per_block as usize;
        let num_blocks = (work_size + threads - 1) / threads;
        let num_blocks = u32::try_from(num_blocks).map_err(|_| {
            HipError::InvalidArgument(format!("work size {} too large for {}", work_size, kernel))
        })?;
        let shared_mem_bytes = if kernel.uses_path_array_shared_memory() {
            (threads_per_block + 1) * 4
        } else {
            0
        };
        Ok(LaunchConfig {
            num_blocks,
            threads_per_block,
            shared_mem_bytes,
        })
    }
}

/// In-order work queue on one device stream
pub struct HipDeviceQueue {
    device: Arc<HipDevice>,
    stream: ManuallyDrop<HipStream>,
    timings: Mutex<BTreeMap<DeviceKernel, KernelTiming>>,
}

impl std::fmt::Debug for HipDeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HipDeviceQueue")
            .field("device", &self.device.ordinal())
            .field("stream", &self.stream.handle())
            .finish()
    }
}

impl HipDeviceQueue {
    /// Create a queue with its own non-blocking stream
    pub fn new(device: Arc<HipDevice>) -> HipResult<Self> {
        let stream = {
            let scope = HipContextScope::new(&device);
            scope.check()?;
            device.checked(HipStream::new(device.driver().clone(), ffi::hipStreamNonBlocking))?
        };
        Ok(HipDeviceQueue {
            device,
            stream: ManuallyDrop::new(stream),
            timings: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn device(&self) -> &Arc<HipDevice> {
        &self.device
    }

    pub fn stream(&self) -> &HipStream {
        &self.stream
    }

    /// Number of integrator states to allocate for this device
    pub fn num_concurrent_states(&self, state_size: usize) -> usize {
        let caps = self.device.capabilities();
        let max_threads = caps.compute_units.max(0) as usize
            * caps.max_threads_per_multiprocessor.max(0) as usize;
        let threads = if max_threads == 0 {
            FALLBACK_MAX_THREADS
        } else {
            max_threads
        };

        let mut num_states = threads * STATES_PER_THREAD;
        let factor = self.device.config().concurrent_states_factor;
        if factor != 1.0 {
            num_states = ((num_states as f64 * factor as f64) as usize).max(MIN_CONCURRENT_STATES);
        }

        tracing::debug!(
            "GPU queue concurrent states: {}, using up to {} bytes",
            num_states,
            num_states.saturating_mul(state_size)
        );
        num_states
    }

    /// Active states below which the queue is considered starved
    pub fn num_concurrent_busy_states(&self) -> usize {
        let caps = self.device.capabilities();
        let max_threads = caps.compute_units.max(0) as usize
            * caps.max_threads_per_multiprocessor.max(0) as usize;
        if max_threads == 0 {
            FALLBACK_MAX_THREADS
        } else {
            4 * max_threads
        }
    }

    /// Wait for pending uploads before rendering starts
    pub fn init_execution(&self) -> HipResult<()> {
        self.device.synchronize()
    }

    /// Launch `kernel` over `work_size` items.
    ///
    /// Refused while the device has a pending error or when the loaded module
    /// does not define the kernel. A zero `work_size` launches nothing.
    pub fn enqueue(&self, kernel: DeviceKernel, work_size: usize, args: &mut KernelArgs) -> HipResult<()> {
        self.device.errors().ensure_clear()?;

        let entry = *self.device.kernels()?.get(kernel).ok_or_else(|| {
            HipError::KernelUnavailable(format!("{} is not in the loaded module", kernel))
        })?;

        if work_size == 0 {
            return Ok(());
        }

        let threads = u32::try_from(entry.num_threads_per_block).unwrap_or(0);
        let launch = LaunchConfig::for_work(kernel, work_size, threads)?;
        tracing::trace!(
            "HipDeviceQueue::enqueue: {} work_size={} blocks={} threads={} shared={}",
            kernel,
            work_size,
            launch.num_blocks,
            launch.threads_per_block,
            launch.shared_mem_bytes
        );

        let scope = HipContextScope::new(&self.device);
        scope.check()?;

        let profile = self.device.config().profile_kernels;
        let start = if profile {
            Some(self.timing_event()?)
        } else {
            None
        };

        let driver = self.device.driver();
        let mut params = args.params();
        hip_check!(
            self.device.errors(),
            "hipModuleLaunchKernel",
            // SAFETY: every pointer in `params` targets a slot owned by
            // `args`, which stays borrowed until the call returns.
            unsafe {
                driver.launch_kernel(
                    entry.function,
                    [launch.num_blocks, 1, 1],
                    [launch.threads_per_block, 1, 1],
                    launch.shared_mem_bytes,
                    self.stream.handle(),
                    &mut params,
                )
            }
        );

        if let Some(start) = start {
            let end = self.timing_event()?;
            self.device.checked(end.synchronize())?;
            let elapsed = self.device.checked(end.elapsed_since(&start))?;
            let mut timings = self.timings.lock()?;
            let timing = timings.entry(kernel).or_default();
            timing.launches += 1;
            timing.total_ms += elapsed as f64;
        }

        if self.device.config().debug_sync_launch {
            hip_check!(
                self.device.errors(),
                "hipStreamSynchronize",
                driver.stream_synchronize(self.stream.handle())
            );
        }
        Ok(())
    }

    fn timing_event(&self) -> HipResult<HipEvent> {
        let event = self.device.checked(HipEvent::new(self.device.driver().clone()))?;
        self.device.checked(event.record(&self.stream))?;
        Ok(event)
    }

    /// Per-kernel launch counts and time, when kernel profiling is enabled
    pub fn kernel_timings(&self) -> Vec<(DeviceKernel, KernelTiming)> {
        match self.timings.lock() {
            Ok(timings) => timings.iter().map(|(k, t)| (*k, *t)).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(k, t)| (*k, *t)).collect(),
        }
    }

    /// Wait for all work on the queue's stream
    pub fn synchronize(&self) -> HipResult<()> {
        self.device.errors().ensure_clear()?;
        let scope = HipContextScope::new(&self.device);
        scope.check()?;
        self.device.checked(self.stream.synchronize())
    }

    /// Zero `mem` on the stream, allocating it first if needed
    pub fn zero_to_device(&self, mem: &mut DeviceMemory) -> HipResult<()> {
        if mem.size() == 0 {
            return Ok(());
        }
        if !mem.is_allocated() {
            self.device.mem_alloc(mem)?;
        }
        let scope = HipContextScope::new(&self.device);
        scope.check()?;
        hip_check!(
            self.device.errors(),
            "hipMemsetD8Async",
            self.device
                .driver()
                .memset_d8_async(mem.device_pointer(), 0, mem.size(), self.stream.handle())
        );
        Ok(())
    }

    /// Upload `data` to the start of `mem`, allocating it first if needed.
    ///
    /// Ordered after earlier work on the stream; returns once the copy has
    /// completed.
    pub fn copy_to_device(&self, mem: &mut DeviceMemory, data: &[u8]) -> HipResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > mem.size() {
            return Err(HipError::InvalidArgument(format!(
                "{} bytes do not fit in '{}' ({} bytes)",
                data.len(),
                mem.name(),
                mem.size()
            )));
        }
        if !mem.is_allocated() {
            self.device.mem_alloc(mem)?;
        }

        let scope = HipContextScope::new(&self.device);
        scope.check()?;
        let driver = self.device.driver();
        hip_check!(
            self.device.errors(),
            "hipMemcpyHtoDAsync",
            // SAFETY: the stream is synchronized below, before `data` is released
            unsafe { driver.memcpy_htod_async(mem.device_pointer(), data, self.stream.handle()) }
        );
        self.device.checked(self.stream.synchronize())
    }

    /// Download the start of `mem` into `out`, ordered after earlier work
    pub fn copy_from_device(&self, mem: &DeviceMemory, out: &mut [u8]) -> HipResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        if !mem.is_allocated() {
            return Err(HipError::InvalidArgument(format!(
                "'{}' is not allocated",
                mem.name()
            )));
        }
        if out.len() > mem.size() {
            return Err(HipError::InvalidArgument(format!(
                "read of {} bytes exceeds '{}' ({} bytes)",
                out.len(),
                mem.name(),
                mem.size()
            )));
        }

        let scope = HipContextScope::new(&self.device);
        scope.check()?;
        let driver = self.device.driver();
        hip_check!(
            self.device.errors(),
            "hipMemcpyDtoHAsync",
            // SAFETY: `out` is not read before the stream is synchronized below
            unsafe { driver.memcpy_dtoh_async(out, mem.device_pointer(), self.stream.handle()) }
        );
        self.device.checked(self.stream.synchronize())
    }

    /// Interop object for sharing a display buffer with this queue
    pub fn graphics_interop_create(&self) -> HipResult<HipDeviceGraphicsInterop<'_>> {
        if self.device.config().background {
            return Err(HipError::InteropState(
                "graphics interop is not available for background rendering".to_string(),
            ));
        }
        Ok(HipDeviceGraphicsInterop::new(self))
    }
}

impl Drop for HipDeviceQueue {
    fn drop(&mut self) {
        if self.device.config().profile_kernels {
            for (kernel, timing) in self.kernel_timings() {
                tracing::info!(
                    "{}: {} launches, {:.3} ms",
                    kernel,
                    timing.launches,
                    timing.total_ms
                );
            }
        }

        let _scope = HipContextScope::new(&self.device);
        // SAFETY: the stream is dropped exactly once, here
        unsafe { ManuallyDrop::drop(&mut self.stream) };
    }
}
