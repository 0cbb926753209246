//! Device memory descriptors, placement policy and usage tracking
//!
//! A [`DeviceMemory`] describes a buffer; the device fills in where it lives.
//! Allocation goes to device memory while the request plus a headroom fits in
//! free memory, and otherwise falls back to pinned host memory mapped into
//! the device address space, bounded by [`map_host_limit`].
//!
//! The device may move a texture to mapped host memory to make room for
//! working memory. The descriptor and the device share its [`Residency`], so
//! the descriptor sees the new address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::ffi::{DevicePtr, HostPtr};

/// Host RAM that mapped allocations always leave free, when RAM allows
const HOST_RESERVE: u64 = 4 * 1024 * 1024 * 1024;

/// How a buffer is used by kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    ReadOnly,
    ReadWrite,
    /// Never copied to or from the host
    DeviceOnly,
    /// Module-scope kernel data
    Global,
    Texture,
}

impl MemoryType {
    /// Scene data that gets the texture headroom and may be moved to host
    pub fn is_texture(&self) -> bool {
        matches!(self, MemoryType::Texture | MemoryType::Global)
    }
}

/// Where an allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Device,
    /// Pinned, write-combined host memory mapped into the device
    MappedHost(HostPtr),
}

/// Address and placement of an allocated buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Residency {
    pub ptr: DevicePtr,
    pub placement: Option<Placement>,
    /// Id of the allocating device
    pub owner: Option<u64>,
}

type SharedResidency = Arc<Mutex<Residency>>;

/// A buffer that can be allocated on a device
///
/// Holds no reference to the device: allocate, copy and free it through
/// `HipDevice` (or a queue). A descriptor dropped while still allocated is
/// reclaimed when its device is dropped.
#[derive(Debug)]
pub struct DeviceMemory {
    name: String,
    mem_type: MemoryType,
    size: usize,
    height: usize,
    residency: SharedResidency,
}

impl DeviceMemory {
    pub fn new(name: impl Into<String>, mem_type: MemoryType, size: usize) -> Self {
        DeviceMemory {
            name: name.into(),
            mem_type,
            size,
            height: 1,
            residency: SharedResidency::default(),
        }
    }

    /// Rows of a 2D or 3D texture; image textures are moved to host first
    pub fn with_height(mut self, height: usize) -> Self {
        self.height = height.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory_type(&self) -> MemoryType {
        self.mem_type
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_image(&self) -> bool {
        self.mem_type.is_texture() && self.height > 1
    }

    /// Change the size of an unallocated buffer
    pub fn resize(&mut self, size: usize) -> HipResult<()> {
        if self.is_allocated() {
            return Err(HipError::InvalidArgument(format!(
                "cannot resize '{}' while it is allocated",
                self.name
            )));
        }
        self.size = size;
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.residency().placement.is_some()
    }

    pub fn device_pointer(&self) -> DevicePtr {
        self.residency().ptr
    }

    pub fn placement(&self) -> Option<Placement> {
        self.residency().placement
    }

    pub fn is_host_mapped(&self) -> bool {
        matches!(self.placement(), Some(Placement::MappedHost(_)))
    }

    pub(crate) fn residency(&self) -> Residency {
        *self.residency.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_residency(&self, residency: Residency) {
        *self.residency.lock().unwrap_or_else(|e| e.into_inner()) = residency;
    }

    fn downgrade(&self) -> Weak<Mutex<Residency>> {
        Arc::downgrade(&self.residency)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if self.is_allocated() {
            tracing::warn!(
                "DeviceMemory::drop: '{}' ({} bytes) dropped while allocated, freed with its device",
                self.name,
                self.size
            );
        }
    }
}

/// Device memory usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently allocated (device and mapped host)
    pub used: usize,
    /// High-water mark of `used`
    pub peak: usize,
    /// Live allocation count
    pub allocations: usize,
    /// Bytes of mapped host memory in use
    pub map_host_used: usize,
}

/// A live allocation as seen by the device
#[derive(Debug, Clone)]
pub struct LiveAllocation {
    pub name: String,
    pub size: usize,
    pub mem_type: MemoryType,
    pub image: bool,
    pub placement: Placement,
    residency: Weak<Mutex<Residency>>,
}

impl LiveAllocation {
    /// Point the descriptor, if it still exists, at a new location
    pub(crate) fn relocate(&self, residency: Residency) -> bool {
        match self.residency.upgrade() {
            Some(cell) => {
                *cell.lock().unwrap_or_else(|e| e.into_inner()) = residency;
                true
            }
            None => false,
        }
    }

    fn descriptor_alive(&self) -> bool {
        self.residency.strong_count() > 0
    }
}

/// Allocation registry and counters of one device
#[derive(Debug, Default)]
pub struct MemoryTracker {
    stats: MemoryStats,
    live: HashMap<DevicePtr, LiveAllocation>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub fn map_host_used(&self) -> usize {
        self.stats.map_host_used
    }

    pub fn record_alloc(&mut self, ptr: DevicePtr, mem: &DeviceMemory, placement: Placement) {
        self.insert(
            ptr,
            LiveAllocation {
                name: mem.name().to_string(),
                size: mem.size(),
                mem_type: mem.memory_type(),
                image: mem.is_image(),
                placement,
                residency: mem.downgrade(),
            },
        );
    }

    fn insert(&mut self, ptr: DevicePtr, allocation: LiveAllocation) {
        self.stats.used += allocation.size;
        self.stats.peak = self.stats.peak.max(self.stats.used);
        self.stats.allocations += 1;
        if matches!(allocation.placement, Placement::MappedHost(_)) {
            self.stats.map_host_used += allocation.size;
        }
        self.live.insert(ptr, allocation);
    }

    pub fn record_free(&mut self, ptr: DevicePtr) -> Option<LiveAllocation> {
        let allocation = self.live.remove(&ptr)?;
        self.stats.used = self.stats.used.saturating_sub(allocation.size);
        self.stats.allocations = self.stats.allocations.saturating_sub(1);
        if matches!(allocation.placement, Placement::MappedHost(_)) {
            self.stats.map_host_used = self.stats.map_host_used.saturating_sub(allocation.size);
        }
        Some(allocation)
    }

    /// Replace the entry at `old` with the same buffer now living at `new`
    pub(crate) fn record_move(&mut self, old: DevicePtr, new: DevicePtr, placement: Placement) -> Option<LiveAllocation> {
        let mut allocation = self.record_free(old)?;
        allocation.placement = placement;
        self.insert(new, allocation.clone());
        Some(allocation)
    }

    /// The device-resident texture to move to host memory next.
    ///
    /// Images are preferred, then the largest allocation. With
    /// `images_only`, other textures are never picked.
    pub fn eviction_candidate(&self, images_only: bool) -> Option<(DevicePtr, &LiveAllocation)> {
        self.live
            .iter()
            .filter(|(_, a)| a.placement == Placement::Device && a.mem_type.is_texture())
            .filter(|(_, a)| a.image || !images_only)
            .filter(|(_, a)| a.descriptor_alive())
            .max_by_key(|(ptr, a)| (a.image, a.size, std::cmp::Reverse(ptr.0)))
            .map(|(ptr, a)| (*ptr, a))
    }

    /// Remove and return every live allocation
    pub fn drain(&mut self) -> Vec<(DevicePtr, LiveAllocation)> {
        let drained: Vec<_> = self.live.drain().collect();
        self.stats.used = 0;
        self.stats.allocations = 0;
        self.stats.map_host_used = 0;
        drained
    }
}

/// Whether `size` bytes fit in device memory while keeping `headroom` free
pub fn fits_on_device(size: usize, headroom: usize, free: usize) -> bool {
    size.saturating_add(headroom) < free
}

/// Whether `size` more bytes of mapped host memory stay under `limit`
pub fn fits_in_mapped_host(size: usize, used: usize, limit: usize) -> bool {
    used.saturating_add(size) < limit
}

/// Limit for mapped host memory given total system RAM
///
/// Leaves at least half of RAM, or 4 GiB, free, whichever is smaller.
pub fn map_host_limit(system_ram: u64) -> usize {
    if system_ram == 0 {
        return 0;
    }
    let limit = if system_ram / 2 > HOST_RESERVE {
        system_ram - HOST_RESERVE
    } else {
        system_ram / 2
    };
    usize::try_from(limit).unwrap_or(usize::MAX)
}

/// [`map_host_limit`] for this machine; 0 disables mapped host memory
pub fn system_map_host_limit() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    let ram = sys.total_memory();
    if ram == 0 {
        tracing::warn!("Mapped host memory disabled, failed to get system RAM");
    }
    map_host_limit(ram)
}
