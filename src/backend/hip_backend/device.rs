//! HIP device properties, capabilities and enumeration

use serde::Serialize;

use crate::backend::hip_backend::driver::HipDriver;
use crate::backend::hip_backend::ffi::HIP_DEVICE_PROP_SIZE;
use crate::backend::hip_backend::hipew::{self, HipewStatus};

// Opaque buffer for hipDeviceProp_tR0600. It MUST be exactly the C size: the
// driver writes the whole struct, so a shorter buffer is a heap overrun.
//
// Fields are read at fixed offsets instead of mirroring the full C layout.
//   name[256]                     0
//   uuid, luid, luidDeviceNodeMask, padding
//   totalGlobalMem              288  (size_t)
//   sharedMemPerBlock           296  (size_t)
//   regsPerBlock                304
//   warpSize                    308
//   memPitch                    312  (size_t)
//   maxThreadsPerBlock          320
//   maxThreadsDim[3]            324
//   maxGridSize[3]              336
//   clockRate, totalConstMem    348, 352
//   major, minor                360, 364
//   textureAlignment            368  (size_t)
//   texturePitchAlignment       376  (size_t)
//   deviceOverlap, multiProcessorCount  384, 388
//   kernelExecTimeoutEnabled, integrated, canMapHostMemory  392, 396, 400
//   maxThreadsPerMultiProcessor 624
//   gcnArchName[256]           1160
#[repr(C)]
#[derive(Clone)]
pub struct HipDeviceProp {
    buffer: [u8; HIP_DEVICE_PROP_SIZE],
}

impl HipDeviceProp {
    const NAME_OFFSET: usize = 0;
    const TOTAL_GLOBAL_MEM_OFFSET: usize = 288;
    const SHARED_MEM_PER_BLOCK_OFFSET: usize = 296;
    const WARP_SIZE_OFFSET: usize = 308;
    const MAX_THREADS_PER_BLOCK_OFFSET: usize = 320;
    const MAX_THREADS_DIM_OFFSET: usize = 324;
    const MAX_GRID_SIZE_OFFSET: usize = 336;
    const MAJOR_OFFSET: usize = 360;
    const MINOR_OFFSET: usize = 364;
    const TEXTURE_PITCH_ALIGNMENT_OFFSET: usize = 376;
    const MULTI_PROCESSOR_COUNT_OFFSET: usize = 388;
    const CAN_MAP_HOST_MEMORY_OFFSET: usize = 400;
    const MAX_THREADS_PER_MULTIPROCESSOR_OFFSET: usize = 624;
    const GCN_ARCH_NAME_OFFSET: usize = 1160;
    const STRING_LEN: usize = 256;

    /// Pointer handed to `hipGetDevicePropertiesR0600`
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buffer.as_mut_ptr()
    }

    fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buffer[offset..offset + 4]);
        i32::from_ne_bytes(bytes)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buffer[offset..offset + 8]);
        u64::from_ne_bytes(bytes)
    }

    fn read_str(&self, offset: usize) -> String {
        let bytes = &self.buffer[offset..offset + Self::STRING_LEN];
        let len = bytes.iter().position(|&c| c == 0).unwrap_or(Self::STRING_LEN);
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.buffer[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_str(&mut self, offset: usize, value: &str) {
        let field = &mut self.buffer[offset..offset + Self::STRING_LEN];
        field.fill(0);
        let len = value.len().min(Self::STRING_LEN - 1);
        field[..len].copy_from_slice(&value.as_bytes()[..len]);
    }

    /// Marketing name, e.g. "AMD Radeon RX 7900 XTX"
    pub fn name(&self) -> String {
        self.read_str(Self::NAME_OFFSET)
    }

    /// Full architecture string, e.g. "gfx1100" or "gfx90a:sramecc+:xnack-"
    pub fn gcn_arch_name(&self) -> String {
        self.read_str(Self::GCN_ARCH_NAME_OFFSET)
    }

    pub fn total_global_mem(&self) -> u64 {
        self.read_u64(Self::TOTAL_GLOBAL_MEM_OFFSET)
    }

    pub fn shared_mem_per_block(&self) -> usize {
        self.read_u64(Self::SHARED_MEM_PER_BLOCK_OFFSET) as usize
    }

    /// Wavefront size: 32 on RDNA, 64 on GCN/CDNA
    pub fn warp_size(&self) -> i32 {
        self.read_i32(Self::WARP_SIZE_OFFSET)
    }

    pub fn max_threads_per_block(&self) -> i32 {
        self.read_i32(Self::MAX_THREADS_PER_BLOCK_OFFSET)
    }

    pub fn max_threads_dim(&self) -> [i32; 3] {
        let base = Self::MAX_THREADS_DIM_OFFSET;
        [self.read_i32(base), self.read_i32(base + 4), self.read_i32(base + 8)]
    }

    pub fn max_grid_size(&self) -> [i32; 3] {
        let base = Self::MAX_GRID_SIZE_OFFSET;
        [self.read_i32(base), self.read_i32(base + 4), self.read_i32(base + 8)]
    }

    pub fn major(&self) -> i32 {
        self.read_i32(Self::MAJOR_OFFSET)
    }

    pub fn minor(&self) -> i32 {
        self.read_i32(Self::MINOR_OFFSET)
    }

    pub fn texture_pitch_alignment(&self) -> usize {
        self.read_u64(Self::TEXTURE_PITCH_ALIGNMENT_OFFSET) as usize
    }

    /// Number of compute units
    pub fn multi_processor_count(&self) -> i32 {
        self.read_i32(Self::MULTI_PROCESSOR_COUNT_OFFSET)
    }

    pub fn can_map_host_memory(&self) -> bool {
        self.read_i32(Self::CAN_MAP_HOST_MEMORY_OFFSET) != 0
    }

    pub fn max_threads_per_multiprocessor(&self) -> i32 {
        self.read_i32(Self::MAX_THREADS_PER_MULTIPROCESSOR_OFFSET)
    }

    // Setters are used to describe synthetic devices for the mock driver.

    pub fn set_name(&mut self, name: &str) -> &mut Self {
        self.write_str(Self::NAME_OFFSET, name);
        self
    }

    pub fn set_gcn_arch_name(&mut self, arch: &str) -> &mut Self {
        self.write_str(Self::GCN_ARCH_NAME_OFFSET, arch);
        self
    }

    pub fn set_compute_capability(&mut self, major: i32, minor: i32) -> &mut Self {
        self.write_i32(Self::MAJOR_OFFSET, major);
        self.write_i32(Self::MINOR_OFFSET, minor);
        self
    }

    pub fn set_total_global_mem(&mut self, bytes: u64) -> &mut Self {
        self.write_u64(Self::TOTAL_GLOBAL_MEM_OFFSET, bytes);
        self
    }

    pub fn set_warp_size(&mut self, size: i32) -> &mut Self {
        self.write_i32(Self::WARP_SIZE_OFFSET, size);
        self
    }

    pub fn set_max_threads_per_block(&mut self, threads: i32) -> &mut Self {
        self.write_i32(Self::MAX_THREADS_PER_BLOCK_OFFSET, threads);
        self
    }

    pub fn set_multi_processor_count(&mut self, count: i32) -> &mut Self {
        self.write_i32(Self::MULTI_PROCESSOR_COUNT_OFFSET, count);
        self
    }

    pub fn set_max_threads_per_multiprocessor(&mut self, threads: i32) -> &mut Self {
        self.write_i32(Self::MAX_THREADS_PER_MULTIPROCESSOR_OFFSET, threads);
        self
    }

    pub fn set_can_map_host_memory(&mut self, can_map: bool) -> &mut Self {
        self.write_i32(Self::CAN_MAP_HOST_MEMORY_OFFSET, can_map as i32);
        self
    }

    pub fn set_texture_pitch_alignment(&mut self, alignment: usize) -> &mut Self {
        self.write_u64(Self::TEXTURE_PITCH_ALIGNMENT_OFFSET, alignment as u64);
        self
    }
}

impl Default for HipDeviceProp {
    fn default() -> Self {
        HipDeviceProp {
            buffer: [0u8; HIP_DEVICE_PROP_SIZE],
        }
    }
}

impl std::fmt::Debug for HipDeviceProp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HipDeviceProp")
            .field("name", &self.name())
            .field("gcn_arch_name", &self.gcn_arch_name())
            .field("major", &self.major())
            .field("minor", &self.minor())
            .field("compute_units", &self.multi_processor_count())
            .field("total_global_mem", &self.total_global_mem())
            .finish()
    }
}

/// Oldest compute capability the renderer kernels run on (Vega/GCN5)
pub const MIN_COMPUTE_MAJOR: i32 = 9;

/// Decoded, owned view of the properties the device layer cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCapabilities {
    pub name: String,
    /// Architecture without target feature suffixes, e.g. "gfx90a"
    pub gcn_arch: String,
    pub major: i32,
    pub minor: i32,
    /// `major * 100 + minor * 10`, used in kernel file names
    pub architecture: i32,
    pub compute_units: i32,
    pub warp_size: i32,
    pub max_threads_per_block: i32,
    pub max_threads_per_multiprocessor: i32,
    pub total_memory: u64,
    pub can_map_host_memory: bool,
    pub texture_pitch_alignment: usize,
}

impl DeviceCapabilities {
    pub fn from_props(props: &HipDeviceProp) -> Self {
        let major = props.major();
        let minor = props.minor();
        DeviceCapabilities {
            name: props.name(),
            gcn_arch: strip_arch_features(&props.gcn_arch_name()),
            major,
            minor,
            architecture: major * 100 + minor * 10,
            compute_units: props.multi_processor_count(),
            warp_size: props.warp_size(),
            max_threads_per_block: props.max_threads_per_block(),
            max_threads_per_multiprocessor: props.max_threads_per_multiprocessor(),
            total_memory: props.total_global_mem(),
            can_map_host_memory: props.can_map_host_memory(),
            texture_pitch_alignment: props.texture_pitch_alignment(),
        }
    }

    /// GCN5 (Vega) or newer
    pub fn is_supported(&self) -> bool {
        self.major >= MIN_COMPUTE_MAJOR
    }

    /// gfx103x (RDNA2) or gfx11xx and later
    pub fn is_rdna2_or_newer(&self) -> bool {
        self.major > 10 || (self.major == 10 && self.minor >= 3)
    }

    /// Message recorded when [`Self::is_supported`] is false
    pub fn unsupported_message(&self) -> String {
        format!(
            "HIP backend requires AMD RDNA graphics card or up, but found {}.",
            self.name
        )
    }
}

/// Drop target feature flags: "gfx90a:sramecc+:xnack-" -> "gfx90a"
pub fn strip_arch_features(arch: &str) -> String {
    arch.split(':').next().unwrap_or_default().to_string()
}

/// One row of the device listing
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub ordinal: i32,
    pub id: String,
    pub name: String,
    pub gcn_arch: String,
    pub supported: bool,
    /// Whether the device drives a display; not exposed by HIP
    pub display_device: bool,
    pub capabilities: DeviceCapabilities,
}

/// List every device the driver reports.
///
/// A device whose properties cannot be queried is skipped with a warning.
pub fn enumerate_devices(driver: &dyn HipDriver) -> Vec<DeviceInfo> {
    let count = match driver.device_count() {
        Ok(count) => count,
        Err(code) => {
            tracing::warn!(
                "enumerate_devices: hipGetDeviceCount failed: {}",
                driver.error_name(code)
            );
            return Vec::new();
        }
    };

    (0..count)
        .filter_map(|ordinal| match driver.device_properties(ordinal) {
            Ok(props) => {
                let capabilities = DeviceCapabilities::from_props(&props);
                Some(DeviceInfo {
                    ordinal,
                    id: format!("HIP_{}_{}", capabilities.name, ordinal),
                    name: capabilities.name.clone(),
                    gcn_arch: capabilities.gcn_arch.clone(),
                    supported: capabilities.is_supported(),
                    display_device: false,
                    capabilities,
                })
            }
            Err(code) => {
                tracing::warn!(
                    "enumerate_devices: skipping device {}: {}",
                    ordinal,
                    driver.error_name(code)
                );
                None
            }
        })
        .collect()
}

/// True when the global shim initializes and at least one device is present
pub fn hip_available() -> bool {
    if hipew::init(0) != HipewStatus::Success {
        return false;
    }
    match hipew::global().driver() {
        Some(driver) => driver.device_count().map(|n| n > 0).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::hip_backend::ffi;
    use crate::backend::hip_backend::mock::MockDriver;

    #[test]
    fn test_struct_size_matches_c() {
        assert_eq!(std::mem::size_of::<HipDeviceProp>(), 1472);
    }

    #[test]
    fn test_field_round_trip_at_offsets() {
        let mut props = HipDeviceProp::default();
        props
            .set_name("AMD Radeon RX 7900 XTX")
            .set_gcn_arch_name("gfx1100")
            .set_compute_capability(11, 0)
            .set_total_global_mem(24 << 30)
            .set_multi_processor_count(48)
            .set_max_threads_per_multiprocessor(2048)
            .set_can_map_host_memory(true);

        assert_eq!(props.name(), "AMD Radeon RX 7900 XTX");
        assert_eq!(props.major(), 11);
        assert_eq!(props.minor(), 0);
        assert_eq!(props.total_global_mem(), 24 << 30);
        assert_eq!(props.multi_processor_count(), 48);
        assert!(props.can_map_host_memory());

        // Check the raw layout, not just the accessors
        let raw = &props.buffer;
        assert_eq!(&raw[1160..1167], b"gfx1100");
        assert_eq!(i32::from_ne_bytes([raw[360], raw[361], raw[362], raw[363]]), 11);
        assert_eq!(i32::from_ne_bytes([raw[388], raw[389], raw[390], raw[391]]), 48);
    }

    #[test]
    fn test_capabilities() {
        let mut props = HipDeviceProp::default();
        props
            .set_name("AMD Instinct MI210")
            .set_gcn_arch_name("gfx90a:sramecc+:xnack-")
            .set_compute_capability(9, 0);
        let caps = DeviceCapabilities::from_props(&props);
        assert_eq!(caps.gcn_arch, "gfx90a");
        assert_eq!(caps.architecture, 900);
        assert!(caps.is_supported());
        assert!(!caps.is_rdna2_or_newer());

        props.set_compute_capability(10, 3);
        assert!(DeviceCapabilities::from_props(&props).is_rdna2_or_newer());
        props.set_compute_capability(11, 0);
        assert!(DeviceCapabilities::from_props(&props).is_rdna2_or_newer());

        props.set_name("Radeon RX 580").set_compute_capability(8, 0);
        let old = DeviceCapabilities::from_props(&props);
        assert!(!old.is_supported());
        assert_eq!(
            old.unsupported_message(),
            "HIP backend requires AMD RDNA graphics card or up, but found Radeon RX 580."
        );
    }

    #[test]
    fn test_enumerate_skips_failing_devices() {
        let driver = MockDriver::new();
        driver.add_device(MockDriver::default_props("Radeon Pro W7800", "gfx1100", 11, 0));
        assert_eq!(enumerate_devices(&driver).len(), 2);

        driver.fail_next("hipGetDevicePropertiesR0600", ffi::hipErrorInvalidDevice);
        let devices = enumerate_devices(&driver);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ordinal, 1);
        assert_eq!(devices[0].name, "Radeon Pro W7800");
        assert!(devices[0].supported);

        driver.fail_next("hipGetDeviceCount", ffi::hipErrorNoDevice);
        assert!(enumerate_devices(&driver).is_empty());
    }
}
