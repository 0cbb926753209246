//! Shared fixtures for integration tests
//!
//! Most tests run against [`MockDriver`] and need no hardware. Tests that
//! talk to a real GPU go through [`GPU_FIXTURE`], which is `None` when HIP
//! or a device is missing so those tests skip instead of failing.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rocm_device::backend::mock::MockDriver;
use rocm_device::backend::{hip_available, DeviceKernel, HipDevice};
use rocm_device::{DeviceConfig, KernelFeatures};
pub use serial_test::serial;

pub const MIB: usize = 1024 * 1024;

/// A mock-backed device whose kernel module lives in a temporary directory
pub struct MockFixture {
    pub driver: Arc<MockDriver>,
    pub device: Arc<HipDevice>,
    _kernel_dir: tempfile::TempDir,
}

impl MockFixture {
    /// Device with no kernels loaded yet
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_kernels(
            config,
            &[
                DeviceKernel::IntegratorInitFromCamera,
                DeviceKernel::IntegratorQueuedPathsArray,
                DeviceKernel::PrefixSum,
            ],
        )
    }

    /// Device whose module defines exactly `kernels`
    pub fn with_kernels(config: DeviceConfig, kernels: &[DeviceKernel]) -> Self {
        let driver = Arc::new(MockDriver::new());
        let kernel_dir = tempfile::tempdir().expect("temp dir");
        write_module(kernel_dir.path(), kernels);

        let device = HipDevice::new(
            driver.clone(),
            0,
            config
                .with_kernel_dir(kernel_dir.path())
                .with_cache_dir(kernel_dir.path().join("cache")),
        )
        .expect("mock device");

        MockFixture {
            driver,
            device,
            _kernel_dir: kernel_dir,
        }
    }

    /// Same as [`MockFixture::new`] with kernels already loaded
    pub fn loaded(config: DeviceConfig) -> Self {
        let fixture = Self::new(config);
        fixture
            .device
            .load_kernels(&KernelFeatures::NONE)
            .expect("load kernels");
        fixture
    }
}

/// Precompiled module for the mock's gfx1100 device
pub fn write_module(dir: &Path, kernels: &[DeviceKernel]) {
    let symbols: Vec<String> = kernels.iter().map(|k| k.symbol()).collect();
    std::fs::write(
        dir.join("kernel_gfx1100.fatbin"),
        MockDriver::module_image(&symbols),
    )
    .expect("write module image");
}

/// Global GPU test fixture
///
/// Initialized once and shared; `None` when no usable HIP device exists.
pub static GPU_FIXTURE: Lazy<Option<GpuTestFixture>> = Lazy::new(|| {
    if !hip_available() {
        eprintln!("WARNING: no HIP device available - skipping GPU tests");
        return None;
    }
    match HipDevice::open(0, DeviceConfig::default()) {
        Ok(device) => {
            let (free, _) = device.mem_info().ok()?;
            Some(GpuTestFixture {
                device,
                initial_free: free,
            })
        }
        Err(e) => {
            eprintln!("WARNING: failed to open HIP device 0: {} - skipping GPU tests", e);
            None
        }
    }
});

pub struct GpuTestFixture {
    device: Arc<HipDevice>,
    initial_free: usize,
}

impl GpuTestFixture {
    pub fn device(&self) -> &Arc<HipDevice> {
        &self.device
    }

    /// Fail when free memory dropped by more than `tolerance_percent`
    pub fn assert_no_leak(&self, tolerance_percent: usize) {
        let (free, total) = self.device.mem_info().expect("hipMemGetInfo");
        let leaked = self.initial_free.saturating_sub(free);
        let tolerance = total / 100 * tolerance_percent;
        assert!(
            leaked <= tolerance,
            "leaked {} MiB (tolerance {} MiB)",
            leaked / MIB,
            tolerance / MIB
        );
    }
}
