//! Kernel cache: nothing is available before load, and afterwards exactly
//! the kernels the module defines.

mod common;

use std::sync::Arc;

use common::{serial, MockFixture};
use rocm_device::backend::ffi;
use rocm_device::backend::mock::MockDriver;
use rocm_device::backend::{HipDeviceKernels, HipModule, KernelCacheState, KernelCompiler};
use rocm_device::{DeviceConfig, DeviceKernel, HipDevice, HipError, KernelFeatures};

#[test]
fn test_nothing_available_before_load() {
    let fixture = MockFixture::new(DeviceConfig::default());
    for &kernel in DeviceKernel::ALL {
        assert!(!fixture.device.kernel_available(kernel), "{} available before load", kernel);
    }
    assert!(fixture.device.kernels().is_err());
}

#[test]
fn test_exactly_module_kernels_after_load() {
    let defined = [
        DeviceKernel::IntegratorInitFromCamera,
        DeviceKernel::FilmConvertDepth,
        DeviceKernel::FilterColorPreprocess,
    ];
    let fixture = MockFixture::with_kernels(DeviceConfig::default(), &defined);
    fixture.device.load_kernels(&KernelFeatures::NONE).unwrap();

    for &kernel in DeviceKernel::ALL {
        assert_eq!(
            fixture.device.kernel_available(kernel),
            defined.contains(&kernel),
            "{}",
            kernel
        );
    }
    let kernels = fixture.device.kernels().unwrap();
    assert_eq!(kernels.num_available(), defined.len());
    assert_eq!(kernels.state(), KernelCacheState::Loaded);

    let entry = kernels.get(DeviceKernel::FilmConvertDepth).unwrap();
    assert!(!entry.function.is_null());
    assert!(entry.num_threads_per_block > 0);
}

#[test]
fn test_megakernel_is_never_resolved() {
    let fixture = MockFixture::with_kernels(
        DeviceConfig::default(),
        &[DeviceKernel::IntegratorMegakernel, DeviceKernel::PrefixSum],
    );
    fixture.device.load_kernels(&KernelFeatures::NONE).unwrap();
    assert!(!fixture.device.kernel_available(DeviceKernel::IntegratorMegakernel));
    assert!(fixture.device.kernel_available(DeviceKernel::PrefixSum));
}

#[test]
fn test_cache_filled_directly_from_module() {
    let driver = Arc::new(MockDriver::new());
    let device = HipDevice::new(driver.clone(), 0, DeviceConfig::default()).unwrap();
    let _scope = rocm_device::HipContextScope::new(&device);

    let image = MockDriver::module_image(&[DeviceKernel::PrefixSum.symbol()]);
    let module = HipModule::load_from_data(driver.clone(), &image).unwrap();

    let mut kernels = HipDeviceKernels::new();
    assert!(!kernels.available(DeviceKernel::PrefixSum));
    assert_eq!(kernels.load(driver.as_ref(), module.handle()), 1);
    assert!(kernels.available(DeviceKernel::PrefixSum));
    assert!(kernels.get(DeviceKernel::FilmConvertDepth).is_none());
}

#[test]
fn test_occupancy_failure_only_drops_that_kernel() {
    let fixture = MockFixture::with_kernels(
        DeviceConfig::default(),
        &[DeviceKernel::IntegratorInitFromCamera, DeviceKernel::PrefixSum],
    );
    // Kernels resolve in declaration order: the camera kernel comes first
    fixture
        .driver
        .fail_next("hipModuleOccupancyMaxPotentialBlockSize", ffi::hipErrorInvalidDeviceFunction);
    fixture.device.load_kernels(&KernelFeatures::NONE).unwrap();

    assert!(!fixture.device.kernel_available(DeviceKernel::IntegratorInitFromCamera));
    assert!(fixture.device.kernel_available(DeviceKernel::PrefixSum));
    assert!(!fixture.device.have_error());
}

#[test]
#[serial]
fn test_missing_binary_without_compiler_fails() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::new());
    let config = DeviceConfig::default()
        .with_kernel_dir(dir.path().join("none"))
        .with_kernel_source_dir(dir.path().join("src"))
        .with_cache_dir(dir.path().join("cache"));
    let device = HipDevice::new(driver.clone(), 0, config).unwrap();

    std::env::set_var("HIPCC", dir.path().join("no-such-hipcc"));
    let err = device.load_kernels(&KernelFeatures::NONE).unwrap_err();
    std::env::remove_var("HIPCC");

    assert!(matches!(err, HipError::KernelCompileFailed(_)));
    assert!(device.have_error());
    assert!(device.kernels().is_err());
    assert_eq!(driver.call_count("hipModuleLoadData"), 0);
}

#[test]
fn test_adaptive_compile_uses_cached_binary() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src").join("device").join("hip")).unwrap();
    std::fs::write(
        dir.path().join("src").join("device").join("hip").join("kernel.cpp"),
        "// kernels\n",
    )
    .unwrap();

    let config = DeviceConfig::default()
        .with_adaptive_compile(true)
        .with_kernel_dir(dir.path().join("prebuilt"))
        .with_kernel_source_dir(dir.path().join("src"))
        .with_cache_dir(dir.path().join("cache"));
    let features = KernelFeatures::PATH_TRACING | KernelFeatures::HAIR;

    // A precompiled binary must be ignored in adaptive mode
    std::fs::create_dir_all(dir.path().join("prebuilt")).unwrap();
    common::write_module(&dir.path().join("prebuilt"), &[DeviceKernel::FilmConvertDepth]);

    let cached = KernelCompiler::from_config(&config).cache_path("kernel", "gfx1100", &features);
    std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
    std::fs::write(&cached, MockDriver::module_image(&[DeviceKernel::PrefixSum.symbol()])).unwrap();

    let driver = Arc::new(MockDriver::new());
    let device = HipDevice::new(driver, 0, config).unwrap();
    device.load_kernels(&features).unwrap();

    assert!(device.kernel_available(DeviceKernel::PrefixSum));
    assert!(!device.kernel_available(DeviceKernel::FilmConvertDepth));
}
